//! Conflict resolution policies.
//!
//! When automated convergence is not wanted, the negotiation engine hands
//! the contested claims of every participant to a
//! [`ConflictResolutionStrategy`]. Strategies are looked up by name in a
//! [`ResolutionRegistry`], so new policies can be added without touching
//! the engine.

use crate::negotiation::strategy::{normalize_name, normalized_weights};
use crate::negotiation::{allocation_payload, Negotiation};
use crate::types::{AgentId, AllocationMap, CollectiveError, Payload, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

/// View of a negotiation handed to a resolution strategy.
#[derive(Debug, Clone, Copy)]
pub struct ConflictContext<'a> {
    pub negotiation: &'a Negotiation,
}

impl<'a> ConflictContext<'a> {
    pub fn new(negotiation: &'a Negotiation) -> Self {
        Self { negotiation }
    }

    /// What each participant claims of each resource.
    ///
    /// A participant's claim is what it allotted itself in its latest
    /// proposal. Without one it claims the full total of every resource it
    /// has a positive weight for.
    pub fn claims(&self) -> AllocationMap {
        let n = self.negotiation;
        let mut claims = AllocationMap::new();

        for id in n.participant_ids() {
            let proposed = n
                .latest_proposal_of(&id)
                .and_then(|p| p.allocation())
                .and_then(|mut a| a.remove(&id));
            let weights = n.weights_of(&id);

            let held: BTreeMap<String, f64> = n
                .resources
                .iter()
                .map(|(resource, total)| {
                    let claim = match &proposed {
                        Some(own) => own.get(resource).copied().unwrap_or(0.0),
                        None if weights.get(resource).copied().unwrap_or(0.0) > 0.0 => *total,
                        None => 0.0,
                    };
                    (resource.clone(), claim.clamp(0.0, *total))
                })
                .collect();
            claims.insert(id, held);
        }
        claims
    }
}

/// A decided allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Name of the strategy that decided
    pub strategy: String,
    pub allocation: AllocationMap,
    /// Participant that won outright, if the strategy picks one
    pub winner: Option<AgentId>,
}

impl Resolution {
    /// Agreement terms recorded as the negotiation outcome.
    pub fn into_payload(self) -> Payload {
        let mut payload = allocation_payload(&self.allocation);
        payload.insert("resolved_by".to_string(), Value::String(self.strategy));
        if let Some(winner) = self.winner {
            payload.insert("winner".to_string(), Value::String(winner));
        }
        payload
    }
}

/// A named policy that forces an allocation.
pub trait ConflictResolutionStrategy: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Decide an allocation, or `None` when the policy cannot decide.
    fn resolve(&self, ctx: &ConflictContext<'_>) -> Option<Resolution>;
}

/// The highest declared priority wins contested resources outright.
///
/// Without declared priorities participants are served in registration
/// order, then declaration order for unregistered ones. Tied top
/// priorities cannot be decided.
#[derive(Debug, Default, Clone, Copy)]
pub struct PriorityBasedResolution;

impl ConflictResolutionStrategy for PriorityBasedResolution {
    fn name(&self) -> &str {
        "priority_based"
    }

    fn resolve(&self, ctx: &ConflictContext<'_>) -> Option<Resolution> {
        let n = ctx.negotiation;
        let mut order: Vec<(usize, &crate::negotiation::ParticipantProfile)> =
            n.participants.iter().enumerate().collect();
        order.sort_by(|a, b| {
            b.1.priority
                .cmp(&a.1.priority)
                .then_with(|| {
                    let seq = |p: &crate::negotiation::ParticipantProfile| {
                        p.registration_seq.unwrap_or(u64::MAX)
                    };
                    seq(a.1).cmp(&seq(b.1))
                })
                .then_with(|| a.0.cmp(&b.0))
        });

        if let [first, second, ..] = order.as_slice() {
            if first.1.priority.is_some() && first.1.priority == second.1.priority {
                return None;
            }
        }

        let claims = ctx.claims();
        let mut allocation = AllocationMap::new();
        for (resource, total) in &n.resources {
            let mut remaining = *total;
            for (_, profile) in &order {
                let claim = claims
                    .get(&profile.agent_id)
                    .and_then(|c| c.get(resource))
                    .copied()
                    .unwrap_or(0.0);
                let granted = claim.min(remaining).max(0.0);
                remaining -= granted;
                allocation
                    .entry(profile.agent_id.clone())
                    .or_default()
                    .insert(resource.clone(), granted);
            }
        }

        Some(Resolution {
            strategy: self.name().to_string(),
            allocation,
            winner: order.first().map(|(_, p)| p.agent_id.clone()),
        })
    }
}

/// Contested resources are split in proportion to preference weights.
///
/// Uncontested resources go to their claimants as claimed.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompromiseResolution;

impl ConflictResolutionStrategy for CompromiseResolution {
    fn name(&self) -> &str {
        "compromise"
    }

    fn resolve(&self, ctx: &ConflictContext<'_>) -> Option<Resolution> {
        let n = ctx.negotiation;
        let ids = n.participant_ids();
        let claims = ctx.claims();
        let weights: BTreeMap<&str, BTreeMap<String, f64>> = ids
            .iter()
            .map(|id| (id.as_str(), normalized_weights(n, id)))
            .collect();

        let mut allocation = AllocationMap::new();
        for (resource, total) in &n.resources {
            let claim_of = |id: &str| {
                claims
                    .get(id)
                    .and_then(|c| c.get(resource))
                    .copied()
                    .unwrap_or(0.0)
            };
            let weight_of = |id: &str| {
                weights
                    .get(id)
                    .and_then(|w| w.get(resource))
                    .copied()
                    .unwrap_or(0.0)
            };

            let claimed: f64 = ids.iter().map(|id| claim_of(id)).sum();
            let weighted: f64 = ids.iter().map(|id| weight_of(id)).sum();

            for id in &ids {
                let amount = if claimed <= *total {
                    claim_of(id)
                } else if weighted > 0.0 {
                    total * weight_of(id) / weighted
                } else {
                    total * claim_of(id) / claimed
                };
                allocation
                    .entry(id.clone())
                    .or_default()
                    .insert(resource.clone(), amount);
            }
        }

        Some(Resolution {
            strategy: self.name().to_string(),
            allocation,
            winner: None,
        })
    }
}

/// Name → conflict resolution strategy.
#[derive(Debug, Clone)]
pub struct ResolutionRegistry {
    strategies: HashMap<String, Arc<dyn ConflictResolutionStrategy>>,
}

impl Default for ResolutionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ResolutionRegistry {
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Registry holding `priority_based` and `compromise`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PriorityBasedResolution));
        registry.register(Arc::new(CompromiseResolution));
        registry
    }

    /// Add or replace a strategy under its own name.
    pub fn register(&mut self, strategy: Arc<dyn ConflictResolutionStrategy>) {
        self.strategies
            .insert(normalize_name(strategy.name()), strategy);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ConflictResolutionStrategy>> {
        self.strategies
            .get(&normalize_name(name))
            .cloned()
            .ok_or_else(|| CollectiveError::UnknownStrategy {
                kind: "resolution",
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::{NegotiationSpec, NegotiationType, ParticipantProfile};
    use crate::types::TaskPriority;
    use chrono::Utc;

    fn negotiation(a: ParticipantProfile, b: ParticipantProfile) -> Negotiation {
        let spec = NegotiationSpec::new(NegotiationType::ConflictResolution, a.agent_id.clone())
            .with_participant(a)
            .with_participant(b)
            .with_resource("cpu", 100.0)
            .with_resource("memory", 40.0);
        Negotiation::from_spec(spec, 3, Utc::now()).unwrap()
    }

    #[test]
    fn test_priority_winner_takes_contested() {
        let n = negotiation(
            ParticipantProfile::new("a").with_priority(TaskPriority::Normal),
            ParticipantProfile::new("b").with_priority(TaskPriority::High),
        );
        let resolution = PriorityBasedResolution
            .resolve(&ConflictContext::new(&n))
            .unwrap();

        assert_eq!(resolution.winner.as_deref(), Some("b"));
        assert_eq!(resolution.allocation["b"]["cpu"], 100.0);
        assert_eq!(resolution.allocation["a"]["cpu"], 0.0);
    }

    #[test]
    fn test_priority_tie_cannot_decide() {
        let n = negotiation(
            ParticipantProfile::new("a").with_priority(TaskPriority::High),
            ParticipantProfile::new("b").with_priority(TaskPriority::High),
        );
        assert!(PriorityBasedResolution
            .resolve(&ConflictContext::new(&n))
            .is_none());
    }

    #[test]
    fn test_priority_falls_back_to_declaration_order() {
        let n = negotiation(ParticipantProfile::new("a"), ParticipantProfile::new("b"));
        let resolution = PriorityBasedResolution
            .resolve(&ConflictContext::new(&n))
            .unwrap();
        assert_eq!(resolution.winner.as_deref(), Some("a"));
        assert_eq!(resolution.allocation["a"]["memory"], 40.0);
    }

    #[test]
    fn test_priority_falls_back_to_registration_order() {
        // "b" was registered before "a" but is declared second
        let n = negotiation(
            ParticipantProfile::new("a").with_registration_seq(7),
            ParticipantProfile::new("b").with_registration_seq(2),
        );
        let resolution = PriorityBasedResolution
            .resolve(&ConflictContext::new(&n))
            .unwrap();
        assert_eq!(resolution.winner.as_deref(), Some("b"));
        assert_eq!(resolution.allocation["b"]["cpu"], 100.0);
        assert_eq!(resolution.allocation["a"]["cpu"], 0.0);
    }

    #[test]
    fn test_declared_priority_beats_registration_order() {
        let n = negotiation(
            ParticipantProfile::new("a")
                .with_registration_seq(7)
                .with_priority(TaskPriority::High),
            ParticipantProfile::new("b").with_registration_seq(2),
        );
        let resolution = PriorityBasedResolution
            .resolve(&ConflictContext::new(&n))
            .unwrap();
        assert_eq!(resolution.winner.as_deref(), Some("a"));
    }

    #[test]
    fn test_compromise_splits_by_weight() {
        let n = negotiation(
            ParticipantProfile::new("a")
                .with_preference("cpu", 3.0)
                .with_preference("memory", 1.0),
            ParticipantProfile::new("b")
                .with_preference("cpu", 1.0)
                .with_preference("memory", 3.0),
        );
        let resolution = CompromiseResolution
            .resolve(&ConflictContext::new(&n))
            .unwrap();

        assert!((resolution.allocation["a"]["cpu"] - 75.0).abs() < 1e-9);
        assert!((resolution.allocation["b"]["memory"] - 30.0).abs() < 1e-9);

        let payload = resolution.into_payload();
        assert_eq!(payload["resolved_by"], "compromise");
        assert!(payload.contains_key("allocation"));
    }

    #[test]
    fn test_compromise_honours_uncontested_claims() {
        let n = negotiation(
            ParticipantProfile::new("a").with_preference("cpu", 1.0),
            ParticipantProfile::new("b").with_preference("memory", 1.0),
        );
        let resolution = CompromiseResolution
            .resolve(&ConflictContext::new(&n))
            .unwrap();

        assert_eq!(resolution.allocation["a"]["cpu"], 100.0);
        assert_eq!(resolution.allocation["b"]["memory"], 40.0);
        assert_eq!(resolution.allocation["a"]["memory"], 0.0);
    }

    #[test]
    fn test_registry_resolves_names() {
        let registry = ResolutionRegistry::with_defaults();
        assert_eq!(registry.get("priority-based").unwrap().name(), "priority_based");
        assert!(registry.get("coin_flip").is_err());
    }
}
