//! Proposal generation strategies for automated participants.
//!
//! Strategies are registered by name in a [`ProposalStrategyRegistry`] and
//! resolved once per call site. Each strategy also fixes how demanding its
//! participants are: a proposal is acceptable when its utility reaches the
//! strategy's factor times the fair share `1/n`.

use super::Negotiation;
use crate::types::{AgentId, AllocationMap, CollectiveError, Result};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

/// Slack for floating-point acceptance comparisons.
const ACCEPT_TOLERANCE: f64 = 1e-9;

/// Extra share of a preferred resource the competitive strategy claims in
/// the first round, as a fraction of what lies above the fair share.
const COMPETITIVE_CLAIM: f64 = 0.4;

/// Inputs to proposal generation.
#[derive(Debug, Clone, Copy)]
pub struct ProposalContext<'a> {
    pub negotiation: &'a Negotiation,
    pub proposer: &'a str,
}

impl<'a> ProposalContext<'a> {
    pub fn new(negotiation: &'a Negotiation, proposer: &'a str) -> Self {
        Self {
            negotiation,
            proposer,
        }
    }

    /// Fraction of the round budget used so far.
    pub fn progress(&self) -> f64 {
        self.negotiation.progress()
    }
}

/// A named way of producing allocations and judging them.
pub trait ProposalStrategy: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Multiple of the fair share a participant must receive to accept.
    fn fair_share_factor(&self) -> f64;

    fn acceptance_threshold(&self, participants: usize) -> f64 {
        self.fair_share_factor() / participants.max(1) as f64
    }

    /// Whether a utility clears the acceptance threshold.
    fn accepts(&self, utility: f64, participants: usize) -> bool {
        utility + ACCEPT_TOLERANCE >= self.acceptance_threshold(participants)
    }

    /// Allocation the proposer puts forward.
    fn allocate(&self, ctx: &ProposalContext<'_>) -> AllocationMap;
}

/// Splits every resource in proportion to participants' preference weights.
#[derive(Debug, Default, Clone, Copy)]
pub struct CooperativeStrategy;

impl ProposalStrategy for CooperativeStrategy {
    fn name(&self) -> &str {
        "cooperative"
    }

    fn fair_share_factor(&self) -> f64 {
        0.8
    }

    fn allocate(&self, ctx: &ProposalContext<'_>) -> AllocationMap {
        weighted_split(ctx.negotiation)
    }
}

/// Splits every resource equally.
#[derive(Debug, Default, Clone, Copy)]
pub struct BalancedStrategy;

impl ProposalStrategy for BalancedStrategy {
    fn name(&self) -> &str {
        "balanced"
    }

    fn fair_share_factor(&self) -> f64 {
        1.0
    }

    fn allocate(&self, ctx: &ProposalContext<'_>) -> AllocationMap {
        equal_split(ctx.negotiation)
    }
}

/// Claims more of the proposer's preferred resources, conceding toward the
/// fair share as rounds advance.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompetitiveStrategy;

impl ProposalStrategy for CompetitiveStrategy {
    fn name(&self) -> &str {
        "competitive"
    }

    fn fair_share_factor(&self) -> f64 {
        1.2
    }

    fn allocate(&self, ctx: &ProposalContext<'_>) -> AllocationMap {
        let negotiation = ctx.negotiation;
        let ids = negotiation.participant_ids();
        let n = ids.len().max(1) as f64;
        let fair = 1.0 / n;
        let claim = fair + (1.0 - fair) * COMPETITIVE_CLAIM * (1.0 - ctx.progress());

        let weights = negotiation.weights_of(ctx.proposer);
        let mean_weight = weights.values().sum::<f64>() / weights.len().max(1) as f64;

        let mut allocation = empty_allocation(&ids);
        for (resource, total) in &negotiation.resources {
            let preferred = weights.get(resource).copied().unwrap_or(0.0) >= mean_weight;
            if !preferred || ids.len() < 2 {
                for id in &ids {
                    put(&mut allocation, id, resource, total / n);
                }
                continue;
            }

            let others_share = (1.0 - claim) / (n - 1.0);
            for id in &ids {
                let share = if id == ctx.proposer { claim } else { others_share };
                put(&mut allocation, id, resource, total * share);
            }
        }
        allocation
    }
}

/// Name → proposal strategy.
#[derive(Debug, Clone)]
pub struct ProposalStrategyRegistry {
    strategies: HashMap<String, Arc<dyn ProposalStrategy>>,
}

impl Default for ProposalStrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ProposalStrategyRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Registry holding `cooperative`, `balanced` and `competitive`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CooperativeStrategy));
        registry.register(Arc::new(BalancedStrategy));
        registry.register(Arc::new(CompetitiveStrategy));
        registry
    }

    /// Add or replace a strategy under its own name.
    pub fn register(&mut self, strategy: Arc<dyn ProposalStrategy>) {
        self.strategies
            .insert(normalize_name(strategy.name()), strategy);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ProposalStrategy>> {
        self.strategies
            .get(&normalize_name(name))
            .cloned()
            .ok_or_else(|| CollectiveError::UnknownStrategy {
                kind: "proposal",
                name: name.to_string(),
            })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.keys().cloned().collect();
        names.sort();
        names
    }
}

pub(crate) fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace('-', "_")
}

fn empty_allocation(ids: &[AgentId]) -> AllocationMap {
    ids.iter()
        .map(|id| (id.clone(), BTreeMap::new()))
        .collect()
}

fn put(allocation: &mut AllocationMap, participant: &str, resource: &str, amount: f64) {
    allocation
        .entry(participant.to_string())
        .or_default()
        .insert(resource.to_string(), amount.max(0.0));
}

fn held(allocation: &AllocationMap, participant: &str, resource: &str) -> f64 {
    allocation
        .get(participant)
        .and_then(|h| h.get(resource))
        .copied()
        .unwrap_or(0.0)
}

/// Every declared resource split equally among participants.
pub fn equal_split(negotiation: &Negotiation) -> AllocationMap {
    let ids = negotiation.participant_ids();
    let n = ids.len().max(1) as f64;
    let mut allocation = empty_allocation(&ids);
    for (resource, total) in &negotiation.resources {
        for id in &ids {
            put(&mut allocation, id, resource, total / n);
        }
    }
    allocation
}

/// Every declared resource split in proportion to each participant's
/// normalized preference weight for it.
pub fn weighted_split(negotiation: &Negotiation) -> AllocationMap {
    let ids = negotiation.participant_ids();
    let n = ids.len().max(1) as f64;
    let normalized: BTreeMap<&str, BTreeMap<String, f64>> = ids
        .iter()
        .map(|id| (id.as_str(), normalized_weights(negotiation, id)))
        .collect();

    let mut allocation = empty_allocation(&ids);
    for (resource, total) in &negotiation.resources {
        let share_of = |id: &str| {
            normalized
                .get(id)
                .and_then(|w| w.get(resource))
                .copied()
                .unwrap_or(0.0)
        };
        let sum: f64 = ids.iter().map(|id| share_of(id)).sum();
        for id in &ids {
            let amount = if sum > 0.0 {
                total * share_of(id) / sum
            } else {
                total / n
            };
            put(&mut allocation, id, resource, amount);
        }
    }
    allocation
}

/// Preference weights scaled to sum to 1.
pub fn normalized_weights(negotiation: &Negotiation, participant_id: &str) -> BTreeMap<String, f64> {
    let weights = negotiation.weights_of(participant_id);
    let sum: f64 = weights.values().sum();
    if sum <= 0.0 {
        return weights;
    }
    weights.into_iter().map(|(r, w)| (r, w / sum)).collect()
}

/// Resources ordered by a participant's weight, highest first, then name.
fn by_weight(negotiation: &Negotiation, participant_id: &str) -> Vec<(String, f64)> {
    let mut weights: Vec<(String, f64)> = negotiation.weights_of(participant_id).into_iter().collect();
    weights.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    weights
}

/// Counter-proposal that moves the participant's highest-weight
/// under-allocated resource toward its weight-proportional target.
///
/// At most `step` of the resource's total changes hands, taken from the
/// other participants in proportion to what they hold. Returns `None` when
/// nothing can be moved.
pub fn counter_proposal(
    negotiation: &Negotiation,
    participant_id: &str,
    allocation: &AllocationMap,
    step: f64,
) -> Option<AllocationMap> {
    let targets = weighted_split(negotiation);
    let ids = negotiation.participant_ids();

    for (resource, weight) in by_weight(negotiation, participant_id) {
        let total = negotiation.resources.get(&resource).copied().unwrap_or(0.0);
        if weight <= 0.0 || total <= 0.0 {
            continue;
        }

        let current = held(allocation, participant_id, &resource);
        let target = held(&targets, participant_id, &resource);
        let others: Vec<(&AgentId, f64)> = ids
            .iter()
            .filter(|id| id.as_str() != participant_id)
            .map(|id| (id, held(allocation, id, &resource)))
            .collect();
        let others_held: f64 = others.iter().map(|(_, amount)| amount).sum();

        if current + ACCEPT_TOLERANCE >= target || others_held <= 0.0 {
            continue;
        }

        let delta = (target - current).min(step.max(0.0) * total).min(others_held);
        if delta <= 0.0 {
            continue;
        }

        let mut counter = allocation.clone();
        put(&mut counter, participant_id, &resource, current + delta);
        for (id, amount) in others {
            put(&mut counter, id, &resource, amount - delta * amount / others_held);
        }
        return Some(counter);
    }
    None
}

/// Concession that moves an agent's own claim on its most-weighted
/// contested resource toward the midpoint with a counterpart's offer.
///
/// The fraction of the gap conceded grows with `progress`.
pub fn concede(
    negotiation: &Negotiation,
    agent_id: &str,
    own: &AllocationMap,
    counterpart: &AllocationMap,
    progress: f64,
) -> Option<AllocationMap> {
    let fraction = (0.25 + progress.clamp(0.0, 1.0) * 0.75).min(1.0);
    let ids = negotiation.participant_ids();

    let (resource, _) = by_weight(negotiation, agent_id)
        .into_iter()
        .filter(|(_, weight)| *weight > 0.0)
        .find(|(resource, _)| {
            held(own, agent_id, resource) > held(counterpart, agent_id, resource) + ACCEPT_TOLERANCE
        })?;

    let claimed = held(own, agent_id, &resource);
    let offered = held(counterpart, agent_id, &resource);
    let midpoint = (claimed + offered) / 2.0;
    let conceded = claimed - (claimed - midpoint) * fraction;
    let freed = claimed - conceded;

    let others: Vec<&AgentId> = ids.iter().filter(|id| id.as_str() != agent_id).collect();
    if others.is_empty() {
        return None;
    }
    let offered_to_others: f64 = others
        .iter()
        .map(|id| held(counterpart, id, &resource))
        .sum();

    let mut concession = own.clone();
    put(&mut concession, agent_id, &resource, conceded);
    for id in others {
        let portion = if offered_to_others > 0.0 {
            held(counterpart, id, &resource) / offered_to_others
        } else {
            1.0 / (ids.len() - 1) as f64
        };
        let current = held(own, id, &resource);
        put(&mut concession, id, &resource, current + freed * portion);
    }
    Some(concession)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::{NegotiationSpec, NegotiationType, ParticipantProfile};
    use chrono::Utc;

    fn negotiation() -> Negotiation {
        let spec = NegotiationSpec::new(NegotiationType::ResourceAllocation, "a")
            .with_participant(
                ParticipantProfile::new("a")
                    .with_preference("cpu", 3.0)
                    .with_preference("memory", 1.0),
            )
            .with_participant(
                ParticipantProfile::new("b")
                    .with_preference("cpu", 1.0)
                    .with_preference("memory", 3.0),
            )
            .with_resource("cpu", 100.0)
            .with_resource("memory", 40.0)
            .with_max_rounds(4);
        Negotiation::from_spec(spec, 5, Utc::now()).unwrap()
    }

    fn total(allocation: &AllocationMap, resource: &str) -> f64 {
        allocation
            .values()
            .filter_map(|h| h.get(resource))
            .sum()
    }

    #[test]
    fn test_balanced_splits_equally() {
        let n = negotiation();
        let allocation = BalancedStrategy.allocate(&ProposalContext::new(&n, "a"));
        assert_eq!(allocation["a"]["cpu"], 50.0);
        assert_eq!(allocation["b"]["memory"], 20.0);
        assert!(BalancedStrategy.accepts(n.utility_of("b", &allocation), 2));
    }

    #[test]
    fn test_cooperative_follows_weights() {
        let n = negotiation();
        let allocation = CooperativeStrategy.allocate(&ProposalContext::new(&n, "a"));

        assert!((allocation["a"]["cpu"] - 75.0).abs() < 1e-9);
        assert!((allocation["b"]["memory"] - 30.0).abs() < 1e-9);
        assert!((total(&allocation, "cpu") - 100.0).abs() < 1e-9);

        // Both sides get 0.625 utility, above 0.8 * 1/2
        assert!(CooperativeStrategy.accepts(n.utility_of("a", &allocation), 2));
        assert!(CooperativeStrategy.accepts(n.utility_of("b", &allocation), 2));
    }

    #[test]
    fn test_competitive_claims_preferred_resource() {
        let mut n = negotiation();
        n.current_round = 0;
        let allocation = CompetitiveStrategy.allocate(&ProposalContext::new(&n, "a"));

        // 0.5 + 0.5 * 0.4 = 0.7 of cpu for the proposer
        assert!((allocation["a"]["cpu"] - 70.0).abs() < 1e-9);
        assert!((allocation["a"]["memory"] - 20.0).abs() < 1e-9);
        assert!((total(&allocation, "cpu") - 100.0).abs() < 1e-9);

        n.current_round = 4;
        let late = CompetitiveStrategy.allocate(&ProposalContext::new(&n, "a"));
        assert!((late["a"]["cpu"] - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ProposalStrategyRegistry::with_defaults();
        assert_eq!(registry.get("Balanced").unwrap().name(), "balanced");
        assert!(matches!(
            registry.get("greedy"),
            Err(CollectiveError::UnknownStrategy { kind: "proposal", .. })
        ));
        assert_eq!(registry.names(), vec!["balanced", "competitive", "cooperative"]);
    }

    #[test]
    fn test_counter_proposal_is_bounded() {
        let n = negotiation();
        let allocation = equal_split(&n);

        // a targets 75 cpu, holds 50, may move at most 10
        let counter = counter_proposal(&n, "a", &allocation, 0.1).unwrap();
        assert!((counter["a"]["cpu"] - 60.0).abs() < 1e-9);
        assert!((counter["b"]["cpu"] - 40.0).abs() < 1e-9);
        assert_eq!(counter["a"]["memory"], 20.0);

        let satisfied = weighted_split(&n);
        assert!(counter_proposal(&n, "a", &satisfied, 0.1).is_none());
    }

    #[test]
    fn test_concession_moves_toward_midpoint() {
        let n = negotiation();
        let own = weighted_split(&n);
        let counterpart = equal_split(&n);

        // a claims 75 cpu, b offers 50; midpoint 62.5, a concedes a quarter
        let concession = concede(&n, "a", &own, &counterpart, 0.0).unwrap();
        assert!((concession["a"]["cpu"] - 71.875).abs() < 1e-9);
        assert!((total(&concession, "cpu") - 100.0).abs() < 1e-9);

        let full = concede(&n, "a", &own, &counterpart, 1.0).unwrap();
        assert!((full["a"]["cpu"] - 62.5).abs() < 1e-9);

        assert!(concede(&n, "a", &counterpart, &counterpart, 0.5).is_none());
    }
}
