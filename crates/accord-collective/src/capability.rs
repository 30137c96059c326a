//! Agent capability registry.
//!
//! Holds the agent records supplied by the registration collaborator and
//! indexes them by capability and specialization. Lookups are filters: they
//! return empty sequences when nothing matches and only consider available
//! agents.

use crate::performance::PerformanceTracker;
use crate::types::{unit, AgentId, CapabilityName, CollectiveError, Result, Specialization};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// A registered agent and the facts team formation selects on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique agent identifier
    pub agent_id: AgentId,

    /// Human-readable name
    pub name: String,

    /// Capability name → proficiency level (0.0 to 1.0)
    pub capabilities: BTreeMap<CapabilityName, f32>,

    /// Domain specializations (e.g., "finance")
    #[serde(default)]
    pub specializations: BTreeSet<Specialization>,

    /// Whether the agent can be selected for new teams
    #[serde(default = "default_available")]
    pub available: bool,

    /// Performance rating (0.0 to 1.0)
    #[serde(default = "default_rating")]
    pub performance_rating: f32,

    /// Registration order, assigned by the registry
    #[serde(default)]
    pub registration_seq: u64,

    /// When the agent was registered
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,

    /// Last time the agent was placed on a team
    #[serde(default)]
    pub last_assigned_at: Option<DateTime<Utc>>,

    /// Number of forming or active teams the agent belongs to
    #[serde(default)]
    pub active_teams: u32,
}

fn default_available() -> bool {
    true
}

fn default_rating() -> f32 {
    0.5
}

impl Agent {
    /// Create a new available agent with a neutral rating.
    pub fn new(agent_id: impl Into<AgentId>, name: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            capabilities: BTreeMap::new(),
            specializations: BTreeSet::new(),
            available: true,
            performance_rating: default_rating(),
            registration_seq: 0,
            registered_at: Utc::now(),
            last_assigned_at: None,
            active_teams: 0,
        }
    }

    /// Add a capability at the given proficiency.
    pub fn with_capability(mut self, name: impl Into<CapabilityName>, level: f32) -> Self {
        self.capabilities.insert(name.into(), unit(level));
        self
    }

    /// Add a domain specialization.
    pub fn with_specialization(mut self, tag: impl Into<Specialization>) -> Self {
        self.specializations.insert(tag.into());
        self
    }

    /// Set the performance rating.
    pub fn with_rating(mut self, rating: f32) -> Self {
        self.performance_rating = unit(rating);
        self
    }

    /// Set availability.
    pub fn with_availability(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    /// Proficiency in a capability (0.0 if absent).
    pub fn level(&self, capability: &str) -> f32 {
        self.capabilities.get(capability).copied().unwrap_or(0.0)
    }

    /// Whether the agent meets a minimum level in a capability.
    pub fn meets(&self, capability: &str, min_level: f32) -> bool {
        self.capabilities
            .get(capability)
            .map(|level| *level >= min_level)
            .unwrap_or(false)
    }

    /// Whether the agent declares any of the given specializations.
    pub fn specializes_in_any(&self, tags: &BTreeSet<Specialization>) -> bool {
        !self.specializations.is_disjoint(tags)
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    agents: HashMap<AgentId, Agent>,
    /// capability → agent ids sorted by level descending, then id
    capability_index: HashMap<CapabilityName, Vec<AgentId>>,
    specialization_index: HashMap<Specialization, BTreeSet<AgentId>>,
    next_seq: u64,
}

impl RegistryState {
    fn index(&mut self, agent: &Agent) {
        for capability in agent.capabilities.keys() {
            let ids = self.capability_index.entry(capability.clone()).or_default();
            ids.push(agent.agent_id.clone());
            let agents = &self.agents;
            ids.sort_by(|a, b| {
                let level = |id: &AgentId| agents.get(id).map(|x| x.level(capability)).unwrap_or(0.0);
                level(b).total_cmp(&level(a)).then_with(|| a.cmp(b))
            });
        }
        for tag in &agent.specializations {
            self.specialization_index
                .entry(tag.clone())
                .or_default()
                .insert(agent.agent_id.clone());
        }
    }

    fn unindex(&mut self, agent: &Agent) {
        for capability in agent.capabilities.keys() {
            if let Some(ids) = self.capability_index.get_mut(capability) {
                ids.retain(|id| id != &agent.agent_id);
                if ids.is_empty() {
                    self.capability_index.remove(capability);
                }
            }
        }
        for tag in &agent.specializations {
            if let Some(ids) = self.specialization_index.get_mut(tag) {
                ids.remove(&agent.agent_id);
                if ids.is_empty() {
                    self.specialization_index.remove(tag);
                }
            }
        }
    }

    fn agent_mut(&mut self, agent_id: &str) -> Result<&mut Agent> {
        self.agents
            .get_mut(agent_id)
            .ok_or_else(|| CollectiveError::AgentNotFound(agent_id.to_string()))
    }
}

/// Indexed store of agent capabilities and specializations.
#[derive(Debug)]
pub struct CapabilityRegistry {
    state: RwLock<RegistryState>,
    tracker: Arc<PerformanceTracker>,
}

impl CapabilityRegistry {
    /// Create an empty registry whose ratings are read from `tracker`.
    pub fn new(tracker: Arc<PerformanceTracker>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            tracker,
        }
    }

    /// The performance tracker backing agent ratings.
    pub fn tracker(&self) -> &Arc<PerformanceTracker> {
        &self.tracker
    }

    /// Register an agent. Ids must be unique.
    pub fn register(&self, mut agent: Agent) -> Result<()> {
        let mut state = self.state.write();
        if state.agents.contains_key(&agent.agent_id) {
            return Err(CollectiveError::AgentAlreadyRegistered(agent.agent_id));
        }

        for level in agent.capabilities.values_mut() {
            *level = unit(*level);
        }
        agent.performance_rating = unit(agent.performance_rating);
        agent.registration_seq = state.next_seq;
        agent.registered_at = Utc::now();
        agent.active_teams = 0;
        state.next_seq += 1;

        self.tracker.seed(&agent.agent_id, agent.performance_rating);
        info!(
            agent_id = %agent.agent_id,
            capabilities = agent.capabilities.len(),
            "Registered agent"
        );

        state.agents.insert(agent.agent_id.clone(), agent.clone());
        state.index(&agent);
        Ok(())
    }

    /// Replace an agent's capability map.
    pub fn update_capabilities(
        &self,
        agent_id: &str,
        capabilities: BTreeMap<CapabilityName, f32>,
    ) -> Result<()> {
        let mut state = self.state.write();
        let previous = state.agent_mut(agent_id)?.clone();
        state.unindex(&previous);

        let agent = state.agent_mut(agent_id)?;
        agent.capabilities = capabilities
            .into_iter()
            .map(|(name, level)| (name, unit(level)))
            .collect();
        let updated = agent.clone();
        state.index(&updated);
        debug!(agent_id, "Updated agent capabilities");
        Ok(())
    }

    /// Mark an agent available or unavailable for new teams.
    pub fn set_availability(&self, agent_id: &str, available: bool) -> Result<()> {
        self.state.write().agent_mut(agent_id)?.available = available;
        Ok(())
    }

    /// Remove an agent. Refused while it belongs to an active team.
    pub fn deregister(&self, agent_id: &str) -> Result<Agent> {
        let mut state = self.state.write();
        let active_teams = state.agent_mut(agent_id)?.active_teams;
        if active_teams > 0 {
            return Err(CollectiveError::AgentInUse {
                agent_id: agent_id.to_string(),
                active_teams,
            });
        }

        let agent = state
            .agents
            .remove(agent_id)
            .ok_or_else(|| CollectiveError::AgentNotFound(agent_id.to_string()))?;
        state.unindex(&agent);
        self.tracker.forget(agent_id);
        info!(agent_id, "Deregistered agent");
        Ok(agent)
    }

    /// Record that agents were placed on a new team.
    pub fn mark_assigned(&self, agent_ids: &[AgentId], now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write();
        if let Some(missing) = agent_ids.iter().find(|id| !state.agents.contains_key(*id)) {
            return Err(CollectiveError::AgentNotFound(missing.clone()));
        }
        for agent_id in agent_ids {
            let agent = state.agent_mut(agent_id)?;
            agent.active_teams += 1;
            agent.last_assigned_at = Some(now);
        }
        Ok(())
    }

    /// Record that agents left a team. Unknown ids are ignored.
    pub fn release(&self, agent_ids: &[AgentId]) {
        let mut state = self.state.write();
        for agent_id in agent_ids {
            if let Some(agent) = state.agents.get_mut(agent_id) {
                agent.active_teams = agent.active_teams.saturating_sub(1);
            }
        }
    }

    /// Snapshot of one agent with its current rating.
    pub fn get(&self, agent_id: &str) -> Option<Agent> {
        self.state.read().agents.get(agent_id).map(|a| self.snapshot(a))
    }

    /// Snapshots of all agents, in registration order.
    pub fn agents(&self) -> Vec<Agent> {
        let state = self.state.read();
        let mut agents: Vec<Agent> = state.agents.values().map(|a| self.snapshot(a)).collect();
        agents.sort_by_key(|a| a.registration_seq);
        agents
    }

    /// Available agents, in registration order.
    pub fn available_agents(&self) -> Vec<Agent> {
        self.agents().into_iter().filter(|a| a.available).collect()
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.state.read().agents.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Available agents with at least `min_level` in a capability, highest level first.
    pub fn agents_with_capability(&self, capability: &str, min_level: f32) -> Vec<Agent> {
        let state = self.state.read();
        state
            .capability_index
            .get(capability)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.agents.get(id))
                    .filter(|a| a.available && a.meets(capability, min_level))
                    .map(|a| self.snapshot(a))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Available agents declaring every listed capability.
    pub fn agents_with_all_capabilities(&self, capabilities: &[CapabilityName]) -> Vec<Agent> {
        self.filter_sorted(|a| capabilities.iter().all(|c| a.capabilities.contains_key(c)))
    }

    /// Available agents declaring at least one listed capability.
    pub fn agents_with_any_capability(&self, capabilities: &[CapabilityName]) -> Vec<Agent> {
        self.filter_sorted(|a| capabilities.iter().any(|c| a.capabilities.contains_key(c)))
    }

    /// Available agents declaring a specialization.
    pub fn agents_with_specialization(&self, tag: &str) -> Vec<Agent> {
        let state = self.state.read();
        state
            .specialization_index
            .get(tag)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.agents.get(id))
                    .filter(|a| a.available)
                    .map(|a| self.snapshot(a))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Best-rated available agents holding any of the capabilities.
    pub fn top_performers(&self, capabilities: &[CapabilityName], limit: usize) -> Vec<Agent> {
        let mut agents = self.agents_with_any_capability(capabilities);
        agents.sort_by(|a, b| {
            b.performance_rating
                .total_cmp(&a.performance_rating)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        agents.truncate(limit);
        agents
    }

    fn filter_sorted(&self, predicate: impl Fn(&Agent) -> bool) -> Vec<Agent> {
        let state = self.state.read();
        let mut agents: Vec<Agent> = state
            .agents
            .values()
            .filter(|a| a.available && predicate(a))
            .map(|a| self.snapshot(a))
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    fn snapshot(&self, agent: &Agent) -> Agent {
        let mut agent = agent.clone();
        agent.performance_rating = self
            .tracker
            .rating_or(&agent.agent_id, agent.performance_rating);
        agent
    }
}

/// Order agents by the formation tie-break: higher rating, fewer active
/// teams, then lower id.
pub fn tie_break(a: &Agent, b: &Agent) -> Ordering {
    b.performance_rating
        .total_cmp(&a.performance_rating)
        .then_with(|| a.active_teams.cmp(&b.active_teams))
        .then_with(|| a.agent_id.cmp(&b.agent_id))
}
