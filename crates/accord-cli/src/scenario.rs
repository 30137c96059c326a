//! Scenario files: the agents, task and resources a CLI run works with.

use accord_collective::{
    Agent, CapabilityRegistry, DeadlineEnforcer, FormationSettings, Negotiation,
    NegotiationEngine, NegotiationSettings, NegotiationSpec, NegotiationType, ParticipantProfile,
    PerformanceSettings, PerformanceTracker, RatingRecalculator, TaskPriority, TaskRequirement,
    Team, TeamFormationEngine,
};
use accord_config::AccordConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub agents: Vec<AgentEntry>,
    pub task: TaskEntry,
    #[serde(default)]
    pub negotiation: NegotiationEntry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub capabilities: BTreeMap<String, f32>,
    #[serde(default)]
    pub specializations: BTreeSet<String>,
    #[serde(default)]
    pub rating: Option<f32>,
    #[serde(default = "default_true")]
    pub available: bool,
    /// Negotiation priority
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    /// Resource preference weights
    #[serde(default)]
    pub preferences: BTreeMap<String, f64>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskEntry {
    pub title: String,
    #[serde(default)]
    pub capabilities: BTreeMap<String, f32>,
    #[serde(default)]
    pub specializations: BTreeSet<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default = "default_min_team")]
    pub min_team_size: usize,
    #[serde(default = "default_max_team")]
    pub max_team_size: usize,
}

fn default_min_team() -> usize {
    1
}

fn default_max_team() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct NegotiationEntry {
    #[serde(rename = "type", default = "default_negotiation_type")]
    pub negotiation_type: NegotiationType,
    #[serde(default)]
    pub max_rounds: Option<u32>,
    #[serde(default)]
    pub resources: BTreeMap<String, f64>,
}

fn default_negotiation_type() -> NegotiationType {
    NegotiationType::ResourceAllocation
}

impl Default for NegotiationEntry {
    fn default() -> Self {
        Self {
            negotiation_type: default_negotiation_type(),
            max_rounds: None,
            resources: BTreeMap::new(),
        }
    }
}

/// JSON report of a `form` run.
#[derive(Debug, Serialize)]
pub struct FormReport {
    pub task: TaskRequirement,
    pub team: Team,
}

/// JSON report of a `negotiate` run.
#[derive(Debug, Serialize)]
pub struct NegotiateReport {
    pub team: Team,
    pub negotiation: Negotiation,
    pub fairness: f64,
}

impl Scenario {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("Invalid scenario {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn requirement(&self) -> TaskRequirement {
        let task = &self.task;
        let mut requirement = TaskRequirement::new(task.title.clone())
            .with_priority(task.priority)
            .with_team_size(task.min_team_size, task.max_team_size);
        for (name, level) in &task.capabilities {
            requirement = requirement.with_capability(name.clone(), *level);
        }
        for tag in &task.specializations {
            requirement = requirement.with_specialization(tag.clone());
        }
        requirement
    }

    fn registry(&self, tracker: Arc<PerformanceTracker>) -> Result<Arc<CapabilityRegistry>> {
        let registry = Arc::new(CapabilityRegistry::new(tracker));
        for entry in &self.agents {
            let mut agent = Agent::new(
                entry.id.clone(),
                entry.name.clone().unwrap_or_else(|| entry.id.clone()),
            )
            .with_availability(entry.available);
            for (name, level) in &entry.capabilities {
                agent = agent.with_capability(name.clone(), *level);
            }
            for tag in &entry.specializations {
                agent = agent.with_specialization(tag.clone());
            }
            if let Some(rating) = entry.rating {
                agent = agent.with_rating(rating);
            }
            registry.register(agent)?;
        }
        Ok(registry)
    }

    fn profile(&self, registry: &CapabilityRegistry, agent_id: &str) -> ParticipantProfile {
        let mut profile = match registry.get(agent_id) {
            Some(agent) => ParticipantProfile::for_agent(&agent),
            None => ParticipantProfile::new(agent_id),
        };
        if let Some(entry) = self.agents.iter().find(|a| a.id == agent_id) {
            profile.priority = entry.priority;
            for (resource, weight) in &entry.preferences {
                profile = profile.with_preference(resource.clone(), *weight);
            }
        }
        profile
    }
}

/// Session built from configuration and a scenario.
pub struct Session {
    pub scenario: Scenario,
    pub registry: Arc<CapabilityRegistry>,
    pub formation: TeamFormationEngine,
    pub negotiation: Arc<NegotiationEngine>,
    recalculator: Arc<RatingRecalculator>,
    enforcer: Arc<DeadlineEnforcer>,
}

impl Session {
    pub fn new(config: &AccordConfig, scenario: Scenario) -> Result<Self> {
        let tracker = Arc::new(PerformanceTracker::new(PerformanceSettings::from(
            &config.performance,
        )));
        let registry = scenario.registry(tracker.clone())?;
        let formation =
            TeamFormationEngine::new(registry.clone(), FormationSettings::from(&config.formation));
        let negotiation = Arc::new(NegotiationEngine::new(
            tracker.clone(),
            NegotiationSettings::from(&config.negotiation),
        )?);
        let recalculator = Arc::new(RatingRecalculator::from_config(tracker, &config.performance));
        let enforcer = Arc::new(DeadlineEnforcer::from_config(
            negotiation.clone(),
            &config.negotiation,
        ));

        Ok(Self {
            scenario,
            registry,
            formation,
            negotiation,
            recalculator,
            enforcer,
        })
    }

    /// Start the rating recalculator and deadline enforcer on the current runtime.
    pub fn spawn_drivers(&self) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.recalculator.clone().start()),
            tokio::spawn(self.enforcer.clone().start()),
        ]
    }

    /// Form a team for the scenario's task.
    pub fn form(&self, strategy: Option<&str>) -> Result<FormReport> {
        let task = self.scenario.requirement();
        let team = match strategy {
            Some(name) => self.formation.form_team(&task, name)?,
            None => self.formation.form_team_default(&task)?,
        };
        Ok(FormReport { task, team })
    }

    /// Form a team, then let its members negotiate the scenario's resources.
    pub fn negotiate(
        &self,
        strategy: Option<&str>,
        proposal_strategy: Option<&str>,
    ) -> Result<NegotiateReport> {
        let FormReport { task, team } = self.form(strategy)?;
        let initiator = team
            .leader
            .clone()
            .context("Formed team has no leader")?;

        let entry = &self.scenario.negotiation;
        let mut spec =
            NegotiationSpec::new(entry.negotiation_type, initiator).with_task(task.task_id);
        for member in &team.members {
            spec = spec.with_participant(self.scenario.profile(&self.registry, member));
        }
        for (resource, total) in &entry.resources {
            spec = spec.with_resource(resource.clone(), *total);
        }
        if let Some(max_rounds) = entry.max_rounds {
            spec = spec.with_max_rounds(max_rounds);
        }

        let id = self.negotiation.create_negotiation(spec)?.negotiation_id;
        let proposal_strategy = proposal_strategy
            .unwrap_or(&self.negotiation.settings().default_proposal_strategy)
            .to_string();
        let negotiation = self.negotiation.run_automated(&id, &proposal_strategy)?;
        let fairness = self.negotiation.calculate_fairness(&id)?;

        info!(
            negotiation_id = %id,
            status = ?negotiation.status,
            rounds = negotiation.current_round,
            "Scenario negotiation finished"
        );
        Ok(NegotiateReport {
            team,
            negotiation,
            fairness,
        })
    }
}
