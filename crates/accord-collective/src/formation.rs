//! Capability-based team formation.
//!
//! A [`TeamFormationEngine`] turns a [`TaskRequirement`] into a [`Team`] by
//! applying one of the [`FormationStrategy`] selection algorithms to the
//! agents in the [`CapabilityRegistry`]. Every strategy is a deterministic
//! function of registry state and the requirement: candidates are compared
//! on coverage gain first, then by [`tie_break`] (rating, active teams, id).

use crate::capability::{tie_break, Agent, CapabilityRegistry};
use crate::events::{CollectiveEvent, EventSink, NoopEventSink};
use crate::performance::PerformanceTracker;
use crate::types::{
    unit, AgentId, CapabilityName, CollectiveError, Result, Specialization, TaskId, TaskPriority,
    TeamId,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Status of a task requirement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a team
    Open,
    /// A team was formed against this task
    TeamAssigned,
    /// The task finished
    Completed,
    /// The task was given up
    Abandoned,
}

/// What a task needs from the team that will work on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequirement {
    /// Unique task identifier
    pub task_id: TaskId,

    /// Human-readable title
    pub title: String,

    /// Capability name → minimum level required
    #[serde(default)]
    pub required_capabilities: BTreeMap<CapabilityName, f32>,

    /// Domain specializations the task belongs to
    #[serde(default)]
    pub required_specializations: BTreeSet<Specialization>,

    #[serde(default)]
    pub priority: TaskPriority,

    #[serde(default = "default_min_team_size")]
    pub min_team_size: usize,

    #[serde(default = "default_max_team_size")]
    pub max_team_size: usize,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,

    #[serde(default = "default_task_status")]
    pub status: TaskStatus,
}

fn default_min_team_size() -> usize {
    1
}

fn default_max_team_size() -> usize {
    5
}

fn default_task_status() -> TaskStatus {
    TaskStatus::Open
}

impl TaskRequirement {
    /// Create an open requirement with no capability constraints.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            required_capabilities: BTreeMap::new(),
            required_specializations: BTreeSet::new(),
            priority: TaskPriority::Normal,
            min_team_size: default_min_team_size(),
            max_team_size: default_max_team_size(),
            created_at: Utc::now(),
            deadline: None,
            status: TaskStatus::Open,
        }
    }

    /// Require a capability at a minimum level.
    pub fn with_capability(mut self, name: impl Into<CapabilityName>, min_level: f32) -> Self {
        self.required_capabilities.insert(name.into(), unit(min_level));
        self
    }

    /// Require a domain specialization.
    pub fn with_specialization(mut self, tag: impl Into<Specialization>) -> Self {
        self.required_specializations.insert(tag.into());
        self
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set team size bounds.
    pub fn with_team_size(mut self, min: usize, max: usize) -> Self {
        self.min_team_size = min;
        self.max_team_size = max;
        self
    }

    /// Set deadline.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Check size bounds and levels.
    pub fn validate(&self) -> Result<()> {
        if self.min_team_size == 0 {
            return Err(CollectiveError::InvalidRequirement(format!(
                "task {} needs a minimum team size of at least 1",
                self.task_id
            )));
        }
        if self.min_team_size > self.max_team_size {
            return Err(CollectiveError::InvalidRequirement(format!(
                "task {} has min team size {} above max {}",
                self.task_id, self.min_team_size, self.max_team_size
            )));
        }
        if let Some((name, level)) = self
            .required_capabilities
            .iter()
            .find(|(_, level)| !(0.0..=1.0).contains(*level))
        {
            return Err(CollectiveError::InvalidRequirement(format!(
                "capability {} requires level {} outside [0, 1]",
                name, level
            )));
        }
        Ok(())
    }

    /// Whether an agent meets the minimum of at least one required capability.
    pub fn qualifies(&self, agent: &Agent) -> bool {
        self.required_capabilities.is_empty()
            || self
                .required_capabilities
                .iter()
                .any(|(name, min)| agent.meets(name, *min))
    }

    /// Record that a team was formed for this task.
    pub fn mark_team_assigned(&mut self) {
        if self.status == TaskStatus::Open {
            self.status = TaskStatus::TeamAssigned;
        }
    }

    /// Record that the task finished.
    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
    }

    /// Record that the task was given up.
    pub fn abandon(&mut self) {
        self.status = TaskStatus::Abandoned;
    }

    /// Whether the task is completed or abandoned.
    pub fn is_closed(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Abandoned)
    }
}

/// Named team selection algorithm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FormationStrategy {
    /// Greedy coverage, then strengthen weak capabilities up to max size
    OptimalCoverage,
    /// Greedy coverage, stop as soon as everything is covered
    MinimalSize,
    /// Coverage, then spread load over least-recently-assigned agents
    BalancedWorkload,
    /// Coverage restricted to agents sharing the task's domain
    SpecializedDomain,
}

impl FormationStrategy {
    /// Canonical strategy name.
    pub fn as_str(&self) -> &'static str {
        match self {
            FormationStrategy::OptimalCoverage => "optimal_coverage",
            FormationStrategy::MinimalSize => "minimal_size",
            FormationStrategy::BalancedWorkload => "balanced_workload",
            FormationStrategy::SpecializedDomain => "specialized_domain",
        }
    }
}

impl fmt::Display for FormationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormationStrategy {
    type Err = CollectiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "optimal_coverage" => Ok(FormationStrategy::OptimalCoverage),
            "minimal_size" => Ok(FormationStrategy::MinimalSize),
            "balanced_workload" => Ok(FormationStrategy::BalancedWorkload),
            "specialized_domain" => Ok(FormationStrategy::SpecializedDomain),
            _ => Err(CollectiveError::UnknownStrategy {
                kind: "formation",
                name: s.to_string(),
            }),
        }
    }
}

/// Lifecycle status of a team.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TeamStatus {
    Forming,
    Active,
    Disbanded,
}

/// A group of agents formed for a task. Members are referenced by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub team_id: TeamId,
    pub task_id: TaskId,
    /// Members in selection order
    pub members: Vec<AgentId>,
    pub leader: Option<AgentId>,
    pub strategy: FormationStrategy,
    /// Aggregate performance score (0.0 to 1.0)
    pub performance_score: f32,
    pub status: TeamStatus,
    pub formed_at: DateTime<Utc>,
    pub disbanded_at: Option<DateTime<Utc>>,
}

impl Team {
    fn new(task_id: TaskId, members: Vec<AgentId>, strategy: FormationStrategy, score: f32) -> Self {
        Self {
            team_id: uuid::Uuid::new_v4().to_string(),
            task_id,
            leader: members.first().cloned(),
            members,
            strategy,
            performance_score: unit(score),
            status: TeamStatus::Forming,
            formed_at: Utc::now(),
            disbanded_at: None,
        }
    }

    /// Whether the team is still forming or active.
    pub fn is_active(&self) -> bool {
        self.status != TeamStatus::Disbanded
    }

    /// Number of members.
    pub fn size(&self) -> usize {
        self.members.len()
    }
}

/// Tunables for team formation.
#[derive(Debug, Clone)]
pub struct FormationSettings {
    pub time_budget: std::time::Duration,
    pub default_strategy: String,
    pub allow_domain_fallback: bool,
    pub improvement_epsilon: f32,
}

impl Default for FormationSettings {
    fn default() -> Self {
        Self {
            time_budget: std::time::Duration::from_secs(5),
            default_strategy: FormationStrategy::OptimalCoverage.as_str().to_string(),
            allow_domain_fallback: false,
            improvement_epsilon: 0.05,
        }
    }
}

impl From<&accord_config::FormationConfig> for FormationSettings {
    fn from(config: &accord_config::FormationConfig) -> Self {
        Self {
            time_budget: std::time::Duration::from_millis(config.time_budget_ms),
            default_strategy: config.default_strategy.clone(),
            allow_domain_fallback: config.allow_domain_fallback,
            improvement_epsilon: config.improvement_epsilon,
        }
    }
}

/// Wall-clock budget for one formation call.
struct Budget<'a> {
    task_id: &'a str,
    started: Instant,
    limit: std::time::Duration,
}

impl Budget<'_> {
    fn check(&self) -> Result<()> {
        if self.started.elapsed() >= self.limit {
            warn!(task_id = self.task_id, "Team formation exceeded its time budget");
            return Err(CollectiveError::FormationTimeout {
                task_id: self.task_id.to_string(),
                budget_ms: self.limit.as_millis() as u64,
            });
        }
        Ok(())
    }
}

/// Coverage contributed by one candidate: required capabilities newly
/// covered, then total level above the required minimums.
#[derive(Debug, Clone, Copy)]
struct Gain {
    covered: usize,
    excess: f32,
}

impl Gain {
    fn of(agent: &Agent, uncovered: &BTreeMap<CapabilityName, f32>) -> Self {
        let mut gain = Gain {
            covered: 0,
            excess: 0.0,
        };
        for (name, min) in uncovered {
            if agent.meets(name, *min) {
                gain.covered += 1;
                gain.excess += agent.level(name) - min;
            }
        }
        gain
    }

    fn cmp(&self, other: &Gain) -> Ordering {
        self.covered
            .cmp(&other.covered)
            .then_with(|| self.excess.total_cmp(&other.excess))
    }
}

/// Remove and return the preferred candidate under `rank` (Less = preferred).
fn take_best<F>(remaining: &mut Vec<Agent>, mut rank: F) -> Option<Agent>
where
    F: FnMut(&Agent, &Agent) -> Ordering,
{
    let index = (0..remaining.len()).min_by(|&a, &b| rank(&remaining[a], &remaining[b]))?;
    Some(remaining.remove(index))
}

/// Forms teams and tracks their lifecycle.
#[derive(Debug)]
pub struct TeamFormationEngine {
    registry: Arc<CapabilityRegistry>,
    settings: FormationSettings,
    teams: RwLock<HashMap<TeamId, Team>>,
    tasks: RwLock<HashMap<TaskId, TaskRequirement>>,
    events: Arc<dyn EventSink>,
}

impl TeamFormationEngine {
    /// Create a formation engine over a registry.
    pub fn new(registry: Arc<CapabilityRegistry>, settings: FormationSettings) -> Self {
        Self {
            registry,
            settings,
            teams: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            events: Arc::new(NoopEventSink),
        }
    }

    /// Publish formation events to `events`.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Get the formation settings.
    pub fn settings(&self) -> &FormationSettings {
        &self.settings
    }

    fn tracker(&self) -> &Arc<PerformanceTracker> {
        self.registry.tracker()
    }

    /// Form a team with the configured default strategy.
    pub fn form_team_default(&self, requirement: &TaskRequirement) -> Result<Team> {
        let strategy = self.settings.default_strategy.clone();
        self.form_team(requirement, &strategy)
    }

    /// Form a team for a requirement with the named strategy.
    ///
    /// Nothing is recorded unless formation succeeds.
    pub fn form_team(&self, requirement: &TaskRequirement, strategy_name: &str) -> Result<Team> {
        let strategy: FormationStrategy = strategy_name.parse()?;
        requirement.validate()?;

        let status = self
            .tasks
            .read()
            .get(&requirement.task_id)
            .map_or(requirement.status, |t| t.status);
        if matches!(status, TaskStatus::Completed | TaskStatus::Abandoned) {
            return Err(CollectiveError::InvalidRequirement(format!(
                "task {} is {:?} and takes no new teams",
                requirement.task_id, status
            )));
        }

        let budget = Budget {
            task_id: &requirement.task_id,
            started: Instant::now(),
            limit: self.settings.time_budget,
        };
        let pool = self.registry.available_agents();
        debug!(
            task_id = %requirement.task_id,
            strategy = %strategy,
            candidates = pool.len(),
            "Forming team"
        );

        let members = match strategy {
            FormationStrategy::OptimalCoverage => {
                self.optimal_coverage(requirement, pool, &budget)?
            }
            FormationStrategy::MinimalSize => {
                let (selected, mut remaining) = self.cover(requirement, pool, &budget)?;
                self.pad_to_min(requirement, selected, &mut remaining, &budget)?
            }
            FormationStrategy::BalancedWorkload => {
                let (selected, mut remaining) = self.cover(requirement, pool, &budget)?;
                let selected = self.spread_load(requirement, selected, &mut remaining, &budget)?;
                self.pad_to_min(requirement, selected, &mut remaining, &budget)?
            }
            FormationStrategy::SpecializedDomain => {
                self.specialized_domain(requirement, pool, &budget)?
            }
        };

        let member_ids: Vec<AgentId> = members.iter().map(|a| a.agent_id.clone()).collect();
        let score = members.iter().map(|a| a.performance_rating).sum::<f32>()
            / members.len().max(1) as f32;
        let team = Team::new(requirement.task_id.clone(), member_ids, strategy, score);

        self.registry.mark_assigned(&team.members, team.formed_at)?;
        self.tracker().seed(&team.team_id, team.performance_score);
        self.teams.write().insert(team.team_id.clone(), team.clone());
        self.tasks
            .write()
            .entry(requirement.task_id.clone())
            .or_insert_with(|| requirement.clone())
            .mark_team_assigned();

        info!(
            team_id = %team.team_id,
            task_id = %team.task_id,
            strategy = %strategy,
            size = team.size(),
            "Formed team"
        );
        self.events.publish(CollectiveEvent::TeamFormed {
            team_id: team.team_id.clone(),
            task_id: team.task_id.clone(),
            strategy: strategy.as_str().to_string(),
            members: team.members.clone(),
        });

        Ok(team)
    }

    /// Greedy coverage of the required capabilities.
    ///
    /// Returns the selection and the unselected candidates.
    fn cover(
        &self,
        requirement: &TaskRequirement,
        mut remaining: Vec<Agent>,
        budget: &Budget<'_>,
    ) -> Result<(Vec<Agent>, Vec<Agent>)> {
        let mut uncovered = requirement.required_capabilities.clone();
        let mut selected: Vec<Agent> = Vec::new();

        while !uncovered.is_empty() && selected.len() < requirement.max_team_size {
            budget.check()?;

            let best = take_best(&mut remaining, |a, b| {
                Gain::of(b, &uncovered)
                    .cmp(&Gain::of(a, &uncovered))
                    .then_with(|| tie_break(a, b))
            });

            let Some(agent) = best else { break };
            if Gain::of(&agent, &uncovered).covered == 0 {
                remaining.push(agent);
                break;
            }

            uncovered.retain(|name, min| !agent.meets(name, *min));
            selected.push(agent);
        }

        if !uncovered.is_empty() {
            let missing: Vec<CapabilityName> = uncovered.keys().cloned().collect();
            return Err(CollectiveError::InsufficientCapability {
                task_id: requirement.task_id.clone(),
                detail: format!(
                    "no team of at most {} available agent(s) covers {}",
                    requirement.max_team_size,
                    missing.join(", ")
                ),
                missing,
            });
        }

        Ok((selected, remaining))
    }

    fn optimal_coverage(
        &self,
        requirement: &TaskRequirement,
        pool: Vec<Agent>,
        budget: &Budget<'_>,
    ) -> Result<Vec<Agent>> {
        let (selected, mut remaining) = self.cover(requirement, pool, budget)?;
        let selected = self.strengthen(requirement, selected, &mut remaining, budget)?;
        self.pad_to_min(requirement, selected, &mut remaining, budget)
    }

    /// Add members that lift the team's best level on a required capability
    /// by at least the improvement epsilon.
    fn strengthen(
        &self,
        requirement: &TaskRequirement,
        mut selected: Vec<Agent>,
        remaining: &mut Vec<Agent>,
        budget: &Budget<'_>,
    ) -> Result<Vec<Agent>> {
        let epsilon = self.settings.improvement_epsilon;

        while selected.len() < requirement.max_team_size && !remaining.is_empty() {
            budget.check()?;

            let improvement = |agent: &Agent| -> f32 {
                requirement
                    .required_capabilities
                    .iter()
                    .filter(|(name, min)| agent.meets(name, **min))
                    .map(|(name, _)| {
                        let team_best = selected
                            .iter()
                            .map(|m| m.level(name))
                            .fold(0.0_f32, f32::max);
                        agent.level(name) - team_best
                    })
                    .fold(0.0_f32, f32::max)
            };

            let best = take_best(remaining, |a, b| {
                improvement(b)
                    .total_cmp(&improvement(a))
                    .then_with(|| tie_break(a, b))
            });
            let Some(agent) = best else { break };

            let gain = improvement(&agent);
            if gain <= 0.0 || gain < epsilon {
                remaining.push(agent);
                break;
            }
            selected.push(agent);
        }

        Ok(selected)
    }

    /// Fill up to max size with the least-recently-assigned qualifying agents.
    fn spread_load(
        &self,
        requirement: &TaskRequirement,
        mut selected: Vec<Agent>,
        remaining: &mut Vec<Agent>,
        budget: &Budget<'_>,
    ) -> Result<Vec<Agent>> {
        let mut qualifying: Vec<Agent> = Vec::new();
        remaining.retain(|a| {
            if requirement.qualifies(a) {
                qualifying.push(a.clone());
                false
            } else {
                true
            }
        });
        qualifying.sort_by(|a, b| {
            // Never-assigned agents (None) sort first
            a.last_assigned_at
                .cmp(&b.last_assigned_at)
                .then_with(|| tie_break(a, b))
        });

        let mut leftovers = qualifying.into_iter();
        while selected.len() < requirement.max_team_size {
            budget.check()?;
            match leftovers.next() {
                Some(agent) => selected.push(agent),
                None => break,
            }
        }
        remaining.extend(leftovers);
        Ok(selected)
    }

    fn specialized_domain(
        &self,
        requirement: &TaskRequirement,
        pool: Vec<Agent>,
        budget: &Budget<'_>,
    ) -> Result<Vec<Agent>> {
        if requirement.required_specializations.is_empty() {
            return self.optimal_coverage(requirement, pool, budget);
        }

        let restricted: Vec<Agent> = pool
            .iter()
            .filter(|a| a.specializes_in_any(&requirement.required_specializations))
            .cloned()
            .collect();

        match self.optimal_coverage(requirement, restricted, budget) {
            Err(CollectiveError::InsufficientCapability { .. })
                if self.settings.allow_domain_fallback =>
            {
                info!(
                    task_id = %requirement.task_id,
                    "Domain pool cannot cover task, falling back to full pool"
                );
                self.optimal_coverage(requirement, pool, budget)
            }
            other => other,
        }
    }

    /// Add the best remaining candidates until the minimum team size is met.
    fn pad_to_min(
        &self,
        requirement: &TaskRequirement,
        mut selected: Vec<Agent>,
        remaining: &mut Vec<Agent>,
        budget: &Budget<'_>,
    ) -> Result<Vec<Agent>> {
        while selected.len() < requirement.min_team_size {
            budget.check()?;
            let best = take_best(remaining, |a, b| {
                requirement
                    .qualifies(b)
                    .cmp(&requirement.qualifies(a))
                    .then_with(|| tie_break(a, b))
            });
            match best {
                Some(agent) => selected.push(agent),
                None => {
                    return Err(CollectiveError::InsufficientCapability {
                        task_id: requirement.task_id.clone(),
                        missing: Vec::new(),
                        detail: format!(
                            "needs at least {} member(s), only {} candidate(s) available",
                            requirement.min_team_size,
                            selected.len()
                        ),
                    })
                }
            }
        }
        Ok(selected)
    }

    /// Move a forming team to active.
    pub fn activate_team(&self, team_id: &str) -> Result<Team> {
        let mut teams = self.teams.write();
        let team = teams
            .get_mut(team_id)
            .ok_or_else(|| CollectiveError::TeamNotFound(team_id.to_string()))?;
        if team.status != TeamStatus::Forming {
            return Err(CollectiveError::transition(
                format!("team {}", team_id),
                format!("cannot activate a {:?} team", team.status),
            ));
        }
        team.status = TeamStatus::Active;
        Ok(team.clone())
    }

    /// Disband a team and release its members.
    pub fn disband_team(&self, team_id: &str) -> Result<Team> {
        let team = {
            let mut teams = self.teams.write();
            let team = teams
                .get_mut(team_id)
                .ok_or_else(|| CollectiveError::TeamNotFound(team_id.to_string()))?;
            if team.status == TeamStatus::Disbanded {
                return Err(CollectiveError::transition(
                    format!("team {}", team_id),
                    "team is already disbanded",
                ));
            }
            team.status = TeamStatus::Disbanded;
            team.disbanded_at = Some(Utc::now());
            team.clone()
        };

        self.registry.release(&team.members);
        info!(team_id, "Disbanded team");
        Ok(team)
    }

    /// Mark a task completed and disband its remaining teams.
    pub fn complete_task(&self, task_id: &str) -> Result<TaskRequirement> {
        self.close_task(task_id, TaskRequirement::complete)
    }

    /// Mark a task abandoned and disband its remaining teams.
    pub fn abandon_task(&self, task_id: &str) -> Result<TaskRequirement> {
        self.close_task(task_id, TaskRequirement::abandon)
    }

    fn close_task(
        &self,
        task_id: &str,
        close: fn(&mut TaskRequirement),
    ) -> Result<TaskRequirement> {
        let task = {
            let mut tasks = self.tasks.write();
            let task = tasks.get_mut(task_id).ok_or_else(|| {
                CollectiveError::InvalidRequirement(format!("task {} has no formed team", task_id))
            })?;
            if task.is_closed() {
                return Err(CollectiveError::transition(
                    format!("task {}", task_id),
                    format!("task is already {:?}", task.status),
                ));
            }
            close(task);
            task.clone()
        };

        let open: Vec<TeamId> = self
            .teams
            .read()
            .values()
            .filter(|t| t.task_id == task_id && t.status != TeamStatus::Disbanded)
            .map(|t| t.team_id.clone())
            .collect();
        for team_id in open {
            // A concurrent disband may have won the race
            if let Err(err) = self.disband_team(&team_id) {
                warn!(task_id, team_id = %team_id, error = %err, "Team already released");
            }
        }

        info!(task_id, status = ?task.status, "Closed task");
        Ok(task)
    }

    /// Tracked state of a task that has had a team formed for it.
    pub fn task(&self, task_id: &str) -> Option<TaskRequirement> {
        self.tasks.read().get(task_id).cloned()
    }

    /// Fold a task outcome into the team's and each member's rating.
    pub fn record_team_outcome(&self, team_id: &str, success: bool, quality: f32) -> Result<f32> {
        let members = self
            .teams
            .read()
            .get(team_id)
            .map(|t| t.members.clone())
            .ok_or_else(|| CollectiveError::TeamNotFound(team_id.to_string()))?;

        for member in &members {
            self.tracker().record_outcome(member, success, quality);
        }
        Ok(self.tracker().record_outcome(team_id, success, quality))
    }

    /// Snapshot of a team with its current performance score.
    pub fn team(&self, team_id: &str) -> Option<Team> {
        self.teams.read().get(team_id).map(|t| self.snapshot(t))
    }

    /// Teams formed for a task, oldest first.
    pub fn teams_for_task(&self, task_id: &str) -> Vec<Team> {
        let mut teams: Vec<Team> = self
            .teams
            .read()
            .values()
            .filter(|t| t.task_id == task_id)
            .map(|t| self.snapshot(t))
            .collect();
        teams.sort_by_key(|t| t.formed_at);
        teams
    }

    /// Teams that are forming or active.
    pub fn active_teams(&self) -> Vec<Team> {
        self.teams
            .read()
            .values()
            .filter(|t| t.is_active())
            .map(|t| self.snapshot(t))
            .collect()
    }

    fn snapshot(&self, team: &Team) -> Team {
        let mut team = team.clone();
        team.performance_score = self
            .tracker()
            .rating_or(&team.team_id, team.performance_score);
        team
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastEventSink;

    fn engine_with(agents: Vec<Agent>, settings: FormationSettings) -> TeamFormationEngine {
        let registry = Arc::new(CapabilityRegistry::new(Arc::new(
            PerformanceTracker::default(),
        )));
        for agent in agents {
            registry.register(agent).unwrap();
        }
        TeamFormationEngine::new(registry, settings)
    }

    fn scenario_a() -> Vec<Agent> {
        vec![
            Agent::new("x", "X").with_capability("reasoning", 0.9),
            Agent::new("y", "Y").with_capability("data_analysis", 0.8),
            Agent::new("z", "Z")
                .with_capability("reasoning", 0.5)
                .with_capability("data_analysis", 0.6),
        ]
    }

    fn ids(team: &Team) -> Vec<&str> {
        team.members.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(
            "optimal-coverage".parse::<FormationStrategy>().unwrap(),
            FormationStrategy::OptimalCoverage
        );
        assert_eq!(
            "Minimal_Size".parse::<FormationStrategy>().unwrap(),
            FormationStrategy::MinimalSize
        );
        assert!("random".parse::<FormationStrategy>().is_err());
    }

    #[test]
    fn test_optimal_coverage_selects_covering_pair() {
        let engine = engine_with(scenario_a(), FormationSettings::default());
        let task = TaskRequirement::new("analysis")
            .with_capability("reasoning", 0.7)
            .with_capability("data_analysis", 0.7)
            .with_team_size(1, 2);

        let team = engine.form_team(&task, "optimal_coverage").unwrap();
        assert_eq!(ids(&team), vec!["x", "y"]);
        assert_eq!(team.leader.as_deref(), Some("x"));
        assert_eq!(team.status, TeamStatus::Forming);
    }

    #[test]
    fn test_missing_capability_is_insufficient() {
        let engine = engine_with(scenario_a(), FormationSettings::default());
        let task = TaskRequirement::new("legal").with_capability("law", 0.1);

        match engine.form_team(&task, "minimal_size") {
            Err(CollectiveError::InsufficientCapability { missing, .. }) => {
                assert_eq!(missing, vec!["law".to_string()]);
            }
            other => panic!("expected insufficient capability, got {:?}", other),
        }
        assert!(engine.teams_for_task(&task.task_id).is_empty());
    }

    #[test]
    fn test_coverage_respects_max_size() {
        let engine = engine_with(scenario_a(), FormationSettings::default());
        let task = TaskRequirement::new("analysis")
            .with_capability("reasoning", 0.7)
            .with_capability("data_analysis", 0.7)
            .with_team_size(1, 1);

        assert!(matches!(
            engine.form_team(&task, "optimal_coverage"),
            Err(CollectiveError::InsufficientCapability { .. })
        ));
    }

    #[test]
    fn test_minimal_size_prefers_single_generalist() {
        let agents = vec![
            Agent::new("a", "A").with_capability("reasoning", 0.9),
            Agent::new("b", "B").with_capability("writing", 0.9),
            Agent::new("c", "C")
                .with_capability("reasoning", 0.7)
                .with_capability("writing", 0.7),
        ];
        let engine = engine_with(agents, FormationSettings::default());
        let task = TaskRequirement::new("report")
            .with_capability("reasoning", 0.6)
            .with_capability("writing", 0.6)
            .with_team_size(1, 3);

        let minimal = engine.form_team(&task, "minimal_size").unwrap();
        assert_eq!(ids(&minimal), vec!["c"]);

        // Optimal coverage keeps adding members that raise the best level
        let optimal = engine.form_team(&task, "optimal_coverage").unwrap();
        assert_eq!(ids(&optimal), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_tie_break_by_rating_then_id() {
        let agents = vec![
            Agent::new("b", "B").with_capability("reasoning", 0.8).with_rating(0.5),
            Agent::new("a", "A").with_capability("reasoning", 0.8).with_rating(0.5),
            Agent::new("c", "C").with_capability("reasoning", 0.8).with_rating(0.9),
        ];
        let engine = engine_with(agents, FormationSettings::default());
        let task = TaskRequirement::new("t")
            .with_capability("reasoning", 0.5)
            .with_team_size(1, 1);

        let first = engine.form_team(&task, "minimal_size").unwrap();
        assert_eq!(ids(&first), vec!["c"]);

        engine.registry.set_availability("c", false).unwrap();
        let second = engine.form_team(&task, "minimal_size").unwrap();
        assert_eq!(ids(&second), vec!["a"]);
    }

    #[test]
    fn test_tie_break_prefers_fewer_active_teams() {
        let agents = vec![
            Agent::new("a", "A").with_capability("reasoning", 0.8),
            Agent::new("b", "B").with_capability("reasoning", 0.8),
        ];
        let engine = engine_with(agents, FormationSettings::default());
        let task = TaskRequirement::new("t")
            .with_capability("reasoning", 0.5)
            .with_team_size(1, 1);

        let first = engine.form_team(&task, "minimal_size").unwrap();
        assert_eq!(ids(&first), vec!["a"]);
        let second = engine.form_team(&task, "minimal_size").unwrap();
        assert_eq!(ids(&second), vec!["b"]);
    }

    #[test]
    fn test_balanced_workload_adds_least_recently_assigned() {
        let agents = vec![
            Agent::new("lead", "Lead").with_capability("reasoning", 0.9),
            Agent::new("busy", "Busy").with_capability("reasoning", 0.6),
            Agent::new("idle", "Idle").with_capability("reasoning", 0.6),
            Agent::new("other", "Other").with_capability("cooking", 0.9),
        ];
        let engine = engine_with(agents, FormationSettings::default());
        engine
            .registry
            .mark_assigned(&["busy".to_string()], Utc::now())
            .unwrap();

        let task = TaskRequirement::new("t")
            .with_capability("reasoning", 0.5)
            .with_team_size(1, 3);
        let team = engine.form_team(&task, "balanced_workload").unwrap();

        assert_eq!(ids(&team), vec!["lead", "idle", "busy"]);
    }

    #[test]
    fn test_specialized_domain_restricts_pool() {
        let agents = vec![
            Agent::new("generalist", "G")
                .with_capability("reasoning", 0.95)
                .with_rating(0.9),
            Agent::new("quant", "Q")
                .with_capability("reasoning", 0.7)
                .with_specialization("finance"),
        ];
        let engine = engine_with(agents, FormationSettings::default());
        let task = TaskRequirement::new("audit")
            .with_capability("reasoning", 0.6)
            .with_specialization("finance")
            .with_team_size(1, 1);

        let team = engine.form_team(&task, "specialized_domain").unwrap();
        assert_eq!(ids(&team), vec!["quant"]);
    }

    #[test]
    fn test_specialized_domain_fallback_flag() {
        let agents = vec![
            Agent::new("generalist", "G").with_capability("reasoning", 0.95),
            Agent::new("quant", "Q")
                .with_capability("reasoning", 0.4)
                .with_specialization("finance"),
        ];
        let task = TaskRequirement::new("audit")
            .with_capability("reasoning", 0.6)
            .with_specialization("finance")
            .with_team_size(1, 1);

        let strict = engine_with(agents.clone(), FormationSettings::default());
        assert!(matches!(
            strict.form_team(&task, "specialized_domain"),
            Err(CollectiveError::InsufficientCapability { .. })
        ));

        let lenient = engine_with(
            agents,
            FormationSettings {
                allow_domain_fallback: true,
                ..FormationSettings::default()
            },
        );
        let team = lenient.form_team(&task, "specialized_domain").unwrap();
        assert_eq!(ids(&team), vec!["generalist"]);
    }

    #[test]
    fn test_pads_to_minimum_size() {
        let engine = engine_with(scenario_a(), FormationSettings::default());
        let task = TaskRequirement::new("t")
            .with_capability("reasoning", 0.7)
            .with_team_size(3, 3);

        let team = engine.form_team(&task, "minimal_size").unwrap();
        assert_eq!(team.size(), 3);
        assert_eq!(team.members[0], "x");

        let too_big = TaskRequirement::new("t")
            .with_capability("reasoning", 0.7)
            .with_team_size(4, 5);
        assert!(matches!(
            engine.form_team(&too_big, "minimal_size"),
            Err(CollectiveError::InsufficientCapability { .. })
        ));
    }

    #[test]
    fn test_zero_budget_times_out() {
        let engine = engine_with(
            scenario_a(),
            FormationSettings {
                time_budget: std::time::Duration::ZERO,
                ..FormationSettings::default()
            },
        );
        let task = TaskRequirement::new("t").with_capability("reasoning", 0.7);

        assert!(matches!(
            engine.form_team(&task, "optimal_coverage"),
            Err(CollectiveError::FormationTimeout { .. })
        ));
    }

    #[test]
    fn test_invalid_size_bounds() {
        let engine = engine_with(scenario_a(), FormationSettings::default());
        let task = TaskRequirement::new("t").with_team_size(3, 2);
        assert!(matches!(
            engine.form_team(&task, "minimal_size"),
            Err(CollectiveError::InvalidRequirement(_))
        ));
    }

    #[test]
    fn test_team_lifecycle_releases_members() {
        let engine = engine_with(scenario_a(), FormationSettings::default());
        let task = TaskRequirement::new("t")
            .with_capability("reasoning", 0.7)
            .with_team_size(1, 1);
        let team = engine.form_team(&task, "minimal_size").unwrap();

        assert_eq!(engine.registry.get("x").unwrap().active_teams, 1);
        assert!(engine.registry.get("x").unwrap().last_assigned_at.is_some());

        engine.activate_team(&team.team_id).unwrap();
        assert!(engine.activate_team(&team.team_id).is_err());
        assert_eq!(engine.active_teams().len(), 1);

        engine.disband_team(&team.team_id).unwrap();
        assert_eq!(engine.registry.get("x").unwrap().active_teams, 0);
        assert!(engine.disband_team(&team.team_id).is_err());
        assert!(engine.active_teams().is_empty());
    }

    #[test]
    fn test_task_status_follows_team_lifecycle() {
        let engine = engine_with(scenario_a(), FormationSettings::default());
        let task = TaskRequirement::new("t")
            .with_capability("reasoning", 0.7)
            .with_team_size(1, 1);
        assert!(engine.task(&task.task_id).is_none());

        let team = engine.form_team(&task, "minimal_size").unwrap();
        assert_eq!(
            engine.task(&task.task_id).unwrap().status,
            TaskStatus::TeamAssigned
        );

        let closed = engine.complete_task(&task.task_id).unwrap();
        assert_eq!(closed.status, TaskStatus::Completed);
        assert_eq!(
            engine.team(&team.team_id).unwrap().status,
            TeamStatus::Disbanded
        );
        assert_eq!(engine.registry.get("x").unwrap().active_teams, 0);

        assert!(matches!(
            engine.form_team(&task, "minimal_size"),
            Err(CollectiveError::InvalidRequirement(_))
        ));
        assert!(engine.abandon_task(&task.task_id).is_err());
    }

    #[test]
    fn test_abandoned_task_releases_members() {
        let engine = engine_with(scenario_a(), FormationSettings::default());
        let task = TaskRequirement::new("t")
            .with_capability("reasoning", 0.7)
            .with_team_size(1, 1);
        let first = engine.form_team(&task, "minimal_size").unwrap();
        engine.disband_team(&first.team_id).unwrap();
        let second = engine.form_team(&task, "minimal_size").unwrap();
        engine.activate_team(&second.team_id).unwrap();

        let closed = engine.abandon_task(&task.task_id).unwrap();
        assert_eq!(closed.status, TaskStatus::Abandoned);
        assert!(engine.active_teams().is_empty());
        assert!(engine.registry.agents().iter().all(|a| a.active_teams == 0));
    }

    #[test]
    fn test_closing_unknown_task_fails() {
        let engine = engine_with(scenario_a(), FormationSettings::default());
        assert!(matches!(
            engine.complete_task("missing"),
            Err(CollectiveError::InvalidRequirement(_))
        ));
    }

    #[test]
    fn test_closed_requirement_refused() {
        let engine = engine_with(scenario_a(), FormationSettings::default());
        let mut task = TaskRequirement::new("t").with_capability("reasoning", 0.7);
        task.abandon();
        assert!(engine.form_team(&task, "minimal_size").is_err());
        assert!(engine.task(&task.task_id).is_none());
    }

    #[test]
    fn test_team_outcome_updates_ratings() {
        let engine = engine_with(scenario_a(), FormationSettings::default());
        let task = TaskRequirement::new("t")
            .with_capability("reasoning", 0.7)
            .with_team_size(1, 1);
        let team = engine.form_team(&task, "minimal_size").unwrap();

        let rating = engine.record_team_outcome(&team.team_id, true, 1.0).unwrap();
        assert!(rating > 0.5);
        assert_eq!(engine.team(&team.team_id).unwrap().performance_score, rating);
        assert!(engine.registry.get("x").unwrap().performance_rating > 0.5);
    }

    #[test]
    fn test_formation_publishes_event() {
        let sink = Arc::new(BroadcastEventSink::new(4));
        let mut rx = sink.subscribe();
        let engine =
            engine_with(scenario_a(), FormationSettings::default()).with_events(sink.clone());
        let task = TaskRequirement::new("t").with_capability("reasoning", 0.7);

        let team = engine.form_team(&task, "minimal_size").unwrap();
        match rx.try_recv().unwrap() {
            CollectiveEvent::TeamFormed {
                team_id, members, ..
            } => {
                assert_eq!(team_id, team.team_id);
                assert_eq!(members, team.members);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
