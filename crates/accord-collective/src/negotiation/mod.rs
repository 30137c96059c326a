//! Round-based negotiation among team members.
//!
//! A [`Negotiation`] owns its rounds and enforces the state machine
//!
//! ```text
//! PENDING --start--> IN_PROGRESS --(consensus round)--> COMPLETED
//! PENDING/IN_PROGRESS --(maxRounds exhausted)--> FAILED
//! PENDING/IN_PROGRESS --(end session / resolution)--> COMPLETED | FAILED
//! ```
//!
//! The transition functions on [`Negotiation`] take an explicit `now` and
//! stamp every timestamp themselves. [`NegotiationEngine`] wraps them with
//! per-negotiation locking, event publication and the automated drivers.

pub mod engine;
pub mod strategy;

pub use engine::{DeadlineEnforcer, Evaluation, NegotiationEngine, NegotiationSettings};
pub use strategy::{
    BalancedStrategy, CompetitiveStrategy, CooperativeStrategy, ProposalContext,
    ProposalStrategy, ProposalStrategyRegistry,
};

use crate::capability::Agent;
use crate::types::{
    unit64, AgentId, AllocationMap, CollectiveError, NegotiationId, Payload, ProposalId, Result,
    TaskId, TaskPriority,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Payload key under which proposals carry an allocation.
pub const ALLOCATION_KEY: &str = "allocation";

/// Payload key for a textual percentage split such as `"50/50"`.
pub const SPLIT_KEY: &str = "split";

/// What a negotiation is about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationType {
    TaskAllocation,
    ResourceAllocation,
    ConflictResolution,
    ConsensusBuilding,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl NegotiationStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationStatus::Completed | NegotiationStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundStatus {
    Active,
    Consensus,
    NoConsensus,
}

/// Why a negotiation failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    MaxRoundsReached,
    NoConsensus,
    DeadlineExceeded,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::MaxRoundsReached => "MAX_ROUNDS_REACHED",
            FailureReason::NoConsensus => "NO_CONSENSUS",
            FailureReason::DeadlineExceeded => "DEADLINE_EXCEEDED",
            FailureReason::Cancelled => "CANCELLED",
        }
    }
}

/// Terminal result of a negotiation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NegotiationOutcome {
    /// Agreed terms
    Agreement { terms: Payload },
    /// No agreement
    Failure {
        reason: FailureReason,
        detail: Option<Payload>,
    },
}

impl NegotiationOutcome {
    /// Agreed terms, if the negotiation reached agreement.
    pub fn terms(&self) -> Option<&Payload> {
        match self {
            NegotiationOutcome::Agreement { terms } => Some(terms),
            NegotiationOutcome::Failure { .. } => None,
        }
    }

    /// Failure reason, if the negotiation failed.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            NegotiationOutcome::Agreement { .. } => None,
            NegotiationOutcome::Failure { reason, .. } => Some(*reason),
        }
    }
}

/// How an explicit end-of-session call closes a negotiation.
#[derive(Debug, Clone, PartialEq)]
pub enum EndSession {
    /// Adjudicated agreement
    Complete(Payload),
    /// Cancellation with optional detail
    Fail(Option<Payload>),
}

/// A participant's submission in a round. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Proposal {
    pub proposal_id: ProposalId,
    pub participant_id: AgentId,
    pub content: Payload,
    pub submitted_at: DateTime<Utc>,
}

impl Proposal {
    /// Allocation carried by the proposal, if any.
    pub fn allocation(&self) -> Option<AllocationMap> {
        parse_allocation(&self.content)
    }
}

/// One bounded cycle of proposal exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NegotiationRound {
    /// 1-based, gapless
    pub round_number: u32,
    pub status: RoundStatus,
    /// Proposals in arrival order
    pub proposals: Vec<Proposal>,
    pub result: Option<Payload>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NegotiationRound {
    fn open(round_number: u32, now: DateTime<Utc>) -> Self {
        Self {
            round_number,
            status: RoundStatus::Active,
            proposals: Vec::new(),
            result: None,
            started_at: now,
            completed_at: None,
        }
    }

    fn close(&mut self, status: RoundStatus, result: Option<Payload>, now: DateTime<Utc>) {
        self.status = status;
        if result.is_some() {
            self.result = result;
        }
        self.completed_at = Some(now);
    }

    pub fn is_active(&self) -> bool {
        self.status == RoundStatus::Active
    }

    /// Latest proposal a participant made in this round.
    pub fn latest_from(&self, participant_id: &str) -> Option<&Proposal> {
        self.proposals
            .iter()
            .rev()
            .find(|p| p.participant_id == participant_id)
    }
}

/// A participant and what it declares about itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParticipantProfile {
    pub agent_id: AgentId,

    /// Declared priority for conflict resolution
    #[serde(default)]
    pub priority: Option<TaskPriority>,

    /// Resource name → preference weight
    #[serde(default)]
    pub preferences: BTreeMap<String, f64>,

    /// Position of the agent in the capability registry
    #[serde(default)]
    pub registration_seq: Option<u64>,
}

impl ParticipantProfile {
    pub fn new(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            priority: None,
            preferences: BTreeMap::new(),
            registration_seq: None,
        }
    }

    /// Profile of a registered agent, carrying its registration order.
    pub fn for_agent(agent: &Agent) -> Self {
        Self::new(agent.agent_id.clone()).with_registration_seq(agent.registration_seq)
    }

    pub fn with_registration_seq(mut self, seq: u64) -> Self {
        self.registration_seq = Some(seq);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_preference(mut self, resource: impl Into<String>, weight: f64) -> Self {
        self.preferences.insert(resource.into(), weight.max(0.0));
        self
    }
}

/// Request to open a negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationSpec {
    pub negotiation_type: NegotiationType,
    pub initiator: AgentId,
    pub participants: Vec<ParticipantProfile>,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    /// Resource name → total quantity under negotiation
    #[serde(default)]
    pub resources: BTreeMap<String, f64>,
    #[serde(default)]
    pub constraints: Payload,
    /// Falls back to the engine's configured bound
    #[serde(default)]
    pub max_rounds: Option<u32>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

impl NegotiationSpec {
    pub fn new(negotiation_type: NegotiationType, initiator: impl Into<AgentId>) -> Self {
        Self {
            negotiation_type,
            initiator: initiator.into(),
            participants: Vec::new(),
            task_id: None,
            resources: BTreeMap::new(),
            constraints: Payload::new(),
            max_rounds: None,
            deadline: None,
        }
    }

    pub fn with_participant(mut self, profile: ParticipantProfile) -> Self {
        self.participants.push(profile);
        self
    }

    /// Add participants with no declared priority or preferences.
    pub fn with_participants<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AgentId>,
    {
        self.participants
            .extend(ids.into_iter().map(ParticipantProfile::new));
        self
    }

    pub fn with_task(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_resource(mut self, name: impl Into<String>, total: f64) -> Self {
        self.resources.insert(name.into(), total);
        self
    }

    pub fn with_constraint(mut self, key: impl Into<String>, value: Value) -> Self {
        self.constraints.insert(key.into(), value);
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = Some(max_rounds);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Check participants, round bound and resource totals.
    pub fn validate(&self) -> Result<()> {
        if self.participants.is_empty() {
            return Err(CollectiveError::InvalidNegotiation(
                "a negotiation needs at least one participant".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for profile in &self.participants {
            if !seen.insert(profile.agent_id.as_str()) {
                return Err(CollectiveError::InvalidNegotiation(format!(
                    "participant {} is listed twice",
                    profile.agent_id
                )));
            }
        }
        if !seen.contains(self.initiator.as_str()) {
            return Err(CollectiveError::InvalidNegotiation(format!(
                "initiator {} is not a participant",
                self.initiator
            )));
        }

        if self.max_rounds == Some(0) {
            return Err(CollectiveError::InvalidNegotiation(
                "max_rounds must be at least 1".to_string(),
            ));
        }

        if let Some((name, total)) = self
            .resources
            .iter()
            .find(|(_, total)| !total.is_finite() || **total < 0.0)
        {
            return Err(CollectiveError::InvalidNegotiation(format!(
                "resource {} has invalid total {}",
                name, total
            )));
        }
        Ok(())
    }
}

/// A bounded sequence of rounds among a fixed participant set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Negotiation {
    pub negotiation_id: NegotiationId,
    pub negotiation_type: NegotiationType,
    pub initiator: AgentId,
    /// Participants in declaration order
    pub participants: Vec<ParticipantProfile>,
    pub task_id: Option<TaskId>,
    pub resources: BTreeMap<String, f64>,
    pub constraints: Payload,
    pub current_round: u32,
    pub max_rounds: u32,
    pub status: NegotiationStatus,
    pub outcome: Option<NegotiationOutcome>,
    pub rounds: Vec<NegotiationRound>,
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Negotiation {
    /// Build a pending negotiation from a validated spec.
    pub fn from_spec(spec: NegotiationSpec, max_rounds: u32, now: DateTime<Utc>) -> Result<Self> {
        spec.validate()?;
        if max_rounds == 0 {
            return Err(CollectiveError::InvalidNegotiation(
                "max_rounds must be at least 1".to_string(),
            ));
        }
        if let Some(deadline) = spec.deadline.filter(|d| *d <= now) {
            return Err(CollectiveError::InvalidNegotiation(format!(
                "deadline {} has already passed",
                deadline
            )));
        }

        Ok(Self {
            negotiation_id: uuid::Uuid::new_v4().to_string(),
            negotiation_type: spec.negotiation_type,
            initiator: spec.initiator,
            participants: spec.participants,
            task_id: spec.task_id,
            resources: spec.resources,
            constraints: spec.constraints,
            current_round: 0,
            max_rounds: spec.max_rounds.unwrap_or(max_rounds),
            status: NegotiationStatus::Pending,
            outcome: None,
            rounds: Vec::new(),
            deadline: spec.deadline,
            created_at: now,
            started_at: None,
            completed_at: None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn participant_ids(&self) -> Vec<AgentId> {
        self.participants.iter().map(|p| p.agent_id.clone()).collect()
    }

    pub fn participant(&self, agent_id: &str) -> Option<&ParticipantProfile> {
        self.participants.iter().find(|p| p.agent_id == agent_id)
    }

    pub fn has_participant(&self, agent_id: &str) -> bool {
        self.participant(agent_id).is_some()
    }

    pub fn active_round(&self) -> Option<&NegotiationRound> {
        self.rounds.last().filter(|r| r.is_active())
    }

    fn active_round_mut(&mut self) -> Option<&mut NegotiationRound> {
        self.rounds.last_mut().filter(|r| r.is_active())
    }

    /// Fraction of the round budget used so far, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        unit64(self.current_round as f64 / self.max_rounds.max(1) as f64)
    }

    /// Latest proposal by a participant across all rounds.
    pub fn latest_proposal_of(&self, participant_id: &str) -> Option<&Proposal> {
        self.rounds
            .iter()
            .rev()
            .find_map(|r| r.latest_from(participant_id))
    }

    /// Latest proposal by anyone other than `participant_id`.
    pub fn latest_counterpart_proposal(&self, participant_id: &str) -> Option<&Proposal> {
        self.rounds.iter().rev().find_map(|r| {
            r.proposals
                .iter()
                .rev()
                .find(|p| p.participant_id != participant_id)
        })
    }

    /// Preference weights of a participant over the declared resources.
    ///
    /// Participants that declare no positive weight value every resource
    /// equally.
    pub fn weights_of(&self, participant_id: &str) -> BTreeMap<String, f64> {
        let declared = self.participant(participant_id).map(|p| &p.preferences);
        let weights: BTreeMap<String, f64> = self
            .resources
            .keys()
            .map(|r| {
                let w = declared.and_then(|d| d.get(r)).copied().unwrap_or(0.0);
                (r.clone(), if w.is_finite() { w.max(0.0) } else { 0.0 })
            })
            .collect();

        if weights.values().any(|w| *w > 0.0) {
            weights
        } else {
            self.resources.keys().map(|r| (r.clone(), 1.0)).collect()
        }
    }

    /// Utility of an allocation for a participant, in `[0, 1]`.
    ///
    /// `Σ_r w(r) · share(r) / Σ_r w(r)` over declared resources with a
    /// positive total.
    pub fn utility_of(&self, participant_id: &str, allocation: &AllocationMap) -> f64 {
        let weights = self.weights_of(participant_id);
        let held = allocation.get(participant_id);

        let mut weighted = 0.0;
        let mut weight_sum = 0.0;
        for (resource, weight) in &weights {
            let total = self.resources.get(resource).copied().unwrap_or(0.0);
            if total <= 0.0 {
                continue;
            }
            let amount = held
                .and_then(|h| h.get(resource))
                .copied()
                .unwrap_or(0.0);
            weighted += weight * unit64(amount / total);
            weight_sum += weight;
        }

        if weight_sum > 0.0 {
            unit64(weighted / weight_sum)
        } else {
            0.0
        }
    }

    /// Force FAILED with `DEADLINE_EXCEEDED` when the deadline has passed.
    ///
    /// Returns true when this call expired the negotiation.
    pub fn expire_if_past_deadline(&mut self, now: DateTime<Utc>) -> bool {
        match self.deadline {
            Some(deadline) if !self.is_terminal() && now >= deadline => {
                self.fail(FailureReason::DeadlineExceeded, None, now);
                true
            }
            _ => false,
        }
    }

    fn ensure_open(&self, action: &str) -> Result<()> {
        if self.is_terminal() {
            return Err(CollectiveError::transition(
                format!("negotiation {}", self.negotiation_id),
                format!("cannot {} a {:?} negotiation", action, self.status),
            ));
        }
        Ok(())
    }

    /// Open round `current_round + 1` and return its number.
    ///
    /// When the round bound is already exhausted the negotiation is failed
    /// with `MAX_ROUNDS_REACHED` and `MaxRoundsExceeded` is returned.
    pub fn start_new_round(&mut self, now: DateTime<Utc>) -> Result<u32> {
        self.ensure_open("start a round on")?;
        if self.expire_if_past_deadline(now) {
            return Err(CollectiveError::DeadlineExceeded(self.negotiation_id.clone()));
        }
        if let Some(round) = self.active_round() {
            return Err(CollectiveError::transition(
                format!("negotiation {}", self.negotiation_id),
                format!("round {} is still active", round.round_number),
            ));
        }
        if self.current_round >= self.max_rounds {
            self.fail(FailureReason::MaxRoundsReached, None, now);
            return Err(CollectiveError::MaxRoundsExceeded {
                negotiation_id: self.negotiation_id.clone(),
                max_rounds: self.max_rounds,
            });
        }

        if self.status == NegotiationStatus::Pending {
            self.status = NegotiationStatus::InProgress;
            self.started_at = Some(now);
        }
        self.current_round += 1;
        self.rounds.push(NegotiationRound::open(self.current_round, now));
        Ok(self.current_round)
    }

    /// Append a proposal to the active round.
    ///
    /// Content is never inspected.
    pub fn submit_proposal(
        &mut self,
        participant_id: &str,
        content: Payload,
        now: DateTime<Utc>,
    ) -> Result<Proposal> {
        if !self.has_participant(participant_id) {
            return Err(CollectiveError::UnknownParticipant {
                negotiation_id: self.negotiation_id.clone(),
                participant_id: participant_id.to_string(),
            });
        }
        self.ensure_open("submit to")?;
        if self.expire_if_past_deadline(now) {
            return Err(CollectiveError::DeadlineExceeded(self.negotiation_id.clone()));
        }

        let negotiation_id = self.negotiation_id.clone();
        let round = self.active_round_mut().ok_or_else(|| {
            CollectiveError::transition(
                format!("negotiation {}", negotiation_id),
                "no active round to submit to",
            )
        })?;

        let proposal = Proposal {
            proposal_id: uuid::Uuid::new_v4().to_string(),
            participant_id: participant_id.to_string(),
            content,
            submitted_at: now,
        };
        round.proposals.push(proposal.clone());
        Ok(proposal)
    }

    /// Close the active round.
    ///
    /// With consensus the negotiation completes with `result` as its
    /// agreement. Without it the negotiation fails with
    /// `MAX_ROUNDS_REACHED` once the round bound is reached.
    pub fn complete_current_round(
        &mut self,
        consensus_reached: bool,
        result: Payload,
        now: DateTime<Utc>,
    ) -> Result<NegotiationStatus> {
        self.ensure_open("complete a round of")?;
        if self.expire_if_past_deadline(now) {
            return Ok(self.status);
        }

        let negotiation_id = self.negotiation_id.clone();
        let round = self.active_round_mut().ok_or_else(|| {
            CollectiveError::transition(
                format!("negotiation {}", negotiation_id),
                "no active round to complete",
            )
        })?;

        if consensus_reached {
            round.close(RoundStatus::Consensus, Some(result.clone()), now);
            self.status = NegotiationStatus::Completed;
            self.outcome = Some(NegotiationOutcome::Agreement { terms: result });
            self.completed_at = Some(now);
        } else {
            round.close(RoundStatus::NoConsensus, Some(result), now);
            if self.current_round >= self.max_rounds {
                self.fail(FailureReason::MaxRoundsReached, None, now);
            }
        }
        Ok(self.status)
    }

    /// Close the negotiation with an agreement outside the round loop.
    pub fn complete_with(&mut self, terms: Payload, now: DateTime<Utc>) -> Result<()> {
        self.ensure_open("complete")?;
        if let Some(round) = self.active_round_mut() {
            round.close(RoundStatus::Consensus, Some(terms.clone()), now);
        }
        self.status = NegotiationStatus::Completed;
        self.outcome = Some(NegotiationOutcome::Agreement { terms });
        self.completed_at = Some(now);
        Ok(())
    }

    /// Fail the negotiation, closing any active round without consensus.
    /// Terminal negotiations are left untouched.
    pub fn fail(&mut self, reason: FailureReason, detail: Option<Payload>, now: DateTime<Utc>) {
        if self.is_terminal() {
            return;
        }
        if let Some(round) = self.active_round_mut() {
            round.close(RoundStatus::NoConsensus, None, now);
        }
        self.status = NegotiationStatus::Failed;
        self.outcome = Some(NegotiationOutcome::Failure { reason, detail });
        self.completed_at = Some(now);
    }

    /// Explicit end-of-session call from PENDING or IN_PROGRESS.
    pub fn end_session(&mut self, completion: EndSession, now: DateTime<Utc>) -> Result<()> {
        self.ensure_open("end")?;
        if self.expire_if_past_deadline(now) {
            return Err(CollectiveError::DeadlineExceeded(self.negotiation_id.clone()));
        }
        match completion {
            EndSession::Complete(terms) => self.complete_with(terms, now),
            EndSession::Fail(detail) => {
                self.fail(FailureReason::Cancelled, detail, now);
                Ok(())
            }
        }
    }
}

/// Read the `"allocation"` entry of a payload.
///
/// Non-numeric amounts are skipped.
pub fn parse_allocation(payload: &Payload) -> Option<AllocationMap> {
    let entries = payload.get(ALLOCATION_KEY)?.as_object()?;
    let mut allocation = AllocationMap::new();
    for (participant, held) in entries {
        let held = held.as_object()?;
        let amounts = held
            .iter()
            .filter_map(|(resource, amount)| amount.as_f64().map(|a| (resource.clone(), a)))
            .collect();
        allocation.insert(participant.clone(), amounts);
    }
    Some(allocation)
}

/// Encode an allocation under the `"allocation"` key.
pub fn allocation_payload(allocation: &AllocationMap) -> Payload {
    let entries: serde_json::Map<String, Value> = allocation
        .iter()
        .map(|(participant, held)| {
            let amounts: serde_json::Map<String, Value> = held
                .iter()
                .map(|(resource, amount)| (resource.clone(), Value::from(*amount)))
                .collect();
            (participant.clone(), Value::Object(amounts))
        })
        .collect();

    let mut payload = Payload::new();
    payload.insert(ALLOCATION_KEY.to_string(), Value::Object(entries));
    payload
}

/// Read a `"split"` entry like `"60/40"` as normalized shares in
/// participant order.
pub fn parse_split(payload: &Payload, participants: &[AgentId]) -> Option<BTreeMap<AgentId, f64>> {
    let parts: Vec<f64> = payload
        .get(SPLIT_KEY)?
        .as_str()?
        .split('/')
        .map(|part| part.trim().trim_end_matches('%').parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .ok()?;

    if parts.len() != participants.len() || parts.iter().any(|p| !p.is_finite() || *p < 0.0) {
        return None;
    }
    let sum: f64 = parts.iter().sum();
    if sum <= 0.0 {
        return None;
    }
    Some(
        participants
            .iter()
            .cloned()
            .zip(parts.iter().map(|p| p / sum))
            .collect(),
    )
}
