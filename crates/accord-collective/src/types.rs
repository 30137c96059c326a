//! Common types used across team formation and negotiation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a registered agent.
pub type AgentId = String;

/// Unique identifier for a task requirement.
pub type TaskId = String;

/// Unique identifier for a formed team.
pub type TeamId = String;

/// Unique identifier for a negotiation.
pub type NegotiationId = String;

/// Unique identifier for a recorded proposal.
pub type ProposalId = String;

/// Capability name (e.g., "reasoning", "data_analysis"). Opaque, not enumerated.
pub type CapabilityName = String;

/// Domain specialization tag (e.g., "finance").
pub type Specialization = String;

/// Opaque structured key/value payload carried by proposals, round results
/// and negotiation outcomes.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Per-participant resource amounts: participant → resource → amount.
pub type AllocationMap = BTreeMap<AgentId, BTreeMap<String, f64>>;

/// Priority level of a task, ordered from lowest to highest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Error types for team formation and negotiation operations.
#[derive(Debug, thiserror::Error)]
pub enum CollectiveError {
    #[error("Insufficient capability for task {task_id}: {detail}")]
    InsufficientCapability {
        task_id: TaskId,
        missing: Vec<CapabilityName>,
        detail: String,
    },

    #[error("Team formation for task {task_id} exceeded its time budget of {budget_ms}ms")]
    FormationTimeout { task_id: TaskId, budget_ms: u64 },

    #[error("Participant {participant_id} is not part of negotiation {negotiation_id}")]
    UnknownParticipant {
        negotiation_id: NegotiationId,
        participant_id: AgentId,
    },

    #[error("Invalid state transition on {entity}: {detail}")]
    InvalidStateTransition { entity: String, detail: String },

    #[error("Negotiation {negotiation_id} reached its limit of {max_rounds} rounds")]
    MaxRoundsExceeded {
        negotiation_id: NegotiationId,
        max_rounds: u32,
    },

    #[error("Negotiation {0} passed its deadline")]
    DeadlineExceeded(NegotiationId),

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Agent already registered: {0}")]
    AgentAlreadyRegistered(AgentId),

    #[error("Agent {agent_id} is still a member of {active_teams} active team(s)")]
    AgentInUse { agent_id: AgentId, active_teams: u32 },

    #[error("Team not found: {0}")]
    TeamNotFound(TeamId),

    #[error("Negotiation not found: {0}")]
    NegotiationNotFound(NegotiationId),

    #[error("Unknown {kind} strategy: {name}")]
    UnknownStrategy { kind: &'static str, name: String },

    #[error("Invalid task requirement: {0}")]
    InvalidRequirement(String),

    #[error("Invalid negotiation: {0}")]
    InvalidNegotiation(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CollectiveError {
    pub(crate) fn transition(entity: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidStateTransition {
            entity: entity.into(),
            detail: detail.into(),
        }
    }

    /// Whether this error is a caller misuse rather than an exhausted search.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::UnknownParticipant { .. }
                | Self::InvalidStateTransition { .. }
                | Self::AgentNotFound(_)
                | Self::AgentAlreadyRegistered(_)
                | Self::TeamNotFound(_)
                | Self::NegotiationNotFound(_)
                | Self::UnknownStrategy { .. }
                | Self::InvalidRequirement(_)
                | Self::InvalidNegotiation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CollectiveError>;

/// Clamp a proficiency, rating or utility value into `[0, 1]`, mapping NaN to 0.
pub(crate) fn unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// `f64` counterpart of [`unit`].
pub(crate) fn unit64(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Configured span in seconds as a duration, capped at the longest
/// accepted span so the conversion cannot overflow.
pub(crate) fn span_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(accord_config::MAX_SPAN_SECS) as i64)
}
