//! Team formation and negotiation for autonomous agents.
//!
//! This crate coordinates agents into task-specific teams and lets those
//! teams settle how shared tasks and resources are divided:
//!
//! - **Capability Registry**: Indexed agent capabilities and specializations
//! - **Team Formation**: Capability-based selection under named strategies
//! - **Performance Tracking**: Outcome-driven ratings used as a tie-break
//! - **Negotiation**: Bounded proposal rounds with consensus detection
//! - **Conflict Resolution**: Pluggable policies that force an outcome
//! - **Outcome Analysis**: Fairness scoring and success estimation
//!
//! # Usage
//!
//! ```ignore
//! use accord_collective::{
//!     Agent, CapabilityRegistry, NegotiationEngine, NegotiationSettings,
//!     NegotiationSpec, NegotiationType, PerformanceTracker, TaskRequirement,
//!     TeamFormationEngine,
//! };
//!
//! let tracker = Arc::new(PerformanceTracker::default());
//! let registry = Arc::new(CapabilityRegistry::new(tracker.clone()));
//! registry.register(Agent::new("x", "X").with_capability("reasoning", 0.9))?;
//!
//! // Form a team for a task
//! let formation = TeamFormationEngine::new(registry, Default::default());
//! let task = TaskRequirement::new("analysis").with_capability("reasoning", 0.7);
//! let team = formation.form_team(&task, "optimal_coverage")?;
//!
//! // Let the team negotiate its resources
//! let negotiation = NegotiationEngine::new(tracker, NegotiationSettings::default())?;
//! let spec = NegotiationSpec::new(NegotiationType::ResourceAllocation, &team.members[0])
//!     .with_participants(team.members.clone())
//!     .with_resource("compute_hours", 100.0);
//! let id = negotiation.create_negotiation(spec)?.negotiation_id;
//! let result = negotiation.run_automated(&id, "balanced")?;
//! ```

pub mod capability;
pub mod events;
pub mod formation;
pub mod negotiation;
pub mod outcome;
pub mod performance;
pub mod resolution;
pub mod types;

// Re-export main types for convenience
pub use capability::{tie_break, Agent, CapabilityRegistry};
pub use events::{BroadcastEventSink, CollectiveEvent, EventSink, NoopEventSink};
pub use formation::{
    FormationSettings, FormationStrategy, TaskRequirement, TaskStatus, Team, TeamFormationEngine,
    TeamStatus,
};
pub use negotiation::{
    DeadlineEnforcer, EndSession, Evaluation, FailureReason, Negotiation, NegotiationEngine,
    NegotiationOutcome, NegotiationRound, NegotiationSettings, NegotiationSpec, NegotiationStatus,
    NegotiationType, ParticipantProfile, Proposal, ProposalStrategy, ProposalStrategyRegistry,
    RoundStatus,
};
pub use outcome::OutcomeAnalyzer;
pub use performance::{PerformanceSettings, PerformanceTracker, RatingRecalculator, RatingRecord};
pub use resolution::{
    CompromiseResolution, ConflictContext, ConflictResolutionStrategy, PriorityBasedResolution,
    Resolution, ResolutionRegistry,
};
pub use types::{
    AgentId, AllocationMap, CapabilityName, CollectiveError, NegotiationId, Payload, Result,
    TaskId, TaskPriority, TeamId,
};
