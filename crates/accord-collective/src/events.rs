//! Integration events published to external subscribers.
//!
//! Publication is fire-and-forget: a sink never fails the operation that
//! produced the event, and engines publish only after releasing their locks.

use crate::negotiation::{NegotiationOutcome, NegotiationStatus};
use crate::types::{AgentId, NegotiationId, TaskId, TeamId};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use tokio::sync::broadcast;
use tracing::debug;

/// Event emitted by the formation and negotiation engines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CollectiveEvent {
    /// A team was formed for a task
    TeamFormed {
        team_id: TeamId,
        task_id: TaskId,
        strategy: String,
        members: Vec<AgentId>,
    },
    /// A negotiation reached a terminal status
    NegotiationConcluded {
        negotiation_id: NegotiationId,
        status: NegotiationStatus,
        outcome: Option<NegotiationOutcome>,
        fairness: f64,
        participants: Vec<AgentId>,
    },
}

/// Destination for integration events.
pub trait EventSink: Send + Sync + Debug {
    /// Publish an event. Must not block and must not fail the caller.
    fn publish(&self, event: CollectiveEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn publish(&self, _event: CollectiveEvent) {}
}

/// Sink fanning events out over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<CollectiveEvent>,
}

impl BroadcastEventSink {
    /// Create a sink buffering up to `capacity` events per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CollectiveEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: CollectiveEvent) {
        if self.sender.send(event).is_err() {
            debug!("Dropped collective event: no subscribers");
        }
    }
}
