use super::strategy::{concede, counter_proposal, ProposalContext, ProposalStrategyRegistry};
use super::{
    allocation_payload, EndSession, FailureReason, Negotiation, NegotiationSpec,
    NegotiationStatus, Proposal,
};
use crate::events::{CollectiveEvent, EventSink, NoopEventSink};
use crate::outcome::OutcomeAnalyzer;
use crate::performance::PerformanceTracker;
use crate::resolution::{ConflictContext, ConflictResolutionStrategy, ResolutionRegistry};
use crate::types::{span_secs, AllocationMap, CollectiveError, NegotiationId, Payload, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tunables for the negotiation engine.
#[derive(Debug, Clone)]
pub struct NegotiationSettings {
    pub max_rounds: u32,
    /// Deadline applied to negotiations that do not declare one
    pub deadline: Option<Duration>,
    pub concession_step: f64,
    pub primary_resolution: String,
    pub fallback_resolution: String,
    pub default_proposal_strategy: String,
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            deadline: None,
            concession_step: 0.1,
            primary_resolution: "priority_based".to_string(),
            fallback_resolution: "compromise".to_string(),
            default_proposal_strategy: "balanced".to_string(),
        }
    }
}

impl From<&accord_config::NegotiationConfig> for NegotiationSettings {
    fn from(config: &accord_config::NegotiationConfig) -> Self {
        Self {
            max_rounds: config.max_rounds,
            deadline: config.deadline_secs.map(span_secs),
            concession_step: config.concession_step,
            primary_resolution: config.primary_resolution.clone(),
            fallback_resolution: config.fallback_resolution.clone(),
            default_proposal_strategy: config.default_proposal_strategy.clone(),
        }
    }
}

/// A participant's judgement of a proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub accept: bool,
    /// Utility of the proposal for the evaluating participant
    pub utility: f64,
    /// Bounded counter-proposal offered on rejection
    pub counter_proposal: Option<Payload>,
}

/// Runs negotiations and their round state machines.
///
/// Each negotiation sits behind its own mutex, so transitions on one
/// negotiation are serialized while different negotiations proceed
/// independently. Conclusion events are published after the lock is
/// released.
#[derive(Debug)]
pub struct NegotiationEngine {
    settings: NegotiationSettings,
    negotiations: RwLock<HashMap<NegotiationId, Arc<Mutex<Negotiation>>>>,
    proposals: ProposalStrategyRegistry,
    resolutions: ResolutionRegistry,
    primary: Arc<dyn ConflictResolutionStrategy>,
    fallback: Arc<dyn ConflictResolutionStrategy>,
    analyzer: OutcomeAnalyzer,
    tracker: Arc<PerformanceTracker>,
    events: Arc<dyn EventSink>,
}

impl NegotiationEngine {
    /// Create an engine with the built-in proposal and resolution strategies.
    pub fn new(tracker: Arc<PerformanceTracker>, settings: NegotiationSettings) -> Result<Self> {
        Self::with_strategies(
            tracker,
            settings,
            ProposalStrategyRegistry::with_defaults(),
            ResolutionRegistry::with_defaults(),
        )
    }

    /// Create an engine with custom strategy registries.
    ///
    /// The configured primary and fallback resolution strategies and the
    /// default proposal strategy are resolved here.
    pub fn with_strategies(
        tracker: Arc<PerformanceTracker>,
        settings: NegotiationSettings,
        proposals: ProposalStrategyRegistry,
        resolutions: ResolutionRegistry,
    ) -> Result<Self> {
        if settings.max_rounds == 0 {
            return Err(CollectiveError::InvalidNegotiation(
                "max_rounds must be at least 1".to_string(),
            ));
        }
        let primary = resolutions.get(&settings.primary_resolution)?;
        let fallback = resolutions.get(&settings.fallback_resolution)?;
        proposals.get(&settings.default_proposal_strategy)?;

        Ok(Self {
            settings,
            negotiations: RwLock::new(HashMap::new()),
            proposals,
            resolutions,
            primary,
            fallback,
            analyzer: OutcomeAnalyzer::new(tracker.clone()),
            tracker,
            events: Arc::new(NoopEventSink),
        })
    }

    /// Publish conclusion events to `events`.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn settings(&self) -> &NegotiationSettings {
        &self.settings
    }

    pub fn analyzer(&self) -> &OutcomeAnalyzer {
        &self.analyzer
    }

    /// Open a PENDING negotiation.
    pub fn create_negotiation(&self, mut spec: NegotiationSpec) -> Result<Negotiation> {
        let now = Utc::now();
        if spec.deadline.is_none() {
            if let Some(window) = self.settings.deadline {
                let deadline = now.checked_add_signed(window).ok_or_else(|| {
                    CollectiveError::InvalidNegotiation(format!(
                        "deadline window of {} seconds is out of range",
                        window.num_seconds()
                    ))
                })?;
                spec.deadline = Some(deadline);
            }
        }

        let negotiation = Negotiation::from_spec(spec, self.settings.max_rounds, now)?;
        self.negotiations.write().insert(
            negotiation.negotiation_id.clone(),
            Arc::new(Mutex::new(negotiation.clone())),
        );

        info!(
            negotiation_id = %negotiation.negotiation_id,
            participants = negotiation.participants.len(),
            max_rounds = negotiation.max_rounds,
            "Created negotiation"
        );
        Ok(negotiation)
    }

    /// Start a PENDING negotiation by opening round 1.
    pub fn start_negotiation(&self, negotiation_id: &str) -> Result<u32> {
        self.transition(negotiation_id, |n, now| {
            if n.status != NegotiationStatus::Pending {
                return Err(CollectiveError::transition(
                    format!("negotiation {}", n.negotiation_id),
                    format!("cannot start a {:?} negotiation", n.status),
                ));
            }
            n.start_new_round(now)
        })
    }

    /// Open the next round.
    pub fn start_new_round(&self, negotiation_id: &str) -> Result<u32> {
        let round = self.transition(negotiation_id, |n, now| n.start_new_round(now))?;
        debug!(negotiation_id, round, "Opened negotiation round");
        Ok(round)
    }

    /// Record a proposal in the active round.
    pub fn submit_proposal(
        &self,
        negotiation_id: &str,
        participant_id: &str,
        content: Payload,
    ) -> Result<Proposal> {
        let proposal = self.transition(negotiation_id, |n, now| {
            n.submit_proposal(participant_id, content, now)
        })?;
        debug!(negotiation_id, participant_id, "Recorded proposal");
        Ok(proposal)
    }

    /// Close the active round with or without consensus.
    pub fn complete_current_round(
        &self,
        negotiation_id: &str,
        consensus_reached: bool,
        result: Payload,
    ) -> Result<NegotiationStatus> {
        self.transition(negotiation_id, |n, now| {
            n.complete_current_round(consensus_reached, result, now)
        })
    }

    /// Adjudicate or cancel a negotiation.
    pub fn end_session(&self, negotiation_id: &str, completion: EndSession) -> Result<Negotiation> {
        self.transition(negotiation_id, |n, now| {
            n.end_session(completion, now)?;
            Ok(n.clone())
        })
    }

    /// Fail every negotiation whose deadline has passed.
    ///
    /// Returns the ids of the negotiations expired by this call.
    pub fn enforce_deadlines(&self, now: DateTime<Utc>) -> Vec<NegotiationId> {
        let handles: Vec<Arc<Mutex<Negotiation>>> =
            self.negotiations.read().values().cloned().collect();

        let mut expired = Vec::new();
        for handle in handles {
            let event = {
                let mut negotiation = handle.lock();
                let Some(event) = self.expire(&mut negotiation, now) else {
                    continue;
                };
                expired.push(negotiation.negotiation_id.clone());
                event
            };
            self.events.publish(event);
        }

        if !expired.is_empty() {
            warn!("Expired {} negotiation(s) past their deadline", expired.len());
        }
        expired
    }

    /// Allocation a participant would propose under the named strategy.
    pub fn generate_proposal(
        &self,
        negotiation_id: &str,
        participant_id: &str,
        strategy_name: &str,
    ) -> Result<Payload> {
        let strategy = self.proposals.get(strategy_name)?;
        self.read(negotiation_id, |n| {
            ensure_participant(n, participant_id)?;
            let allocation = strategy.allocate(&ProposalContext::new(n, participant_id));
            Ok(proposal_content(strategy.name(), &allocation))
        })
    }

    /// Judge a proposal from a participant's point of view.
    pub fn evaluate_proposal(
        &self,
        negotiation_id: &str,
        proposal: &Proposal,
        participant_id: &str,
        strategy_name: &str,
    ) -> Result<Evaluation> {
        let strategy = self.proposals.get(strategy_name)?;
        let step = self.settings.concession_step;

        self.read(negotiation_id, |n| {
            ensure_participant(n, participant_id)?;
            let participants = n.participants.len();

            let evaluation = match proposal.allocation() {
                Some(allocation) => {
                    let utility = n.utility_of(participant_id, &allocation);
                    let accept = strategy.accepts(utility, participants);
                    let counter_proposal = if accept {
                        None
                    } else {
                        counter_proposal(n, participant_id, &allocation, step)
                            .map(|a| proposal_content(strategy.name(), &a))
                    };
                    Evaluation {
                        accept,
                        utility,
                        counter_proposal,
                    }
                }
                None => {
                    // Unreadable content: answer with our own proposal
                    let own = strategy.allocate(&ProposalContext::new(n, participant_id));
                    Evaluation {
                        accept: false,
                        utility: 0.0,
                        counter_proposal: Some(proposal_content(strategy.name(), &own)),
                    }
                }
            };
            Ok(evaluation)
        })
    }

    /// Concession narrowing the gap between an agent's latest proposal and
    /// the latest counterpart proposal. `None` when either is missing or
    /// nothing is contested.
    pub fn suggest_concession(&self, negotiation_id: &str, agent_id: &str) -> Result<Option<Payload>> {
        self.read(negotiation_id, |n| {
            ensure_participant(n, agent_id)?;
            let own = n.latest_proposal_of(agent_id).and_then(|p| p.allocation());
            let counterpart = n
                .latest_counterpart_proposal(agent_id)
                .and_then(|p| p.allocation());

            Ok(match (own, counterpart) {
                (Some(own), Some(counterpart)) => {
                    concede(n, agent_id, &own, &counterpart, n.progress()).map(|a| {
                        let mut content = allocation_payload(&a);
                        content.insert(
                            "concession_from".to_string(),
                            Value::String(agent_id.to_string()),
                        );
                        content
                    })
                }
                _ => None,
            })
        })
    }

    /// Fairness of the realized outcome, in `[0, 1]`.
    pub fn calculate_fairness(&self, negotiation_id: &str) -> Result<f64> {
        self.read(negotiation_id, |n| Ok(self.analyzer.fairness(n)))
    }

    /// Advisory likelihood of agreement, in `[0, 1]`.
    pub fn predict_negotiation_success(&self, negotiation_id: &str) -> Result<f64> {
        self.read(negotiation_id, |n| Ok(self.analyzer.predict_success(n)))
    }

    /// Force a terminal outcome with the named resolution strategy.
    ///
    /// The configured fallback runs only when the named strategy cannot
    /// decide. When neither can, the negotiation fails with `NO_CONSENSUS`.
    pub fn resolve_negotiation(&self, negotiation_id: &str, strategy_name: &str) -> Result<Negotiation> {
        let primary = self.resolutions.get(strategy_name)?;
        self.resolve_with(negotiation_id, primary)
    }

    /// Resolve with the configured primary strategy.
    pub fn resolve_negotiation_default(&self, negotiation_id: &str) -> Result<Negotiation> {
        self.resolve_with(negotiation_id, self.primary.clone())
    }

    fn resolve_with(
        &self,
        negotiation_id: &str,
        primary: Arc<dyn ConflictResolutionStrategy>,
    ) -> Result<Negotiation> {
        self.transition(negotiation_id, |n, now| {
            if n.is_terminal() {
                return Err(CollectiveError::transition(
                    format!("negotiation {}", n.negotiation_id),
                    format!("cannot resolve a {:?} negotiation", n.status),
                ));
            }
            if n.expire_if_past_deadline(now) {
                return Err(CollectiveError::DeadlineExceeded(n.negotiation_id.clone()));
            }

            let resolution = {
                let ctx = ConflictContext::new(n);
                primary.resolve(&ctx).or_else(|| {
                    warn!(
                        negotiation_id = %n.negotiation_id,
                        strategy = primary.name(),
                        fallback = self.fallback.name(),
                        "Resolution strategy could not decide, trying fallback"
                    );
                    self.fallback.resolve(&ctx)
                })
            };

            match resolution {
                Some(resolution) => n.complete_with(resolution.into_payload(), now)?,
                None => {
                    warn!(
                        negotiation_id = %n.negotiation_id,
                        "No resolution strategy could decide"
                    );
                    n.fail(FailureReason::NoConsensus, None, now);
                }
            }
            Ok(n.clone())
        })
    }

    /// Run one round for automated participants.
    ///
    /// Opens a round if none is active, has every participant submit the
    /// strategy's proposal, and closes the round with consensus on the first
    /// proposal every other participant accepts.
    pub fn run_automated_round(
        &self,
        negotiation_id: &str,
        strategy_name: &str,
    ) -> Result<NegotiationStatus> {
        let strategy = self.proposals.get(strategy_name)?;

        self.transition(negotiation_id, |n, now| {
            if n.is_terminal() {
                return Err(CollectiveError::transition(
                    format!("negotiation {}", n.negotiation_id),
                    format!("cannot run a round on a {:?} negotiation", n.status),
                ));
            }
            if n.active_round().is_none() {
                n.start_new_round(now)?;
            }

            for participant in n.participant_ids() {
                let allocation = strategy.allocate(&ProposalContext::new(n, &participant));
                n.submit_proposal(&participant, proposal_content(strategy.name(), &allocation), now)?;
            }

            let participants = n.participants.len();
            let agreed = n.active_round().and_then(|round| {
                round
                    .proposals
                    .iter()
                    .find(|proposal| {
                        proposal
                            .allocation()
                            .map(|allocation| {
                                n.participants
                                    .iter()
                                    .filter(|p| p.agent_id != proposal.participant_id)
                                    .all(|p| {
                                        strategy.accepts(
                                            n.utility_of(&p.agent_id, &allocation),
                                            participants,
                                        )
                                    })
                            })
                            .unwrap_or(false)
                    })
                    .map(|proposal| proposal.content.clone())
            });

            debug!(
                negotiation_id = %n.negotiation_id,
                round = n.current_round,
                consensus = agreed.is_some(),
                "Automated round finished"
            );

            match agreed {
                Some(terms) => n.complete_current_round(true, terms, now),
                None => {
                    let mut summary = Payload::new();
                    summary.insert("proposals".to_string(), Value::from(participants));
                    n.complete_current_round(false, summary, now)
                }
            }
        })
    }

    /// Run automated rounds until the negotiation is terminal.
    ///
    /// A negotiation that expires along the way is returned in its FAILED
    /// state rather than as an error.
    pub fn run_automated(&self, negotiation_id: &str, strategy_name: &str) -> Result<Negotiation> {
        loop {
            match self.run_automated_round(negotiation_id, strategy_name) {
                Ok(status) if status.is_terminal() => break,
                Ok(_) => {}
                Err(err) => {
                    let expired = self.negotiation(negotiation_id).is_some_and(|n| {
                        n.outcome.and_then(|o| o.failure_reason())
                            == Some(FailureReason::DeadlineExceeded)
                    });
                    if expired {
                        break;
                    }
                    return Err(err);
                }
            }
        }
        self.negotiation(negotiation_id)
            .ok_or_else(|| CollectiveError::NegotiationNotFound(negotiation_id.to_string()))
    }

    /// Snapshot of a negotiation. An elapsed deadline is applied first.
    pub fn negotiation(&self, negotiation_id: &str) -> Option<Negotiation> {
        let handle = self.negotiations.read().get(negotiation_id).cloned()?;
        Some(self.snapshot(&handle))
    }

    /// Negotiations that are PENDING or IN_PROGRESS, oldest first.
    pub fn active_negotiations(&self) -> Vec<Negotiation> {
        let handles: Vec<Arc<Mutex<Negotiation>>> =
            self.negotiations.read().values().cloned().collect();
        let mut active: Vec<Negotiation> = handles
            .iter()
            .map(|h| self.snapshot(h))
            .filter(|n| !n.is_terminal())
            .collect();
        active.sort_by_key(|n| n.created_at);
        active
    }

    fn snapshot(&self, handle: &Mutex<Negotiation>) -> Negotiation {
        let (negotiation, expired) = {
            let mut negotiation = handle.lock();
            let expired = self.expire(&mut negotiation, Utc::now());
            (negotiation.clone(), expired)
        };
        if let Some(event) = expired {
            self.events.publish(event);
        }
        negotiation
    }

    /// Fail a negotiation whose deadline has passed, returning its
    /// conclusion event. Called with the negotiation's lock held.
    fn expire(&self, negotiation: &mut Negotiation, now: DateTime<Utc>) -> Option<CollectiveEvent> {
        if negotiation.expire_if_past_deadline(now) {
            warn!(
                negotiation_id = %negotiation.negotiation_id,
                "Negotiation deadline elapsed"
            );
            Some(self.conclude(negotiation))
        } else {
            None
        }
    }

    fn handle(&self, negotiation_id: &str) -> Result<Arc<Mutex<Negotiation>>> {
        self.negotiations
            .read()
            .get(negotiation_id)
            .cloned()
            .ok_or_else(|| CollectiveError::NegotiationNotFound(negotiation_id.to_string()))
    }

    /// Run a read-only query under the negotiation's lock, after applying
    /// an elapsed deadline.
    fn read<T>(&self, negotiation_id: &str, f: impl FnOnce(&Negotiation) -> Result<T>) -> Result<T> {
        let handle = self.handle(negotiation_id)?;
        let (result, expired) = {
            let mut negotiation = handle.lock();
            let expired = self.expire(&mut negotiation, Utc::now());
            (f(&negotiation), expired)
        };
        if let Some(event) = expired {
            self.events.publish(event);
        }
        result
    }

    /// Apply a transition under the negotiation's lock and publish the
    /// conclusion event if it made the negotiation terminal.
    fn transition<T>(
        &self,
        negotiation_id: &str,
        f: impl FnOnce(&mut Negotiation, DateTime<Utc>) -> Result<T>,
    ) -> Result<T> {
        let handle = self.handle(negotiation_id)?;
        let now = Utc::now();

        let (result, concluded) = {
            let mut negotiation = handle.lock();
            let was_terminal = negotiation.is_terminal();
            let result = f(&mut negotiation, now);
            let concluded = if !was_terminal && negotiation.is_terminal() {
                Some(self.conclude(&negotiation))
            } else {
                None
            };
            (result, concluded)
        };

        if let Some(event) = concluded {
            self.events.publish(event);
        }
        result
    }

    /// Feed a terminal negotiation back into the tracker and build its event.
    fn conclude(&self, negotiation: &Negotiation) -> CollectiveEvent {
        let fairness = self.analyzer.fairness(negotiation);
        for (participant, rate) in self.analyzer.concession_rates(negotiation) {
            self.tracker.record_concession_rate(&participant, rate as f32);
        }

        info!(
            negotiation_id = %negotiation.negotiation_id,
            status = ?negotiation.status,
            rounds = negotiation.current_round,
            fairness,
            "Negotiation concluded"
        );

        CollectiveEvent::NegotiationConcluded {
            negotiation_id: negotiation.negotiation_id.clone(),
            status: negotiation.status,
            outcome: negotiation.outcome.clone(),
            fairness,
            participants: negotiation.participant_ids(),
        }
    }
}

fn ensure_participant(negotiation: &Negotiation, participant_id: &str) -> Result<()> {
    if negotiation.has_participant(participant_id) {
        Ok(())
    } else {
        Err(CollectiveError::UnknownParticipant {
            negotiation_id: negotiation.negotiation_id.clone(),
            participant_id: participant_id.to_string(),
        })
    }
}

fn proposal_content(strategy: &str, allocation: &AllocationMap) -> Payload {
    let mut content = allocation_payload(allocation);
    content.insert("strategy".to_string(), Value::String(strategy.to_string()));
    content
}

/// Periodic driver for [`NegotiationEngine::enforce_deadlines`].
#[derive(Debug, Clone)]
pub struct DeadlineEnforcer {
    engine: Arc<NegotiationEngine>,
    interval: std::time::Duration,
}

impl DeadlineEnforcer {
    /// Create an enforcer sweeping on the given interval.
    pub fn new(engine: Arc<NegotiationEngine>, interval: std::time::Duration) -> Self {
        Self { engine, interval }
    }

    /// Create an enforcer sweeping on the configured interval.
    pub fn from_config(
        engine: Arc<NegotiationEngine>,
        config: &accord_config::NegotiationConfig,
    ) -> Self {
        Self::new(
            engine,
            std::time::Duration::from_millis(config.deadline_sweep_ms),
        )
    }

    /// Run a single sweep.
    pub fn run_once(&self, now: DateTime<Utc>) -> Vec<NegotiationId> {
        self.engine.enforce_deadlines(now)
    }

    /// Sweep forever on the configured interval.
    pub async fn start(self: Arc<Self>) {
        info!(
            "Starting deadline enforcer with interval {} ms",
            self.interval.as_millis()
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            self.run_once(Utc::now());
        }
    }
}
