//! Post-hoc analysis of negotiations.
//!
//! Everything here is read-only: fairness of the realized outcome and an
//! advisory estimate of how likely a running negotiation is to succeed.

use crate::negotiation::{parse_allocation, parse_split, Negotiation, NegotiationStatus};
use crate::performance::PerformanceTracker;
use crate::types::{unit64, AgentId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Weight of the remaining round budget in the success estimate.
const ROUNDS_WEIGHT: f64 = 0.3;
/// Weight of the proposal gap trend.
const TREND_WEIGHT: f64 = 0.4;
/// Weight of participants' willingness to concede.
const CONCESSION_WEIGHT: f64 = 0.3;
/// Per-round concession rate treated as fully cooperative.
const HEALTHY_CONCESSION_RATE: f64 = 0.1;

/// Fairness scoring and success estimation.
#[derive(Debug, Clone)]
pub struct OutcomeAnalyzer {
    tracker: Arc<PerformanceTracker>,
}

impl OutcomeAnalyzer {
    pub fn new(tracker: Arc<PerformanceTracker>) -> Self {
        Self { tracker }
    }

    /// Utility each participant realizes from the agreed terms.
    ///
    /// Reads an `"allocation"` or a `"split"` entry. `None` when the
    /// negotiation has no agreement or the terms carry neither.
    pub fn realized_utilities(&self, negotiation: &Negotiation) -> Option<BTreeMap<AgentId, f64>> {
        let terms = negotiation.outcome.as_ref()?.terms()?;
        let ids = negotiation.participant_ids();

        if let Some(allocation) = parse_allocation(terms) {
            return Some(
                ids.into_iter()
                    .map(|id| {
                        let utility = negotiation.utility_of(&id, &allocation);
                        (id, utility)
                    })
                    .collect(),
            );
        }
        parse_split(terms, &ids)
    }

    /// Normalized inverse variance of realized utility, in `[0, 1]`.
    ///
    /// `1 - var / (mean² · (n - 1))`: equal utilities score 1, one
    /// participant taking everything scores 0. Outcomes without a
    /// measurable allocation, fewer than two participants or zero mean
    /// utility score 1.
    pub fn fairness(&self, negotiation: &Negotiation) -> f64 {
        match self.realized_utilities(negotiation) {
            Some(utilities) => fairness_of(&utilities.into_values().collect::<Vec<_>>()),
            None => 1.0,
        }
    }

    /// Spread between the round's proposals, averaged over participants.
    ///
    /// One entry per round holding at least two readable allocations.
    pub fn round_gaps(&self, negotiation: &Negotiation) -> Vec<f64> {
        let ids = negotiation.participant_ids();
        negotiation
            .rounds
            .iter()
            .filter_map(|round| {
                let allocations: Vec<_> = round
                    .proposals
                    .iter()
                    .filter_map(|p| p.allocation())
                    .collect();
                if allocations.len() < 2 || ids.is_empty() {
                    return None;
                }

                let spread: f64 = ids
                    .iter()
                    .map(|id| {
                        let utilities = allocations.iter().map(|a| negotiation.utility_of(id, a));
                        let (lo, hi) = utilities.fold((f64::MAX, f64::MIN), |(lo, hi), u| {
                            (lo.min(u), hi.max(u))
                        });
                        hi - lo
                    })
                    .sum();
                Some(spread / ids.len() as f64)
            })
            .collect()
    }

    /// Mean per-round drop in the utility each participant claims for
    /// itself, for participants with proposals in at least two rounds.
    pub fn concession_rates(&self, negotiation: &Negotiation) -> BTreeMap<AgentId, f64> {
        let mut rates = BTreeMap::new();
        for id in negotiation.participant_ids() {
            let claimed: Vec<f64> = negotiation
                .rounds
                .iter()
                .filter_map(|round| round.latest_from(&id))
                .filter_map(|p| p.allocation())
                .map(|a| negotiation.utility_of(&id, &a))
                .collect();
            if claimed.len() < 2 {
                continue;
            }

            let drops: f64 = claimed
                .windows(2)
                .map(|pair| (pair[0] - pair[1]).max(0.0))
                .sum();
            rates.insert(id, unit64(drops / (claimed.len() - 1) as f64));
        }
        rates
    }

    /// Advisory likelihood, in `[0, 1]`, that the negotiation ends in
    /// agreement.
    ///
    /// Terminal negotiations score 1 (completed) or 0 (failed). Otherwise
    /// blends the remaining round budget, whether proposal gaps narrow, and
    /// participants' concession rates (observed here, else historical).
    pub fn predict_success(&self, negotiation: &Negotiation) -> f64 {
        match negotiation.status {
            NegotiationStatus::Completed => return 1.0,
            NegotiationStatus::Failed => return 0.0,
            _ => {}
        }

        let max_rounds = negotiation.max_rounds.max(1) as f64;
        let remaining = unit64((max_rounds - negotiation.current_round as f64) / max_rounds);

        let gaps = self.round_gaps(negotiation);
        let trend = match (gaps.first(), gaps.last()) {
            (Some(first), Some(last)) if gaps.len() >= 2 => {
                if *first <= f64::EPSILON {
                    if *last <= f64::EPSILON {
                        1.0
                    } else {
                        0.0
                    }
                } else {
                    unit64(0.5 + 0.5 * (first - last) / first)
                }
            }
            _ => 0.5,
        };

        let observed = self.concession_rates(negotiation);
        let ids = negotiation.participant_ids();
        let willingness = if ids.is_empty() {
            0.5
        } else {
            ids.iter()
                .map(|id| {
                    observed
                        .get(id)
                        .copied()
                        .or_else(|| self.tracker.concession_rate(id).map(f64::from))
                        .map(|rate| (rate / HEALTHY_CONCESSION_RATE).min(1.0))
                        .unwrap_or(0.5)
                })
                .sum::<f64>()
                / ids.len() as f64
        };

        unit64(ROUNDS_WEIGHT * remaining + TREND_WEIGHT * trend + CONCESSION_WEIGHT * willingness)
    }
}

/// Fairness of a set of utilities: `1 - var / (mean² · (n - 1))`.
pub fn fairness_of(utilities: &[f64]) -> f64 {
    let n = utilities.len();
    if n < 2 {
        return 1.0;
    }
    let mean = utilities.iter().sum::<f64>() / n as f64;
    if mean.abs() <= f64::EPSILON {
        return 1.0;
    }
    let variance = utilities.iter().map(|u| (u - mean).powi(2)).sum::<f64>() / n as f64;
    unit64(1.0 - variance / (mean * mean * (n - 1) as f64))
}
