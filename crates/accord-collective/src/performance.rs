//! Performance ratings for agents and teams.
//!
//! Ratings are exponentially weighted moving averages of outcome quality.
//! They feed the team formation tie-break and negotiation success
//! prediction. Stale ratings drift back toward neutral through
//! [`PerformanceTracker::recompute_ratings`], which an external driver
//! (see [`RatingRecalculator`]) invokes on a schedule.

use crate::types::{span_secs, unit};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Weight kept from the previous rating on every update.
const RETAINED_WEIGHT: f32 = 0.6;

/// Weight given to the new quality sample.
const SAMPLE_WEIGHT: f32 = 0.4;

/// Tunables for the performance tracker.
#[derive(Debug, Clone)]
pub struct PerformanceSettings {
    pub failure_penalty: f32,
    pub neutral_rating: f32,
    pub decay_after: Duration,
    pub decay_rate: f32,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            failure_penalty: 0.5,
            neutral_rating: 0.5,
            decay_after: Duration::days(7),
            decay_rate: 0.1,
        }
    }
}

impl From<&accord_config::PerformanceConfig> for PerformanceSettings {
    fn from(config: &accord_config::PerformanceConfig) -> Self {
        Self {
            failure_penalty: config.failure_penalty,
            neutral_rating: config.neutral_rating,
            decay_after: span_secs(config.decay_after_secs),
            decay_rate: config.decay_rate,
        }
    }
}

/// Rating history for one agent or team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingRecord {
    /// Current rating (0.0 to 1.0)
    pub rating: f32,

    /// Number of outcomes folded into the rating
    pub samples: u64,

    /// Successful outcomes among `samples`
    pub successes: u64,

    /// Last time an outcome or seed touched the rating
    pub updated_at: DateTime<Utc>,

    /// Last time the rating was decayed
    pub decayed_at: Option<DateTime<Utc>>,
}

impl RatingRecord {
    fn new(rating: f32, now: DateTime<Utc>) -> Self {
        Self {
            rating: unit(rating),
            samples: 0,
            successes: 0,
            updated_at: now,
            decayed_at: None,
        }
    }

    /// Success ratio over recorded outcomes, if any.
    pub fn success_rate(&self) -> Option<f32> {
        if self.samples == 0 {
            None
        } else {
            Some(self.successes as f32 / self.samples as f32)
        }
    }

    fn last_touched(&self) -> DateTime<Utc> {
        match self.decayed_at {
            Some(decayed) if decayed > self.updated_at => decayed,
            _ => self.updated_at,
        }
    }
}

/// Tracks performance ratings and negotiation concession history.
///
/// Each subject's read-modify-write happens under the tracker lock, so
/// concurrent outcome reports for the same id never lose an update.
#[derive(Debug, Default)]
pub struct PerformanceTracker {
    settings: PerformanceSettings,
    ratings: Mutex<HashMap<String, RatingRecord>>,
    concession_rates: Mutex<HashMap<String, f32>>,
}

impl PerformanceTracker {
    /// Create a tracker with the given settings.
    pub fn new(settings: PerformanceSettings) -> Self {
        Self {
            settings,
            ratings: Mutex::new(HashMap::new()),
            concession_rates: Mutex::new(HashMap::new()),
        }
    }

    /// Get the tracker settings.
    pub fn settings(&self) -> &PerformanceSettings {
        &self.settings
    }

    /// Seed an initial rating for a subject. Existing ratings are kept.
    pub fn seed(&self, id: &str, rating: f32) {
        self.ratings
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| RatingRecord::new(rating, Utc::now()));
    }

    /// Fold an outcome into a subject's rating and return the new rating.
    ///
    /// `new = 0.6 * old + 0.4 * q`, where `q` is the quality score on
    /// success and the penalised quality score on failure.
    pub fn record_outcome(&self, id: &str, success: bool, quality_score: f32) -> f32 {
        let quality = unit(quality_score);
        let sample = if success {
            quality
        } else {
            quality * self.settings.failure_penalty
        };

        let now = Utc::now();
        let mut ratings = self.ratings.lock();
        let record = ratings
            .entry(id.to_string())
            .or_insert_with(|| RatingRecord::new(self.settings.neutral_rating, now));

        let previous = record.rating;
        record.rating = unit(RETAINED_WEIGHT * previous + SAMPLE_WEIGHT * sample);
        record.samples += 1;
        if success {
            record.successes += 1;
        }
        record.updated_at = now;

        debug!(
            subject = id,
            success,
            previous,
            rating = record.rating,
            "Recorded performance outcome"
        );
        record.rating
    }

    /// Current rating of a subject, if one is known.
    pub fn current_rating(&self, id: &str) -> Option<f32> {
        self.ratings.lock().get(id).map(|r| r.rating)
    }

    /// Current rating, or `fallback` for unknown subjects.
    pub fn rating_or(&self, id: &str, fallback: f32) -> f32 {
        self.current_rating(id).unwrap_or(fallback)
    }

    /// Snapshot of a subject's rating history.
    pub fn record(&self, id: &str) -> Option<RatingRecord> {
        self.ratings.lock().get(id).cloned()
    }

    /// Forget a subject (e.g., after deregistration).
    pub fn forget(&self, id: &str) {
        self.ratings.lock().remove(id);
        self.concession_rates.lock().remove(id);
    }

    /// Fold an observed per-round concession rate into a participant's history.
    pub fn record_concession_rate(&self, id: &str, rate: f32) {
        let rate = unit(rate);
        let mut rates = self.concession_rates.lock();
        let entry = rates.entry(id.to_string()).or_insert(rate);
        *entry = unit(RETAINED_WEIGHT * *entry + SAMPLE_WEIGHT * rate);
    }

    /// Historical concession rate of a participant, if any was observed.
    pub fn concession_rate(&self, id: &str) -> Option<f32> {
        self.concession_rates.lock().get(id).copied()
    }

    /// Decay ratings that have not been touched within the decay window.
    ///
    /// Each stale rating moves `decay_rate` of the way toward the neutral
    /// rating. A rating is decayed at most once per window. Returns the
    /// number of ratings adjusted.
    pub fn recompute_ratings(&self, now: DateTime<Utc>) -> usize {
        let neutral = self.settings.neutral_rating;
        let mut adjusted = 0;

        for record in self.ratings.lock().values_mut() {
            if now - record.last_touched() < self.settings.decay_after {
                continue;
            }
            record.rating = unit(record.rating + (neutral - record.rating) * self.settings.decay_rate);
            record.decayed_at = Some(now);
            adjusted += 1;
        }

        if adjusted > 0 {
            info!("Decayed {} stale performance rating(s)", adjusted);
        }
        adjusted
    }
}

/// Periodic driver for [`PerformanceTracker::recompute_ratings`].
#[derive(Debug, Clone)]
pub struct RatingRecalculator {
    tracker: Arc<PerformanceTracker>,
    interval: std::time::Duration,
}

impl RatingRecalculator {
    /// Create a recalculator with the given tick interval.
    pub fn new(tracker: Arc<PerformanceTracker>, interval: std::time::Duration) -> Self {
        Self { tracker, interval }
    }

    /// Create a recalculator ticking on the configured recompute interval.
    pub fn from_config(
        tracker: Arc<PerformanceTracker>,
        config: &accord_config::PerformanceConfig,
    ) -> Self {
        Self::new(
            tracker,
            std::time::Duration::from_secs(config.recompute_interval_secs),
        )
    }

    /// Run a single recomputation pass.
    pub fn run_once(&self, now: DateTime<Utc>) -> usize {
        self.tracker.recompute_ratings(now)
    }

    /// Run recomputation passes forever on the configured interval.
    pub async fn start(self: Arc<Self>) {
        info!(
            "Starting rating recalculator with interval {} seconds",
            self.interval.as_secs()
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            self.run_once(Utc::now());
        }
    }
}
