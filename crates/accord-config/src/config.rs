//! Typed configuration for the formation and negotiation engines.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable overriding the log filter.
pub const ENV_LOG: &str = "ACCORD_LOG";
/// Environment variable overriding the negotiation round bound.
pub const ENV_MAX_ROUNDS: &str = "ACCORD_MAX_ROUNDS";
/// Environment variable overriding the formation time budget.
pub const ENV_FORMATION_BUDGET_MS: &str = "ACCORD_FORMATION_BUDGET_MS";

/// Longest span accepted for deadlines and decay windows (ten years).
pub const MAX_SPAN_SECS: u64 = 10 * 365 * 24 * 3600;

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AccordConfig {
    pub formation: FormationConfig,
    pub negotiation: NegotiationConfig,
    pub performance: PerformanceConfig,
    pub logging: LoggingConfig,
}

/// `[formation]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FormationConfig {
    /// Wall-clock budget for a single formation, in milliseconds
    pub time_budget_ms: u64,
    /// Strategy used when the caller does not name one
    pub default_strategy: String,
    /// Let the specialized-domain strategy fall back to the full pool
    pub allow_domain_fallback: bool,
    /// Minimum level gain for optimal coverage to add another member
    pub improvement_epsilon: f32,
}

impl Default for FormationConfig {
    fn default() -> Self {
        Self {
            time_budget_ms: 5_000,
            default_strategy: "optimal_coverage".to_string(),
            allow_domain_fallback: false,
            improvement_epsilon: 0.05,
        }
    }
}

/// `[negotiation]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Round bound applied when a negotiation does not declare one
    pub max_rounds: u32,
    /// Optional wall-clock deadline applied to new negotiations
    pub deadline_secs: Option<u64>,
    /// Fraction of a resource's total moved by one counter-proposal
    pub concession_step: f64,
    pub primary_resolution: String,
    pub fallback_resolution: String,
    pub default_proposal_strategy: String,
    /// How often the deadline sweep runs, in milliseconds
    pub deadline_sweep_ms: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            deadline_secs: None,
            concession_step: 0.1,
            primary_resolution: "priority_based".to_string(),
            fallback_resolution: "compromise".to_string(),
            default_proposal_strategy: "balanced".to_string(),
            deadline_sweep_ms: 1_000,
        }
    }
}

/// `[performance]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Multiplier (< 1) applied to the quality score of a failed outcome
    pub failure_penalty: f32,
    /// Rating assumed for unseen subjects and targeted by decay
    pub neutral_rating: f32,
    /// Ratings untouched for this long are decayed by `recompute_ratings`
    pub decay_after_secs: u64,
    /// Fraction of the distance to neutral removed per decay pass
    pub decay_rate: f32,
    pub recompute_interval_secs: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            failure_penalty: 0.5,
            neutral_rating: 0.5,
            decay_after_secs: 7 * 24 * 3600,
            decay_rate: 0.1,
            recompute_interval_secs: 3600,
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AccordConfig {
    /// Default config file location (`<config dir>/accord/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "accord", "accord")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load configuration.
    ///
    /// An explicit path must exist. Without one the default location is used
    /// when present, otherwise built-in defaults. Environment overrides are
    /// applied last and the result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(default) if default.is_file() => Self::from_file(&default)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file without applying overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loading configuration from {}", path.display());
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `ACCORD_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(level) = std::env::var(ENV_LOG) {
            if !level.trim().is_empty() {
                self.logging.level = level;
            }
        }
        if let Ok(raw) = std::env::var(ENV_MAX_ROUNDS) {
            self.negotiation.max_rounds = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: ENV_MAX_ROUNDS.to_string(),
                reason: format!("expected a positive integer, got '{}'", raw),
            })?;
        }
        if let Ok(raw) = std::env::var(ENV_FORMATION_BUDGET_MS) {
            self.formation.time_budget_ms =
                raw.trim().parse().map_err(|_| ConfigError::Invalid {
                    key: ENV_FORMATION_BUDGET_MS.to_string(),
                    reason: format!("expected milliseconds, got '{}'", raw),
                })?;
        }
        Ok(())
    }

    /// Reject values the engines cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.negotiation.max_rounds == 0 {
            return Err(invalid("negotiation.max_rounds", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.negotiation.concession_step)
            || self.negotiation.concession_step == 0.0
        {
            return Err(invalid(
                "negotiation.concession_step",
                "must be in (0, 1]",
            ));
        }
        if let Some(secs) = self.negotiation.deadline_secs {
            if secs == 0 || secs > MAX_SPAN_SECS {
                return Err(invalid(
                    "negotiation.deadline_secs",
                    "must be between 1 second and 10 years",
                ));
            }
        }
        if self.negotiation.deadline_sweep_ms == 0 {
            return Err(invalid("negotiation.deadline_sweep_ms", "must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.performance.failure_penalty) {
            return Err(invalid("performance.failure_penalty", "must be in [0, 1)"));
        }
        if !(0.0..=1.0).contains(&self.performance.neutral_rating) {
            return Err(invalid("performance.neutral_rating", "must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.performance.decay_rate) {
            return Err(invalid("performance.decay_rate", "must be in [0, 1]"));
        }
        if self.performance.decay_after_secs > MAX_SPAN_SECS {
            return Err(invalid(
                "performance.decay_after_secs",
                "must be at most 10 years",
            ));
        }
        if self.performance.recompute_interval_secs == 0 {
            return Err(invalid(
                "performance.recompute_interval_secs",
                "must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.formation.improvement_epsilon) {
            return Err(invalid("formation.improvement_epsilon", "must be in [0, 1]"));
        }
        Ok(())
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn clear_env() {
        std::env::remove_var(ENV_LOG);
        std::env::remove_var(ENV_MAX_ROUNDS);
        std::env::remove_var(ENV_FORMATION_BUDGET_MS);
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AccordConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.negotiation.max_rounds, 5);
        assert_eq!(config.formation.default_strategy, "optimal_coverage");
    }

    #[test]
    #[serial]
    fn test_partial_file_keeps_defaults() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[negotiation]\nmax_rounds = 8\n\n[formation]\nallow_domain_fallback = true\n"
        )
        .unwrap();

        let config = AccordConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.negotiation.max_rounds, 8);
        assert!(config.formation.allow_domain_fallback);
        assert_eq!(config.negotiation.primary_resolution, "priority_based");
        assert_eq!(config.performance, PerformanceConfig::default());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var(ENV_MAX_ROUNDS, "12");
        std::env::set_var(ENV_LOG, "accord=debug");

        let mut config = AccordConfig::default();
        config.apply_env_overrides().unwrap();
        clear_env();

        assert_eq!(config.negotiation.max_rounds, 12);
        assert_eq!(config.logging.level, "accord=debug");
    }

    #[test]
    #[serial]
    fn test_bad_env_override_is_rejected() {
        clear_env();
        std::env::set_var(ENV_FORMATION_BUDGET_MS, "soon");
        let result = AccordConfig::default().apply_env_overrides();
        clear_env();

        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_validation_rejects_zero_rounds() {
        let mut config = AccordConfig::default();
        config.negotiation.max_rounds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_bounds_deadline() {
        let mut config = AccordConfig::default();
        config.negotiation.deadline_secs = Some(10_000_000_000_000);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        config.negotiation.deadline_secs = Some(0);
        assert!(config.validate().is_err());

        config.negotiation.deadline_secs = Some(MAX_SPAN_SECS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_bounds_decay_window() {
        let mut config = AccordConfig::default();
        config.performance.decay_after_secs = 10_000_000_000_000_000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        config.performance.decay_after_secs = u64::MAX;
        assert!(config.validate().is_err());

        config.performance.decay_after_secs = MAX_SPAN_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_sweep() {
        let mut config = AccordConfig::default();
        config.negotiation.deadline_sweep_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = AccordConfig::from_file(Path::new("/nonexistent/accord.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
