//! Configuration management for the accord engines.

pub mod config;

pub use config::{
    AccordConfig, ConfigError, FormationConfig, LoggingConfig, NegotiationConfig,
    PerformanceConfig, MAX_SPAN_SECS,
};
