//! # accord
//!
//! Command-line driver for the team formation and negotiation engines.
//!
//! - `accord form --scenario FILE [--strategy NAME]` forms a team for the
//!   scenario's task
//! - `accord negotiate --scenario FILE [--strategy NAME] [--proposal-strategy NAME]`
//!   forms a team and runs an automated negotiation among its members
//!
//! Results are printed to stdout as JSON; logs go to stderr.

use accord_config::{AccordConfig, LoggingConfig};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

mod scenario;

use scenario::{Scenario, Session};

/// Team formation and negotiation for autonomous agents
#[derive(Parser)]
#[command(name = "accord")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Form a team for the scenario's task
    Form {
        /// Scenario file describing agents and the task
        #[arg(short, long, value_name = "FILE")]
        scenario: PathBuf,

        /// Formation strategy (defaults to the configured one)
        #[arg(long)]
        strategy: Option<String>,
    },

    /// Form a team and negotiate the scenario's resources among its members
    Negotiate {
        /// Scenario file describing agents, the task and resources
        #[arg(short, long, value_name = "FILE")]
        scenario: PathBuf,

        /// Formation strategy (defaults to the configured one)
        #[arg(long)]
        strategy: Option<String>,

        /// Proposal strategy for automated participants
        #[arg(long)]
        proposal_strategy: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AccordConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_logging(&config.logging)?;
    debug!(?config, "Loaded configuration");

    let output = match cli.command {
        Commands::Form { scenario, strategy } => {
            let session = Session::new(&config, Scenario::from_file(&scenario)?)?;
            serde_json::to_string_pretty(&session.form(strategy.as_deref())?)?
        }
        Commands::Negotiate {
            scenario,
            strategy,
            proposal_strategy,
        } => {
            let session = Session::new(&config, Scenario::from_file(&scenario)?)?;
            let drivers = session.spawn_drivers();
            let report = session.negotiate(strategy.as_deref(), proposal_strategy.as_deref());
            for driver in drivers {
                driver.abort();
            }
            serde_json::to_string_pretty(&report?)?
        }
    };

    println!("{}", output);
    Ok(())
}

/// Initialize tracing subscriber for logging
fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(&logging.level)
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if logging.json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
    Ok(())
}
