//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod pipeline;
mod run;

use anyhow::Result;
use clap::Subcommand;
use telemark_core::definitions::bank_telemarketing;
use telemark_core::domain::pipeline::PipelineDefinition;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Print the pipeline definition
    Show {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate the pipeline definition
    Validate,
    /// Preview upcoming scheduled runs
    Schedule {
        /// Number of fire times to print
        #[arg(short, long, default_value = "6")]
        count: usize,

        /// Start from this time instead of now (RFC 3339, `YYYY-MM-DD HH:MM` or `YYYY-MM-DD`, UTC)
        #[arg(long, value_parser = run::parse_datetime)]
        after: Option<chrono::DateTime<chrono::Utc>>,
    },
    /// Trigger a manual run now
    Run {
        /// Use simulated jobs and log emails instead of sending them
        #[arg(long)]
        dry_run: bool,

        /// Trigger time deciding the run's period (defaults to now)
        #[arg(long, value_parser = run::parse_datetime)]
        at: Option<chrono::DateTime<chrono::Utc>>,

        /// Print the finished run as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Show { json } => pipeline::show(&load_pipeline()?, json),
        Commands::Validate => pipeline::validate(),
        Commands::Schedule { count, after } => {
            pipeline::schedule(&load_pipeline()?, count, after, config)
        }
        Commands::Run { dry_run, at, json } => {
            run::run(load_pipeline()?, dry_run, at, json, config).await
        }
    }
}

fn load_pipeline() -> Result<PipelineDefinition> {
    Ok(bank_telemarketing()?)
}
