//! Telemark CLI
//!
//! Command-line interface for inspecting the bank telemarketing pipeline and
//! triggering runs of it.

mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "telemark")]
#[command(about = "Telemark batch pipeline CLI", long_about = None)]
struct Cli {
    /// UTC offset for evaluating the schedule, e.g. +01:00
    #[arg(
        long,
        global = true,
        env = "TELEMARK_TIMEZONE_OFFSET",
        default_value = "+00:00",
        value_parser = parse_offset
    )]
    timezone: chrono::FixedOffset,

    /// Log run progress
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

fn parse_offset(s: &str) -> Result<chrono::FixedOffset> {
    telemark_core::schedule::parse_offset(s)
        .ok_or_else(|| anyhow::anyhow!("invalid UTC offset `{}` (expected e.g. +01:00)", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "telemark_scheduler=info,telemark_client=info"
    } else {
        "warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config {
        timezone: cli.timezone,
        verbose: cli.verbose,
    };

    handle_command(cli.command, &config).await
}
