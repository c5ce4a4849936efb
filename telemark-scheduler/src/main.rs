//! Telemark Scheduler daemon
//!
//! Loads the configuration, checks the bundled pipeline against it and then
//! fires the pipeline on its schedule until the process is stopped.

use anyhow::{Context, Result};
use std::sync::Arc;
use telemark_client::{LogNotifier, Notifier};
use telemark_core::definitions::bank_telemarketing;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use telemark_scheduler::config::Config;
use telemark_scheduler::scheduler::CronScheduler;
use telemark_scheduler::service::{RunExecutor, RunRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "telemark_scheduler=info,telemark_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Telemark Scheduler");

    let config = load_config()?;
    info!(
        "Loaded configuration: timezone={}, max_active_runs={}, overlap_policy={:?}",
        config.timezone, config.max_active_runs, config.overlap_policy
    );

    let pipeline = bank_telemarketing().context("Invalid pipeline definition")?;
    config.check_pipeline(&pipeline)?;
    info!(
        "Loaded pipeline {} ({} steps, schedule '{}')",
        pipeline.id,
        pipeline.graph.len(),
        pipeline.schedule
    );

    let connections = config.build_connections();
    info!("Configured connections: {}", connections.ids().join(", "));

    let notifier: Arc<dyn Notifier> = match config.build_mail_relay() {
        Some(relay) => {
            info!("Sending email through {}", relay.base_url());
            Arc::new(relay)
        }
        None => {
            warn!("TELEMARK_MAIL_RELAY_URL not set, emails will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let registry = Arc::new(RunRegistry::new(config.overlap_policy));
    let executor = Arc::new(RunExecutor::new(Arc::new(connections), notifier, registry));
    let scheduler = CronScheduler::new(
        Arc::new(pipeline),
        executor,
        config.timezone,
        config.max_active_runs,
    );

    info!("Scheduler initialized successfully");

    if let Err(e) = scheduler.run().await {
        error!("Scheduler error: {:#}", e);
        return Err(e);
    }

    Ok(())
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<Config> {
    match Config::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(e) => {
            warn!("Failed to load config from environment ({:#}), using defaults", e);
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}
