//! Run command handler
//!
//! Triggers a manual run of the pipeline and prints how each step ended.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use colored::*;
use std::sync::Arc;
use telemark_client::{JobTrigger, LogNotifier, Notifier, SimulatedTrigger};
use telemark_core::domain::pipeline::PipelineDefinition;
use telemark_core::domain::run::{RunInstance, RunState, StepState};
use telemark_scheduler::config::Config as SchedulerConfig;
use telemark_scheduler::scheduler::CronScheduler;
use telemark_scheduler::service::{RunExecutor, RunRegistry};

use crate::config::Config;

/// Parse a trigger time
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM` or `YYYY-MM-DD`; the last two are UTC.
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M") {
        return Ok(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date.and_time(chrono::NaiveTime::MIN).and_utc());
    }
    anyhow::bail!("invalid time `{}` (expected RFC 3339, `YYYY-MM-DD HH:MM` or `YYYY-MM-DD`)", s)
}

/// Run the pipeline once for the period containing `at`
pub async fn run(
    pipeline: PipelineDefinition,
    dry_run: bool,
    at: Option<DateTime<Utc>>,
    json: bool,
    config: &Config,
) -> Result<()> {
    let (jobs, notifier, overlap_policy, max_active_runs): (
        Arc<dyn JobTrigger>,
        Arc<dyn Notifier>,
        _,
        _,
    ) = if dry_run {
        let defaults = SchedulerConfig::default();
        (
            Arc::new(SimulatedTrigger::new()) as Arc<dyn JobTrigger>,
            Arc::new(LogNotifier) as Arc<dyn Notifier>,
            defaults.overlap_policy,
            defaults.max_active_runs,
        )
    } else {
        let scheduler_config =
            SchedulerConfig::from_env().context("Failed to load configuration from environment")?;
        scheduler_config.validate()?;
        scheduler_config.check_pipeline(&pipeline)?;
        let notifier: Arc<dyn Notifier> = match scheduler_config.build_mail_relay() {
            Some(relay) => Arc::new(relay),
            None => {
                println!(
                    "{}",
                    "TELEMARK_MAIL_RELAY_URL not set, emails will only be logged".yellow()
                );
                Arc::new(LogNotifier)
            }
        };
        (
            Arc::new(scheduler_config.build_connections()) as Arc<dyn JobTrigger>,
            notifier,
            scheduler_config.overlap_policy,
            scheduler_config.max_active_runs,
        )
    };

    let registry = Arc::new(RunRegistry::new(overlap_policy));
    let executor = Arc::new(RunExecutor::new(jobs, notifier, registry));
    let scheduler = CronScheduler::new(
        Arc::new(pipeline),
        executor,
        config.timezone,
        max_active_runs,
    );

    if !json {
        println!(
            "{}",
            format!(
                "Running {}{}...",
                scheduler.pipeline().id,
                if dry_run { " (dry run)" } else { "" }
            )
            .bold()
        );
    }

    let run = scheduler.trigger_manual(at.unwrap_or_else(Utc::now)).await?;

    if json {
        let out = serde_json::to_string_pretty(&run).context("Failed to serialize run")?;
        println!("{}", out);
    } else {
        print_run(scheduler.pipeline(), &run, config);
    }

    match run.state {
        RunState::Succeeded | RunState::Skipped => Ok(()),
        _ => anyhow::bail!("run {} finished {}", run.id, run.state),
    }
}

fn print_run(pipeline: &PipelineDefinition, run: &RunInstance, config: &Config) {
    let state = match run.state {
        RunState::Succeeded => "✓ succeeded".green().bold(),
        RunState::Skipped => "↷ skipped".yellow().bold(),
        _ => "✗ failed".red().bold(),
    };
    println!("Run {} {}", run.id.to_string().cyan(), state);
    println!(
        "  Logical date: {}",
        run.logical_date
            .with_timezone(&config.timezone)
            .format("%Y-%m-%d %H:%M %:z")
    );

    for record in &run.steps {
        let display_id = pipeline
            .graph
            .step(&record.step_id)
            .map(|s| s.display_id.as_str())
            .unwrap_or(record.step_id.as_str());
        let state = match record.state {
            StepState::Succeeded => record.state.to_string().green(),
            StepState::Failed => record.state.to_string().red(),
            StepState::Pending | StepState::Skipped => record.state.to_string().dimmed(),
            StepState::Running | StepState::Retrying => record.state.to_string().yellow(),
        };
        println!(
            "  {} {:<28} {:<10} {}",
            "▸".cyan(),
            display_id,
            state,
            format!("{} attempt(s)", record.attempts.len()).dimmed()
        );

        if config.verbose {
            for attempt in &record.attempts {
                let mut line = format!(
                    "      #{} {}",
                    attempt.number,
                    attempt.started_at.format("%H:%M:%S")
                );
                if let Some(message) = &attempt.message {
                    line.push_str(&format!(" {}", message));
                }
                if let Some(url) = &attempt.external_run_url {
                    line.push_str(&format!(" {}", url));
                }
                println!("{}", line.dimmed());
            }
        }
    }
}
