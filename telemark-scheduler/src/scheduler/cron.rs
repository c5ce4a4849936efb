//! Cron ticker
//!
//! Sleeps until the next schedule tick, then admits a run for every due
//! tick and executes it in its own task. The number of runs executing at
//! once is bounded by a semaphore.

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use std::sync::Arc;
use std::time::Duration;
use telemark_core::domain::pipeline::PipelineDefinition;
use telemark_core::domain::run::{RunInstance, RunTrigger};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::service::{Admission, RunExecutor};

/// Fires scheduled runs of one pipeline
pub struct CronScheduler {
    pipeline: Arc<PipelineDefinition>,
    executor: Arc<RunExecutor>,
    offset: FixedOffset,
    semaphore: Arc<Semaphore>,
}

impl CronScheduler {
    pub fn new(
        pipeline: Arc<PipelineDefinition>,
        executor: Arc<RunExecutor>,
        offset: FixedOffset,
        max_active_runs: usize,
    ) -> Self {
        Self {
            pipeline,
            executor,
            offset,
            semaphore: Arc::new(Semaphore::new(max_active_runs)),
        }
    }

    pub fn pipeline(&self) -> &PipelineDefinition {
        &self.pipeline
    }

    /// The period a run triggered at `at` belongs to
    ///
    /// This is the latest tick at or before `at`; before the first tick ever
    /// the trigger time itself is used.
    pub fn logical_date_for(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        self.pipeline
            .schedule
            .latest_at_or_before(at, self.offset)
            .unwrap_or(at)
    }

    /// The tick considered already fired when the scheduler starts at `now`
    ///
    /// With catch-up nothing has fired yet and every tick since the start
    /// date is backfilled. Without catch-up only older periods are given up:
    /// the most recent tick still fires unless the registry already holds a
    /// run for it.
    pub async fn initial_watermark(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.pipeline.catchup {
            return None;
        }
        let latest = self.pipeline.schedule.latest_at_or_before(now, self.offset)?;
        let known = self
            .executor
            .registry()
            .runs_for(&self.pipeline.id, latest)
            .await;
        if known.is_empty() { None } else { Some(latest) }
    }

    /// Runs the pipeline now for the period containing `at`
    ///
    /// Executes inline and returns the final run. Under the skip-active
    /// overlap policy a run for a period that is still active comes back as
    /// a skipped run.
    pub async fn trigger_manual(&self, at: DateTime<Utc>) -> Result<RunInstance> {
        let logical_date = self.logical_date_for(at);
        let admission = self
            .executor
            .registry()
            .admit(&self.pipeline, logical_date, RunTrigger::Manual)
            .await;

        let run = match admission {
            Admission::Admitted(run) => run,
            Admission::Skipped { run, .. } => return Ok(run),
        };

        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .context("Run semaphore closed")?;
        self.executor.execute(&self.pipeline, run).await
    }

    /// Admits a scheduled run for `tick` and executes it in a new task
    ///
    /// Returns `None` when the run was skipped.
    pub async fn fire(&self, tick: DateTime<Utc>) -> Option<JoinHandle<()>> {
        let admission = self
            .executor
            .registry()
            .admit(&self.pipeline, tick, RunTrigger::Scheduled)
            .await;

        let run = match admission {
            Admission::Admitted(run) => run,
            Admission::Skipped { run, active } => {
                warn!(
                    "Scheduled run {} for {} skipped, run {} is still active",
                    run.id, tick, active
                );
                return None;
            }
        };

        let pipeline = Arc::clone(&self.pipeline);
        let executor = Arc::clone(&self.executor);
        let semaphore = Arc::clone(&self.semaphore);

        Some(tokio::spawn(async move {
            let run_id = run.id;
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Run {} not started: {}", run_id, e);
                    return;
                }
            };
            if let Err(e) = executor.execute(&pipeline, run).await {
                error!("Run {} aborted: {:#}", run_id, e);
            }
            // Permit is released when dropped
        }))
    }

    /// Fires every tick due at `now`
    ///
    /// Returns the new watermark and the handles of the spawned runs.
    pub async fn fire_due(
        &self,
        last_fired: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> (Option<DateTime<Utc>>, Vec<JoinHandle<()>>) {
        let ticks = self.pipeline.schedule.due_ticks(
            last_fired,
            now,
            self.pipeline.default_policy.start_date,
            self.pipeline.catchup,
            self.offset,
        );

        if ticks.is_empty() {
            debug!("No ticks due for {} at {}", self.pipeline.id, now);
            return (last_fired, Vec::new());
        }

        if ticks.len() > 1 {
            info!("Backfilling {} missed run(s) of {}", ticks.len(), self.pipeline.id);
        }

        let mut handles = Vec::new();
        for tick in &ticks {
            info!(
                "Firing {} for {} ({} run(s) active)",
                self.pipeline.id,
                tick,
                self.executor.registry().active_count().await
            );
            if let Some(handle) = self.fire(*tick).await {
                handles.push(handle);
            }
        }

        (ticks.last().copied().or(last_fired), handles)
    }

    /// Starts the ticking loop; returns only when the schedule never fires again
    pub async fn run(&self) -> Result<()> {
        info!(
            "Starting cron scheduler for {} (schedule '{}', offset {}, catchup {})",
            self.pipeline.id,
            self.pipeline.schedule,
            self.offset,
            self.pipeline.catchup
        );

        let mut last_fired = self.initial_watermark(Utc::now()).await;
        if let Some(tick) = last_fired {
            debug!("Treating {} as already handled", tick);
        }

        loop {
            let now = Utc::now();
            let (watermark, _handles) = self.fire_due(last_fired, now).await;
            last_fired = watermark;

            let Some(next) = self.pipeline.schedule.next_after(now, self.offset) else {
                warn!("Schedule of {} never fires again, stopping", self.pipeline.id);
                return Ok(());
            };

            info!("Next run of {} at {}", self.pipeline.id, next);
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
        }
    }
}
