//! Run registry
//!
//! In-memory record of every run the scheduler has materialized. Admission
//! of a new run and the overlap check happen under one write lock, so two
//! requests for the same period cannot both slip through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use telemark_core::domain::pipeline::PipelineDefinition;
use telemark_core::domain::run::{RunInstance, RunTrigger};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// How to treat a run whose period already has an active run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Record the new run as skipped and do not execute it
    SkipActive,
    /// Execute every requested run
    Allow,
}

impl FromStr for OverlapPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip_active" | "skip" => Ok(Self::SkipActive),
            "allow" => Ok(Self::Allow),
            other => anyhow::bail!("unknown overlap policy `{}` (expected skip_active or allow)", other),
        }
    }
}

/// Result of asking the registry for a new run
#[derive(Debug, Clone)]
pub enum Admission {
    /// The run is queued and should be executed
    Admitted(RunInstance),
    /// The run was recorded as skipped; `active` is the run it overlaps with
    Skipped { run: RunInstance, active: Uuid },
}

impl Admission {
    pub fn run(&self) -> &RunInstance {
        match self {
            Admission::Admitted(run) | Admission::Skipped { run, .. } => run,
        }
    }

    pub fn into_run(self) -> RunInstance {
        match self {
            Admission::Admitted(run) | Admission::Skipped { run, .. } => run,
        }
    }
}

/// Thread-safe store of runs
#[derive(Debug)]
pub struct RunRegistry {
    policy: OverlapPolicy,
    runs: RwLock<Vec<RunInstance>>,
}

impl RunRegistry {
    pub fn new(policy: OverlapPolicy) -> Self {
        Self {
            policy,
            runs: RwLock::new(Vec::new()),
        }
    }

    pub fn policy(&self) -> OverlapPolicy {
        self.policy
    }

    /// Materializes a run for `logical_date`, applying the overlap policy
    pub async fn admit(
        &self,
        pipeline: &PipelineDefinition,
        logical_date: DateTime<Utc>,
        trigger: RunTrigger,
    ) -> Admission {
        let mut run = RunInstance::new(pipeline, logical_date, trigger);
        let mut runs = self.runs.write().await;

        let active = runs.iter().find(|r| {
            r.pipeline_id == pipeline.id && r.logical_date == logical_date && r.state.is_active()
        });

        let admission = match (self.policy, active) {
            (OverlapPolicy::SkipActive, Some(active)) => {
                info!(
                    "Skipping {:?} run of {} for {}: run {} is still {}",
                    trigger, pipeline.id, logical_date, active.id, active.state
                );
                let active = active.id;
                run.skip();
                Admission::Skipped { run, active }
            }
            _ => {
                debug!("Admitted run {} of {} for {}", run.id, pipeline.id, logical_date);
                Admission::Admitted(run)
            }
        };

        runs.push(admission.run().clone());
        admission
    }

    /// Stores the latest snapshot of a run
    pub async fn record(&self, run: &RunInstance) {
        let mut runs = self.runs.write().await;
        match runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => runs.push(run.clone()),
        }
    }

    /// All runs, oldest first
    pub async fn list(&self) -> Vec<RunInstance> {
        self.runs.read().await.clone()
    }

    pub async fn runs_for(&self, pipeline_id: &str, logical_date: DateTime<Utc>) -> Vec<RunInstance> {
        self.runs
            .read()
            .await
            .iter()
            .filter(|r| r.pipeline_id == pipeline_id && r.logical_date == logical_date)
            .cloned()
            .collect()
    }

    /// Number of runs that are queued or running
    pub async fn active_count(&self) -> usize {
        self.runs
            .read()
            .await
            .iter()
            .filter(|r| r.state.is_active())
            .count()
    }
}
