//! Simulated collaborators for dry runs
//!
//! Nothing leaves the process: jobs succeed after an optional delay and
//! emails are written to the log.

use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use telemark_core::domain::step::EmailMessage;
use tracing::info;

use crate::error::Result;
use crate::{JobRunOutcome, JobRunRequest, JobTrigger, Notifier};

/// Job trigger whose runs always succeed
#[derive(Debug)]
pub struct SimulatedTrigger {
    delay: Duration,
    next_run_id: AtomicI64,
}

impl SimulatedTrigger {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    /// Each run takes `delay` before reporting success
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            next_run_id: AtomicI64::new(1),
        }
    }
}

impl Default for SimulatedTrigger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobTrigger for SimulatedTrigger {
    async fn run_job(&self, request: &JobRunRequest) -> Result<JobRunOutcome> {
        let job = &request.job;
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        info!(
            "[dry-run] job {} on '{}' with {:?} -> run {}",
            job.job_id, job.connection_id, job.notebook_params, run_id
        );
        if let Some(limit) = request.timeout.filter(|limit| *limit < self.delay) {
            tokio::time::sleep(limit).await;
            return Ok(JobRunOutcome {
                run_id,
                run_page_url: None,
                succeeded: false,
                message: Some(format!("timed out after {:?}", limit)),
            });
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(JobRunOutcome {
            run_id,
            run_page_url: None,
            succeeded: true,
            message: Some("simulated".to_string()),
        })
    }
}

/// Notifier that logs instead of sending
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            "[dry-run] email to {}: {}",
            message.to.join(", "),
            message.subject
        );
        Ok(())
    }
}
