//! Run execution
//!
//! Drives one `RunInstance` through its steps:
//! - Steps start in topological order, one at a time, and only once every
//!   upstream step has succeeded
//! - Failed attempts of retryable steps are retried after the policy delay
//! - A step that exhausts its attempts fails the run; later steps stay pending
//! - Every state change is published to the run registry

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use telemark_client::{JobRunRequest, JobTrigger, Notifier};
use telemark_core::domain::pipeline::PipelineDefinition;
use telemark_core::domain::run::{Attempt, RunInstance, RunState, StepState};
use telemark_core::domain::step::{EmailMessage, Step, StepKind};
use tracing::{error, info, warn};

use super::alerts;
use super::registry::RunRegistry;

/// Result of a single attempt, before it is written into the run
#[derive(Debug)]
struct AttemptResult {
    succeeded: bool,
    /// Whether another attempt could change the outcome
    retryable: bool,
    message: Option<String>,
    external_run_id: Option<i64>,
    external_run_url: Option<String>,
}

impl AttemptResult {
    fn failed(message: String, retryable: bool) -> Self {
        Self {
            succeeded: false,
            retryable,
            message: Some(message),
            external_run_id: None,
            external_run_url: None,
        }
    }
}

/// Executes runs against the job runner and the notifier
pub struct RunExecutor {
    jobs: Arc<dyn JobTrigger>,
    notifier: Arc<dyn Notifier>,
    registry: Arc<RunRegistry>,
}

impl RunExecutor {
    pub fn new(
        jobs: Arc<dyn JobTrigger>,
        notifier: Arc<dyn Notifier>,
        registry: Arc<RunRegistry>,
    ) -> Self {
        Self {
            jobs,
            notifier,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Executes a queued run to completion and returns its final snapshot
    pub async fn execute(
        &self,
        pipeline: &PipelineDefinition,
        mut run: RunInstance,
    ) -> Result<RunInstance> {
        if run.state != RunState::Queued {
            anyhow::bail!("run {} is {}, only queued runs can be executed", run.id, run.state);
        }

        info!(
            "Starting run {} of {} (logical date {}, {:?})",
            run.id, pipeline.id, run.logical_date, run.trigger
        );
        run.mark_running();
        self.registry.record(&run).await;

        let total = pipeline.graph.len();
        for (idx, step) in pipeline.graph.execution_order().enumerate() {
            let blocked: Vec<&str> = pipeline
                .graph
                .upstream_of(&step.id)
                .into_iter()
                .filter(|up| run.step_state(up) != Some(StepState::Succeeded))
                .collect();
            if !blocked.is_empty() {
                warn!(
                    "Step {} not started: upstream {} did not succeed",
                    step.display_id,
                    blocked.join(", ")
                );
                break;
            }

            info!("Executing step {}/{}: {}", idx + 1, total, step.display_id);

            match self.execute_step(pipeline, &mut run, step).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    run.finish();
                    self.registry.record(&run).await;
                    return Err(e).with_context(|| format!("step '{}' of run {}", step.id, run.id));
                }
            }
        }

        let state = run.finish();
        self.registry.record(&run).await;

        match state {
            RunState::Succeeded => info!("Run {} of {} succeeded", run.id, pipeline.id),
            _ => error!(
                "Run {} of {} failed at step {}",
                run.id,
                pipeline.id,
                run.failed_step().map(|s| s.step_id.as_str()).unwrap_or("?")
            ),
        }

        Ok(run)
    }

    /// Runs one step through its attempts; returns whether it succeeded
    async fn execute_step(
        &self,
        pipeline: &PipelineDefinition,
        run: &mut RunInstance,
        step: &Step,
    ) -> Result<bool> {
        let max_attempts = step.max_attempts();
        let mut number = 0;

        loop {
            number += 1;
            run.transition(&step.id, StepState::Running)?;
            record_mut(run, &step.id)?.attempts.push(Attempt {
                number,
                started_at: Utc::now(),
                finished_at: None,
                succeeded: false,
                message: None,
                external_run_id: None,
                external_run_url: None,
            });
            self.registry.record(run).await;

            let result = self.attempt(step).await;

            if let Some(attempt) = record_mut(run, &step.id)?.last_attempt_mut() {
                attempt.finished_at = Some(Utc::now());
                attempt.succeeded = result.succeeded;
                attempt.message = result.message.clone();
                attempt.external_run_id = result.external_run_id;
                attempt.external_run_url = result.external_run_url.clone();
            }

            if result.succeeded {
                run.transition(&step.id, StepState::Succeeded)?;
                self.registry.record(run).await;
                info!("Step {} succeeded on attempt {}", step.display_id, number);
                return Ok(true);
            }

            let reason = result.message.as_deref().unwrap_or("unknown error");

            if number < max_attempts && result.retryable {
                run.transition(&step.id, StepState::Retrying)?;
                self.registry.record(run).await;
                warn!(
                    "Step {} failed attempt {}/{}: {}; retrying in {:?}",
                    step.display_id, number, max_attempts, reason, step.policy.retry_delay
                );
                if step.policy.email_on_retry {
                    self.send_alert(alerts::retry_alert(pipeline, run, step)).await;
                }
                tokio::time::sleep(step.policy.retry_delay).await;
                continue;
            }

            run.transition(&step.id, StepState::Failed)?;
            self.registry.record(run).await;
            error!(
                "Step {} failed after {} attempt(s): {}",
                step.display_id, number, reason
            );
            if step.policy.email_on_failure {
                self.send_alert(alerts::failure_alert(pipeline, run, step)).await;
            }
            return Ok(false);
        }
    }

    /// Performs the step's external call once
    async fn attempt(&self, step: &Step) -> AttemptResult {
        match &step.kind {
            StepKind::RemoteJob(job) => {
                let request =
                    JobRunRequest::new(job.clone()).with_timeout(step.policy.execution_timeout);
                let outcome = self.jobs.run_job(&request).await;

                match outcome {
                    Ok(outcome) => AttemptResult {
                        succeeded: outcome.succeeded,
                        retryable: true,
                        message: outcome.message,
                        external_run_id: Some(outcome.run_id),
                        external_run_url: outcome.run_page_url,
                    },
                    Err(e) => AttemptResult::failed(e.to_string(), e.is_retryable()),
                }
            }
            StepKind::Notification(message) => match self.notifier.send(message).await {
                Ok(()) => AttemptResult {
                    succeeded: true,
                    retryable: false,
                    message: None,
                    external_run_id: None,
                    external_run_url: None,
                },
                Err(e) => AttemptResult::failed(e.to_string(), false),
            },
        }
    }

    /// Sends an alert; a failed send is logged and otherwise ignored
    async fn send_alert(&self, alert: EmailMessage) {
        if let Err(e) = self.notifier.send(&alert).await {
            error!(
                "Failed to send alert '{}' to {}: {}",
                alert.subject,
                alert.to.join(", "),
                e
            );
        }
    }
}

fn record_mut<'a>(
    run: &'a mut RunInstance,
    step_id: &str,
) -> Result<&'a mut telemark_core::domain::run::StepRecord> {
    run.step_mut(step_id)
        .ok_or_else(|| anyhow::anyhow!("step '{}' missing from run", step_id))
}
