//! Test doubles for the job runner and the notifier

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use telemark_client::{ClientError, JobRunOutcome, JobRunRequest, JobTrigger, Notifier};
use telemark_core::domain::step::EmailMessage;
use tokio::time::Instant;

/// What a scripted job does on one call
#[derive(Debug, Clone, Copy)]
pub enum Script {
    Succeed,
    /// Remote run terminates with a failed result
    Fail,
    /// Runner answers 503
    Unreachable,
    /// Runner answers 400
    Rejected,
    /// Takes this long, then succeeds; a shorter request timeout cuts it off
    Hang(Duration),
}

/// Job trigger that plays back a per-job script
///
/// Jobs without a script (or with an exhausted one) succeed.
pub struct ScriptedTrigger {
    scripts: Mutex<HashMap<u64, VecDeque<Script>>>,
    calls: Mutex<Vec<(u64, Instant)>>,
    next_run_id: AtomicI64,
}

impl ScriptedTrigger {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            next_run_id: AtomicI64::new(100),
        }
    }

    pub fn script(self, job_id: u64, script: impl IntoIterator<Item = Script>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(job_id, script.into_iter().collect());
        self
    }

    /// Job ids in call order, with the time of each call
    pub fn calls(&self) -> Vec<(u64, Instant)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, job_id: u64) -> Vec<Instant> {
        self.calls()
            .into_iter()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, at)| at)
            .collect()
    }

    pub fn called_jobs(&self) -> Vec<u64> {
        self.calls().into_iter().map(|(id, _)| id).collect()
    }
}

#[async_trait]
impl JobTrigger for ScriptedTrigger {
    async fn run_job(&self, request: &JobRunRequest) -> telemark_client::Result<JobRunOutcome> {
        let job = &request.job;
        self.calls.lock().unwrap().push((job.job_id, Instant::now()));
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&job.job_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Script::Succeed);

        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let outcome = |succeeded: bool, message: &str| JobRunOutcome {
            run_id,
            run_page_url: Some(format!("https://runner.test/#job/{}/run/{}", job.job_id, run_id)),
            succeeded,
            message: Some(message.to_string()),
        };

        match step {
            Script::Succeed => Ok(outcome(true, "SUCCESS")),
            Script::Fail => Ok(outcome(false, "FAILED")),
            Script::Unreachable => Err(ClientError::api_error(503, "service unavailable")),
            Script::Rejected => Err(ClientError::api_error(400, "invalid job id")),
            Script::Hang(duration) => match request.timeout.filter(|limit| *limit < duration) {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    Ok(outcome(false, &format!("timed out after {:?}; run cancelled", limit)))
                }
                None => {
                    tokio::time::sleep(duration).await;
                    Ok(outcome(true, "SUCCESS"))
                }
            },
        }
    }
}

/// Notifier that keeps every message it is asked to send
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<EmailMessage>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send is recorded and then reported as failed
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, address: &str) -> Vec<EmailMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.to.iter().any(|to| to == address))
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &EmailMessage) -> telemark_client::Result<()> {
        self.sent.lock().unwrap().push(message.clone());
        if self.fail {
            return Err(ClientError::api_error(502, "relay down"));
        }
        Ok(())
    }
}
