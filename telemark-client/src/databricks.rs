//! Databricks Jobs API client
//!
//! Triggers an existing job with `run-now` and polls `runs/get` until the run
//! reaches a terminal life-cycle state. Once a run has started it is never
//! started again from here: transient polling errors are retried against the
//! same run id, and a run that is given up on (timeout, polling exhausted) is
//! cancelled before the attempt is reported as failed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use telemark_core::domain::step::JobReference;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::{JobRunOutcome, JobRunRequest, JobTrigger};

/// Default time between two `runs/get` calls
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive transient `runs/get` failures tolerated for one run
pub const DEFAULT_POLL_RETRY_LIMIT: u32 = 3;

/// Life-cycle state reported by the jobs API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifeCycleState {
    Queued,
    Pending,
    Running,
    Terminating,
    Terminated,
    Skipped,
    InternalError,
    Blocked,
    WaitingForRetry,
}

impl LifeCycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Skipped | Self::InternalError)
    }
}

/// Result state, present once the run is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultState {
    Success,
    Failed,
    Timedout,
    Canceled,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub life_cycle_state: LifeCycleState,
    #[serde(default)]
    pub result_state: Option<ResultState>,
    #[serde(default)]
    pub state_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDetails {
    pub run_id: i64,
    #[serde(default)]
    pub run_page_url: Option<String>,
    pub state: RunState,
}

#[derive(Debug, Serialize)]
struct RunNowRequest<'a> {
    job_id: u64,
    #[serde(skip_serializing_if = "no_params")]
    notebook_params: &'a BTreeMap<String, String>,
}

fn no_params(params: &&BTreeMap<String, String>) -> bool {
    params.is_empty()
}

#[derive(Debug, Deserialize)]
struct RunNowResponse {
    run_id: i64,
}

#[derive(Debug, Serialize)]
struct CancelRunRequest {
    run_id: i64,
}

/// HTTP client for one Databricks workspace
#[derive(Debug, Clone)]
pub struct DatabricksClient {
    /// Workspace URL (e.g., "https://adb-123.azuredatabricks.net")
    host: String,
    token: String,
    polling_interval: Duration,
    poll_retry_limit: u32,
    client: reqwest::Client,
}

impl DatabricksClient {
    pub fn new(host: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(host, token, reqwest::Client::new())
    }

    /// Create a client with a custom HTTP client (timeouts, proxies, TLS)
    pub fn with_client(
        host: impl Into<String>,
        token: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        let host = host.into();
        Self {
            host: host.trim_end_matches('/').to_string(),
            token: token.into(),
            polling_interval: DEFAULT_POLLING_INTERVAL,
            poll_retry_limit: DEFAULT_POLL_RETRY_LIMIT,
            client,
        }
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_poll_retry_limit(mut self, limit: u32) -> Self {
        self.poll_retry_limit = limit;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    /// Start a run of an existing job, returning the run id
    pub async fn run_now(&self, job: &JobReference) -> Result<i64> {
        let url = format!("{}/api/2.1/jobs/run-now", self.host);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&RunNowRequest {
                job_id: job.job_id,
                notebook_params: &job.notebook_params,
            })
            .send()
            .await?;

        let body: RunNowResponse = handle_response(response).await?;
        Ok(body.run_id)
    }

    /// Fetch the current state of a run
    pub async fn get_run(&self, run_id: i64) -> Result<RunDetails> {
        let url = format!("{}/api/2.1/jobs/runs/get", self.host);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("run_id", run_id)])
            .send()
            .await?;

        handle_response(response).await
    }

    /// Ask the job runner to cancel a run
    pub async fn cancel_run(&self, run_id: i64) -> Result<()> {
        let url = format!("{}/api/2.1/jobs/runs/cancel", self.host);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&CancelRunRequest { run_id })
            .send()
            .await?;

        let _: serde_json::Value = handle_response(response).await?;
        Ok(())
    }

    /// Poll until the run is terminal, riding out transient errors
    async fn wait_for_run(&self, job: &JobReference, run_id: i64) -> Result<RunDetails> {
        let mut failures = 0;
        loop {
            match self.get_run(run_id).await {
                Ok(details) if details.state.life_cycle_state.is_terminal() => {
                    info!(
                        "Run {} of job {} finished: {:?}/{:?}",
                        run_id, job.job_id, details.state.life_cycle_state, details.state.result_state
                    );
                    return Ok(details);
                }
                Ok(details) => {
                    failures = 0;
                    debug!(
                        "Run {} of job {} is {:?}, checking again in {:?}",
                        run_id, job.job_id, details.state.life_cycle_state, self.polling_interval
                    );
                }
                Err(e) if e.is_retryable() && failures < self.poll_retry_limit => {
                    failures += 1;
                    warn!(
                        "Polling run {} of job {} failed ({}/{}): {}",
                        run_id, job.job_id, failures, self.poll_retry_limit, e
                    );
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.polling_interval).await;
        }
    }

    /// Cancel a run we stopped waiting for and report it as failed
    async fn abandon(&self, run_id: i64, reason: String) -> JobRunOutcome {
        warn!("Giving up on run {}: {}", run_id, reason);
        let message = match self.cancel_run(run_id).await {
            Ok(()) => format!("{}; run {} cancelled", reason, run_id),
            Err(e) => {
                warn!("Failed to cancel run {}: {}", run_id, e);
                format!("{}; cancelling run {} failed: {}", reason, run_id, e)
            }
        };
        JobRunOutcome {
            run_id,
            run_page_url: None,
            succeeded: false,
            message: Some(message),
        }
    }
}

#[async_trait]
impl JobTrigger for DatabricksClient {
    async fn run_job(&self, request: &JobRunRequest) -> Result<JobRunOutcome> {
        let job = &request.job;
        let run_id = self.run_now(job).await?;
        info!("Job {} started as run {}", job.job_id, run_id);

        let finished = match request.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.wait_for_run(job, run_id)).await {
                Ok(finished) => finished,
                Err(_) => {
                    return Ok(self
                        .abandon(run_id, format!("timed out after {:?}", limit))
                        .await);
                }
            },
            None => self.wait_for_run(job, run_id).await,
        };

        match finished {
            Ok(details) => Ok(details.into()),
            Err(e) => Ok(self
                .abandon(run_id, format!("lost track of the run: {}", e))
                .await),
        }
    }
}

impl From<RunDetails> for JobRunOutcome {
    fn from(details: RunDetails) -> Self {
        Self {
            run_id: details.run_id,
            run_page_url: details.run_page_url,
            succeeded: details.state.life_cycle_state == LifeCycleState::Terminated
                && details.state.result_state == Some(ResultState::Success),
            message: details.state.state_message.filter(|m| !m.is_empty()).or_else(|| {
                Some(format!(
                    "{:?}/{:?}",
                    details.state.life_cycle_state, details.state.result_state
                ))
            }),
        }
    }
}

/// Check the status code and deserialize the JSON body
async fn handle_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();

    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(ClientError::api_error(status.as_u16(), error_text));
    }

    response
        .json()
        .await
        .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
}
