//! Telemark Clients
//!
//! The external collaborators a pipeline run depends on, behind two traits:
//!
//! - [`JobTrigger`]: start a job on the remote job runner and wait until it
//!   reaches a terminal state
//! - [`Notifier`]: send an email
//!
//! Real implementations talk HTTP ([`DatabricksClient`], [`MailRelayClient`]);
//! [`ConnectionRegistry`] resolves a step's named connection to a client; the
//! simulated implementations back dry runs.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use telemark_client::{DatabricksClient, JobRunRequest, JobTrigger};
//! use telemark_core::domain::step::JobReference;
//!
//! # async fn example() -> telemark_client::Result<()> {
//! let client = DatabricksClient::new("https://adb-123.azuredatabricks.net", "dapi-token");
//! let job = JobReference::new("databricks_default", 1001).with_param("env", "production");
//! let request = JobRunRequest::new(job).with_timeout(Some(Duration::from_secs(3600)));
//!
//! let outcome = client.run_job(&request).await?;
//! println!("run {} succeeded: {}", outcome.run_id, outcome.succeeded);
//! # Ok(())
//! # }
//! ```

pub mod connections;
pub mod databricks;
pub mod error;
pub mod mail;
pub mod simulated;

// Re-export commonly used types
pub use connections::{ConnectionRegistry, normalize_connection_id};
pub use databricks::DatabricksClient;
pub use error::{ClientError, Result};
pub use mail::MailRelayClient;
pub use simulated::{LogNotifier, SimulatedTrigger};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use telemark_core::domain::step::{EmailMessage, JobReference};

/// One request to run a remote job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRunRequest {
    pub job: JobReference,
    /// Once elapsed, the remote run is cancelled and reported as failed
    pub timeout: Option<Duration>,
}

impl JobRunRequest {
    pub fn new(job: JobReference) -> Self {
        Self { job, timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Terminal outcome of one remote job run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRunOutcome {
    /// Run id assigned by the job runner
    pub run_id: i64,
    pub run_page_url: Option<String>,
    pub succeeded: bool,
    /// Human-readable terminal state or error message
    pub message: Option<String>,
}

/// Remote job trigger interface
///
/// `run_job` returns only once the remote run is terminal. An `Err` means no
/// remote run was started: the runner could not be reached or rejected the
/// request. Once a run exists, every ending (including a timeout) is an `Ok`
/// outcome, with `succeeded == false` when it did not succeed.
#[async_trait]
pub trait JobTrigger: Send + Sync {
    async fn run_job(&self, request: &JobRunRequest) -> Result<JobRunOutcome>;
}

/// Notification interface
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}
