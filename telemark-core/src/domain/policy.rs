//! Execution policy shared by every step of a pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default execution policy applied to steps unless a step overrides it.
///
/// The policy is an immutable value: a pipeline author builds one, then hands
/// a reference to every step constructor. Overrides return a new policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    /// Team or person accountable for the pipeline
    pub owner: String,

    /// Additional attempts after the first failure
    pub max_retries: u32,

    /// Fixed delay between a failed attempt and the next one
    pub retry_delay: Duration,

    /// Send an alert to `failure_recipients` when a step exhausts its retries
    pub email_on_failure: bool,

    /// Send an alert to `failure_recipients` on every retried attempt
    pub email_on_retry: bool,

    /// Addresses that receive failure (and retry) alerts
    pub failure_recipients: Vec<String>,

    /// Schedule ticks before this instant are never fired
    pub start_date: DateTime<Utc>,

    /// Upper bound on a single attempt; exceeding it fails the attempt
    pub execution_timeout: Option<Duration>,
}

impl ExecutionPolicy {
    /// Creates a policy with no retries and no alerting
    pub fn new(owner: impl Into<String>, start_date: DateTime<Utc>) -> Self {
        Self {
            owner: owner.into(),
            max_retries: 0,
            retry_delay: Duration::from_secs(300),
            email_on_failure: false,
            email_on_retry: false,
            failure_recipients: Vec::new(),
            start_date,
            execution_timeout: None,
        }
    }

    pub fn with_max_retries(&self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self.clone()
        }
    }

    pub fn with_retry_delay(&self, retry_delay: Duration) -> Self {
        Self {
            retry_delay,
            ..self.clone()
        }
    }

    pub fn with_execution_timeout(&self, timeout: Option<Duration>) -> Self {
        Self {
            execution_timeout: timeout,
            ..self.clone()
        }
    }

    /// Enables failure alerts to the given recipients
    pub fn with_failure_alerts<I, S>(&self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            email_on_failure: true,
            failure_recipients: recipients.into_iter().map(Into::into).collect(),
            ..self.clone()
        }
    }

    pub fn with_retry_alerts(&self, enabled: bool) -> Self {
        Self {
            email_on_retry: enabled,
            ..self.clone()
        }
    }
}
