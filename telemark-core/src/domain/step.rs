//! Step domain types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::policy::ExecutionPolicy;

/// One unit of work in a pipeline
///
/// Steps carry their fully resolved policy; dependencies live on the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    /// Ordinal-prefixed id shown in logs and alerts (e.g. `03_feature_engineering`)
    pub display_id: String,
    pub kind: StepKind,
    pub policy: ExecutionPolicy,
}

/// What a step does when it runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Trigger a job on the remote job runner and wait for it to finish
    RemoteJob(JobReference),
    /// Send an email
    Notification(EmailMessage),
}

/// Reference to a job hosted on the remote job runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReference {
    /// Named connection resolved by the scheduler configuration
    pub connection_id: String,
    pub job_id: u64,
    pub notebook_params: BTreeMap<String, String>,
}

/// An email to send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: Vec<String>,
    pub subject: String,
    pub html_body: String,
}

impl Step {
    /// Creates a remote-job step using the given policy
    pub fn remote_job(id: impl Into<String>, policy: &ExecutionPolicy, job: JobReference) -> Self {
        let id = id.into();
        Self {
            display_id: id.clone(),
            id,
            kind: StepKind::RemoteJob(job),
            policy: policy.clone(),
        }
    }

    /// Creates a notification step using the given policy
    pub fn notification(
        id: impl Into<String>,
        policy: &ExecutionPolicy,
        message: EmailMessage,
    ) -> Self {
        let id = id.into();
        Self {
            display_id: id.clone(),
            id,
            kind: StepKind::Notification(message),
            policy: policy.clone(),
        }
    }

    pub fn with_display_id(mut self, display_id: impl Into<String>) -> Self {
        self.display_id = display_id.into();
        self
    }

    /// Replaces the policy for this step only
    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Whether re-invoking this step after a failure is safe
    pub fn supports_retry(&self) -> bool {
        matches!(self.kind, StepKind::RemoteJob(_))
    }

    /// Retries actually granted to this step
    ///
    /// Notifications never retry: a send that failed after delivery would
    /// produce a duplicate email.
    pub fn effective_max_retries(&self) -> u32 {
        if self.supports_retry() {
            self.policy.max_retries
        } else {
            0
        }
    }

    /// Total attempts the executor may make
    pub fn max_attempts(&self) -> u32 {
        self.effective_max_retries().saturating_add(1)
    }

    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            StepKind::RemoteJob(_) => "remote_job",
            StepKind::Notification(_) => "notification",
        }
    }
}

impl JobReference {
    pub fn new(connection_id: impl Into<String>, job_id: u64) -> Self {
        Self {
            connection_id: connection_id.into(),
            job_id,
            notebook_params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.notebook_params.insert(key.into(), value.into());
        self
    }
}

impl EmailMessage {
    pub fn new<I, S>(to: I, subject: impl Into<String>, html_body: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            to: to.into_iter().map(Into::into).collect(),
            subject: subject.into(),
            html_body: html_body.into(),
        }
    }
}
