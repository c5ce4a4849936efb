//! Pipeline domain types

use serde::{Deserialize, Serialize};

use super::policy::ExecutionPolicy;
use super::step::{Step, StepKind};
use crate::error::DefinitionError;
use crate::graph::{Edge, TaskGraph};
use crate::schedule::CronSchedule;

/// Upper bound on retries a policy may ask for
pub const MAX_RETRIES_LIMIT: u32 = 100;

/// Pipeline definition
///
/// Static description handed to the scheduler: identity, recurrence, default
/// policy and the validated step graph. Built once through
/// [`PipelineBuilder`] and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub id: String,
    pub description: Option<String>,
    pub schedule: CronSchedule,
    /// Backfill ticks missed while the scheduler was down
    pub catchup: bool,
    pub tags: Vec<String>,
    pub default_policy: ExecutionPolicy,
    pub graph: TaskGraph,
}

impl PipelineDefinition {
    pub fn builder(id: impl Into<String>, default_policy: ExecutionPolicy) -> PipelineBuilder {
        PipelineBuilder::new(id, default_policy)
    }

    /// Re-runs the checks performed by the builder
    ///
    /// Useful for definitions that were deserialized rather than built.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        validate_identity(&self.id)?;
        validate_policy("default_policy", &self.default_policy)?;
        for step in self.graph.steps() {
            validate_step(step)?;
        }
        Ok(())
    }
}

/// Builds a [`PipelineDefinition`] from explicit nodes and edges
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    id: String,
    description: Option<String>,
    schedule: Option<String>,
    catchup: bool,
    tags: Vec<String>,
    default_policy: ExecutionPolicy,
    steps: Vec<Step>,
    edges: Vec<Edge>,
}

impl PipelineBuilder {
    pub fn new(id: impl Into<String>, default_policy: ExecutionPolicy) -> Self {
        Self {
            id: id.into(),
            description: None,
            schedule: None,
            catchup: true,
            tags: Vec::new(),
            default_policy,
            steps: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Cron expression; parsed in [`build`](Self::build)
    pub fn schedule(mut self, expr: impl Into<String>) -> Self {
        self.schedule = Some(expr.into());
        self
    }

    pub fn catchup(mut self, catchup: bool) -> Self {
        self.catchup = catchup;
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Declares `downstream` as waiting on `upstream`
    pub fn edge(mut self, upstream: impl Into<String>, downstream: impl Into<String>) -> Self {
        self.edges.push(Edge::new(upstream, downstream));
        self
    }

    /// Declares a linear chain `ids[0] -> ids[1] -> ...`
    pub fn chain(mut self, ids: &[&str]) -> Self {
        for pair in ids.windows(2) {
            self.edges.push(Edge::new(pair[0], pair[1]));
        }
        self
    }

    /// Validates everything and produces the definition
    pub fn build(self) -> Result<PipelineDefinition, DefinitionError> {
        validate_identity(&self.id)?;

        let expr = self
            .schedule
            .ok_or_else(|| DefinitionError::invalid_field("schedule", "no schedule given"))?;
        let schedule = CronSchedule::parse(&expr)?;

        validate_policy("default_policy", &self.default_policy)?;
        for step in &self.steps {
            validate_step(step)?;
        }

        let graph = TaskGraph::new(self.steps, self.edges)?;

        Ok(PipelineDefinition {
            id: self.id,
            description: self.description,
            schedule,
            catchup: self.catchup,
            tags: self.tags,
            default_policy: self.default_policy,
            graph,
        })
    }
}

fn validate_identity(id: &str) -> Result<(), DefinitionError> {
    if id.trim().is_empty() {
        return Err(DefinitionError::invalid_field("id", "pipeline id cannot be empty"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(DefinitionError::invalid_field(
            "id",
            format!("`{}` may only contain letters, digits, `_`, `-` and `.`", id),
        ));
    }
    Ok(())
}

fn validate_policy(field: &str, policy: &ExecutionPolicy) -> Result<(), DefinitionError> {
    if policy.owner.trim().is_empty() {
        return Err(DefinitionError::invalid_field(
            format!("{}.owner", field),
            "owner cannot be empty",
        ));
    }
    if (policy.email_on_failure || policy.email_on_retry) && policy.failure_recipients.is_empty() {
        return Err(DefinitionError::invalid_field(
            format!("{}.failure_recipients", field),
            "alerts are enabled but no recipients are configured",
        ));
    }
    for address in &policy.failure_recipients {
        validate_address(&format!("{}.failure_recipients", field), address)?;
    }
    if policy.max_retries > MAX_RETRIES_LIMIT {
        return Err(DefinitionError::invalid_field(
            format!("{}.max_retries", field),
            format!("at most {} retries are allowed", MAX_RETRIES_LIMIT),
        ));
    }
    if policy.execution_timeout.is_some_and(|t| t.is_zero()) {
        return Err(DefinitionError::invalid_field(
            format!("{}.execution_timeout", field),
            "timeout must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_step(step: &Step) -> Result<(), DefinitionError> {
    let field = |name: &str| format!("steps[{}].{}", step.id, name);

    validate_policy(&field("policy"), &step.policy)?;

    match &step.kind {
        StepKind::RemoteJob(job) => {
            if job.job_id == 0 {
                return Err(DefinitionError::invalid_field(
                    field("job_id"),
                    "job id must be greater than 0",
                ));
            }
            if job.connection_id.trim().is_empty() {
                return Err(DefinitionError::invalid_field(
                    field("connection_id"),
                    "connection id cannot be empty",
                ));
            }
        }
        StepKind::Notification(message) => {
            if message.to.is_empty() {
                return Err(DefinitionError::invalid_field(
                    field("to"),
                    "notification needs at least one recipient",
                ));
            }
            for address in &message.to {
                validate_address(&field("to"), address)?;
            }
            if message.subject.trim().is_empty() {
                return Err(DefinitionError::invalid_field(
                    field("subject"),
                    "subject cannot be empty",
                ));
            }
        }
    }
    Ok(())
}

fn validate_address(field: &str, address: &str) -> Result<(), DefinitionError> {
    match address.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(DefinitionError::invalid_field(
            field,
            format!("`{}` is not an email address", address),
        )),
    }
}
