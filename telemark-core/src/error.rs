//! Error types for pipeline definitions, schedules and run state

use thiserror::Error;

use crate::domain::run::StepState;

/// Misconfiguration detected while building or validating a pipeline definition.
///
/// These are raised before any run exists and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    /// A required field is empty or otherwise unusable
    #[error("invalid field `{field}`: {message}")]
    InvalidField { field: String, message: String },

    /// Two steps share the same id
    #[error("duplicate step id `{0}`")]
    DuplicateStep(String),

    /// An edge points at a step that was never declared
    #[error("edge {from} -> {to} references unknown step `{missing}`")]
    UnknownStep {
        from: String,
        to: String,
        missing: String,
    },

    /// An edge from a step to itself
    #[error("step `{0}` depends on itself")]
    SelfDependency(String),

    /// The same edge declared twice
    #[error("duplicate edge {0} -> {1}")]
    DuplicateEdge(String, String),

    /// The graph contains a cycle through the listed steps
    #[error("dependency cycle detected involving: {}", .0.join(", "))]
    Cycle(Vec<String>),

    /// The graph has no root or more than one root
    #[error("expected exactly one root step, found {}", if .0.is_empty() { "none".to_string() } else { .0.join(", ") })]
    RootCount(Vec<String>),

    /// Steps that cannot be reached from the root
    #[error("steps unreachable from root `{root}`: {}", .unreachable.join(", "))]
    Unreachable {
        root: String,
        unreachable: Vec<String>,
    },

    /// The recurrence expression could not be parsed
    #[error("invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),
}

impl DefinitionError {
    /// Create an invalid-field error
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while parsing a cron expression
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), got {0}")]
    FieldCount(usize),

    #[error("unknown preset `{0}`")]
    UnknownPreset(String),

    #[error("{field}: cannot parse `{token}`")]
    Malformed { field: &'static str, token: String },

    #[error("{field}: value {value} outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("{field}: step must be greater than 0")]
    ZeroStep { field: &'static str },

    #[error("expression never matches a calendar date")]
    NeverFires,
}

/// A step state change that the state machine does not allow
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("step `{step}` cannot move from {from:?} to {to:?}")]
    Illegal {
        step: String,
        from: StepState,
        to: StepState,
    },

    #[error("step `{0}` is not part of this run")]
    UnknownStep(String),
}
