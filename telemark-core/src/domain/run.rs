//! Run domain types
//!
//! A `RunInstance` is one execution of a pipeline bound to a logical date.
//! It owns the per-step state machines and the ordered log of transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::pipeline::PipelineDefinition;
use crate::error::TransitionError;

/// State of a single step within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepState {
    Pending,
    Running,
    /// Last attempt failed, waiting for the retry delay to elapse
    Retrying,
    Succeeded,
    Failed,
    Skipped,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Whether the state machine allows `self -> next`
    pub fn can_transition_to(self, next: StepState) -> bool {
        use StepState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Retrying)
                | (Retrying, Running)
        )
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            StepState::Pending => "pending",
            StepState::Running => "running",
            StepState::Retrying => "retrying",
            StepState::Succeeded => "succeeded",
            StepState::Failed => "failed",
            StepState::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// Overall state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Queued,
    Running,
    Succeeded,
    Failed,
    /// Not executed because another run already covers the same period
    Skipped,
}

impl RunState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// What created a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

/// One attempt at executing a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based attempt number
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub succeeded: bool,
    pub message: Option<String>,
    /// Run id assigned by the remote job runner
    pub external_run_id: Option<i64>,
    pub external_run_url: Option<String>,
}

/// Per-step record inside a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub state: StepState,
    pub attempts: Vec<Attempt>,
}

impl StepRecord {
    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    pub fn last_attempt_mut(&mut self) -> Option<&mut Attempt> {
        self.attempts.last_mut()
    }
}

/// A recorded state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub step_id: String,
    pub from: StepState,
    pub to: StepState,
    pub at: DateTime<Utc>,
}

/// One execution of a pipeline for a logical date
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInstance {
    pub id: Uuid,
    pub pipeline_id: String,
    /// Schedule tick naming the period this run covers
    pub logical_date: DateTime<Utc>,
    pub trigger: RunTrigger,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Records in execution order
    pub steps: Vec<StepRecord>,
    pub transitions: Vec<Transition>,
}

impl RunInstance {
    /// Materializes a queued run with every step pending
    pub fn new(
        pipeline: &PipelineDefinition,
        logical_date: DateTime<Utc>,
        trigger: RunTrigger,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_id: pipeline.id.clone(),
            logical_date,
            trigger,
            state: RunState::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            steps: pipeline
                .graph
                .execution_order()
                .map(|step| StepRecord {
                    step_id: step.id.clone(),
                    state: StepState::Pending,
                    attempts: Vec::new(),
                })
                .collect(),
            transitions: Vec::new(),
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    pub fn step_state(&self, step_id: &str) -> Option<StepState> {
        self.step(step_id).map(|s| s.state)
    }

    /// Moves a step to `to`, recording the transition
    pub fn transition(&mut self, step_id: &str, to: StepState) -> Result<(), TransitionError> {
        let record = self
            .step_mut(step_id)
            .ok_or_else(|| TransitionError::UnknownStep(step_id.to_string()))?;
        let from = record.state;
        if !from.can_transition_to(to) {
            return Err(TransitionError::Illegal {
                step: step_id.to_string(),
                from,
                to,
            });
        }
        record.state = to;
        self.transitions.push(Transition {
            step_id: step_id.to_string(),
            from,
            to,
            at: Utc::now(),
        });
        Ok(())
    }

    pub fn mark_running(&mut self) {
        self.state = RunState::Running;
        self.started_at = Some(Utc::now());
    }

    /// Marks every pending step skipped and the run itself skipped
    pub fn skip(&mut self) {
        let pending: Vec<String> = self
            .steps
            .iter()
            .filter(|s| s.state == StepState::Pending)
            .map(|s| s.step_id.clone())
            .collect();
        for step_id in pending {
            // Pending -> Skipped is always legal
            let _ = self.transition(&step_id, StepState::Skipped);
        }
        self.state = RunState::Skipped;
        self.completed_at = Some(Utc::now());
    }

    /// Settles the run state from its steps
    ///
    /// A run succeeds iff every step succeeded.
    pub fn finish(&mut self) -> RunState {
        self.state = if self.all_succeeded() {
            RunState::Succeeded
        } else {
            RunState::Failed
        };
        self.completed_at = Some(Utc::now());
        self.state
    }

    pub fn all_succeeded(&self) -> bool {
        self.succeeded_count() == self.steps.len()
    }

    pub fn succeeded_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.state == StepState::Succeeded)
            .count()
    }

    /// The step that ended the run in failure, if any
    pub fn failed_step(&self) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.state == StepState::Failed)
    }
}
