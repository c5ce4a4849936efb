//! End-to-end runs of the bank telemarketing pipeline against fake
//! collaborators, on a paused clock.

use chrono::{DateTime, Offset, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use telemark_core::definitions::{
    FAILURE_RECIPIENT, SUCCESS_RECIPIENT, SUCCESS_SUBJECT, bank_policy, bank_telemarketing,
};
use telemark_core::domain::pipeline::PipelineDefinition;
use telemark_core::domain::run::{RunInstance, RunState, RunTrigger, StepState};
use telemark_core::domain::step::{JobReference, Step};

use crate::scheduler::CronScheduler;
use crate::service::{OverlapPolicy, RunExecutor, RunRegistry};
use crate::testing::{RecordingNotifier, Script, ScriptedTrigger};

const ORDER: [&str; 6] = [
    "silver_cleaning",
    "eda",
    "feature_engineering",
    "ml_training",
    "clustering",
    "success_notification",
];

struct Harness {
    trigger: Arc<ScriptedTrigger>,
    notifier: Arc<RecordingNotifier>,
    registry: Arc<RunRegistry>,
    executor: Arc<RunExecutor>,
}

impl Harness {
    fn new(trigger: ScriptedTrigger, notifier: RecordingNotifier, policy: OverlapPolicy) -> Self {
        let trigger = Arc::new(trigger);
        let notifier = Arc::new(notifier);
        let registry = Arc::new(RunRegistry::new(policy));
        let executor = Arc::new(RunExecutor::new(
            trigger.clone(),
            notifier.clone(),
            registry.clone(),
        ));
        Self {
            trigger,
            notifier,
            registry,
            executor,
        }
    }

    fn with_trigger(trigger: ScriptedTrigger) -> Self {
        Self::new(trigger, RecordingNotifier::new(), OverlapPolicy::SkipActive)
    }

    async fn run(&self, pipeline: &PipelineDefinition) -> RunInstance {
        let run = self
            .registry
            .admit(pipeline, period(), RunTrigger::Manual)
            .await
            .into_run();
        self.executor.execute(pipeline, run).await.unwrap()
    }

    fn cron(&self, pipeline: PipelineDefinition) -> CronScheduler {
        CronScheduler::new(Arc::new(pipeline), self.executor.clone(), Utc.fix(), 16)
    }
}

fn period() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap()
}

fn states(run: &RunInstance) -> Vec<StepState> {
    run.steps.iter().map(|s| s.state).collect()
}

#[tokio::test(start_paused = true)]
async fn all_steps_succeed() {
    let pipeline = bank_telemarketing().unwrap();
    let harness = Harness::with_trigger(ScriptedTrigger::new());

    let run = harness.run(&pipeline).await;

    assert_eq!(run.state, RunState::Succeeded);
    assert_eq!(states(&run), vec![StepState::Succeeded; 6]);
    assert!(run.steps.iter().all(|s| s.attempts.len() == 1));
    assert_eq!(harness.trigger.called_jobs(), vec![1001, 1002, 1003, 1004, 1005]);

    let sent = harness.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec![SUCCESS_RECIPIENT]);
    assert_eq!(sent[0].subject, SUCCESS_SUBJECT);

    let stored = harness.registry.runs_for(&pipeline.id, period()).await;
    assert_eq!(stored, vec![run]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_step_halts_the_chain() {
    let pipeline = bank_telemarketing().unwrap();
    let trigger = ScriptedTrigger::new().script(1003, [Script::Fail, Script::Fail, Script::Fail]);
    let harness = Harness::with_trigger(trigger);

    let run = harness.run(&pipeline).await;

    assert_eq!(run.state, RunState::Failed);
    assert_eq!(
        states(&run),
        vec![
            StepState::Succeeded,
            StepState::Succeeded,
            StepState::Failed,
            StepState::Pending,
            StepState::Pending,
            StepState::Pending,
        ]
    );
    assert_eq!(run.step("feature_engineering").unwrap().attempts.len(), 3);
    assert_eq!(run.failed_step().unwrap().step_id, "feature_engineering");
    assert!(harness.trigger.calls_for(1004).is_empty());
    assert!(harness.trigger.calls_for(1005).is_empty());

    let sent = harness.notifier.sent();
    assert_eq!(sent.len(), 1, "only the failure alert is sent");
    assert_eq!(sent[0].to, vec![FAILURE_RECIPIENT]);
    assert_eq!(
        sent[0].subject,
        "[telemark] Task failed: bank_telemarketing_pipeline.03_feature_engineering"
    );
    assert!(harness.notifier.sent_to(SUCCESS_RECIPIENT).is_empty());
}

#[tokio::test(start_paused = true)]
async fn retry_then_success() {
    let pipeline = bank_telemarketing().unwrap();
    let trigger =
        ScriptedTrigger::new().script(1002, [Script::Fail, Script::Unreachable, Script::Succeed]);
    let harness = Harness::with_trigger(trigger);

    let run = harness.run(&pipeline).await;

    assert_eq!(run.state, RunState::Succeeded);
    let eda = run.step("eda").unwrap();
    assert_eq!(eda.attempts.len(), 3);
    assert!(!eda.attempts[0].succeeded);
    assert!(!eda.attempts[1].succeeded);
    assert!(eda.attempts[2].succeeded);

    let starts = harness.trigger.calls_for(1002);
    assert_eq!(starts.len(), 3);
    for pair in starts.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(5 * 60));
    }

    // Retry alerts are off by default, so only the success email goes out
    assert_eq!(harness.notifier.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_alert_sent_when_enabled() {
    let policy = bank_policy().unwrap().with_retry_alerts(true);
    let pipeline = PipelineDefinition::builder("retry_alerts", policy.clone())
        .schedule("0 6 1 * *")
        .step(Step::remote_job(
            "flaky",
            &policy,
            JobReference::new("databricks_default", 8),
        ))
        .build()
        .unwrap();
    let trigger = ScriptedTrigger::new().script(8, [Script::Fail, Script::Succeed]);
    let harness = Harness::with_trigger(trigger);

    let run = harness.run(&pipeline).await;

    assert_eq!(run.state, RunState::Succeeded);
    let sent = harness.notifier.sent_to(FAILURE_RECIPIENT);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "[telemark] Task up for retry: retry_alerts.flaky");
}

#[tokio::test(start_paused = true)]
async fn steps_never_start_before_upstream_succeeds() {
    let pipeline = bank_telemarketing().unwrap();
    let trigger = ScriptedTrigger::new()
        .script(1001, [Script::Fail, Script::Succeed])
        .script(1004, [Script::Hang(Duration::from_secs(90))]);
    let harness = Harness::with_trigger(trigger);

    let run = harness.run(&pipeline).await;
    assert_eq!(run.state, RunState::Succeeded);

    for pair in ORDER.windows(2) {
        let (upstream, downstream) = (pair[0], pair[1]);
        let succeeded_at = run
            .transitions
            .iter()
            .position(|t| t.step_id == upstream && t.to == StepState::Succeeded)
            .unwrap();
        let first_running = run
            .transitions
            .iter()
            .position(|t| t.step_id == downstream && t.to == StepState::Running)
            .unwrap();
        assert!(
            succeeded_at < first_running,
            "{} started before {} succeeded",
            downstream,
            upstream
        );
    }

    let silver: Vec<_> = run
        .transitions
        .iter()
        .filter(|t| t.step_id == "silver_cleaning")
        .map(|t| t.to)
        .collect();
    assert_eq!(
        silver,
        vec![
            StepState::Running,
            StepState::Retrying,
            StepState::Running,
            StepState::Succeeded,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_request_is_not_retried() {
    let pipeline = bank_telemarketing().unwrap();
    let trigger = ScriptedTrigger::new().script(1001, [Script::Rejected]);
    let harness = Harness::with_trigger(trigger);

    let run = harness.run(&pipeline).await;

    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.step_state("silver_cleaning"), Some(StepState::Failed));
    assert_eq!(harness.trigger.calls_for(1001).len(), 1);
    assert_eq!(harness.notifier.sent_to(FAILURE_RECIPIENT).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_counts_as_failed_attempt() {
    let policy = bank_policy()
        .unwrap()
        .with_max_retries(1)
        .with_retry_delay(Duration::from_secs(60))
        .with_execution_timeout(Some(Duration::from_secs(10 * 60)));
    let pipeline = PipelineDefinition::builder("timeout_check", policy.clone())
        .schedule("0 6 1 * *")
        .step(Step::remote_job(
            "slow",
            &policy,
            JobReference::new("databricks_default", 7),
        ))
        .build()
        .unwrap();
    let trigger = ScriptedTrigger::new().script(
        7,
        [
            Script::Hang(Duration::from_secs(60 * 60)),
            Script::Hang(Duration::from_secs(60)),
        ],
    );
    let harness = Harness::with_trigger(trigger);

    let run = harness.run(&pipeline).await;

    assert_eq!(run.state, RunState::Succeeded);
    let attempts = &run.step("slow").unwrap().attempts;
    assert_eq!(attempts.len(), 2);
    assert!(
        attempts[0]
            .message
            .as_deref()
            .is_some_and(|m| m.contains("timed out"))
    );
}

#[tokio::test(start_paused = true)]
async fn run_is_settled_when_execution_errors() {
    let pipeline = bank_telemarketing().unwrap();
    let policy = bank_policy().unwrap();
    let unrelated = PipelineDefinition::builder("bank_telemarketing_pipeline", policy.clone())
        .schedule("0 6 1 * *")
        .step(Step::remote_job(
            "other",
            &policy,
            JobReference::new("databricks_default", 9),
        ))
        .build()
        .unwrap();
    let harness = Harness::with_trigger(ScriptedTrigger::new());

    // A run whose step records do not match the pipeline being executed
    let run = harness
        .registry
        .admit(&unrelated, period(), RunTrigger::Manual)
        .await
        .into_run();
    let run_id = run.id;

    assert!(harness.executor.execute(&pipeline, run).await.is_err());

    let recorded = harness.registry.runs_for(&pipeline.id, period()).await;
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].id, run_id);
    assert_eq!(recorded[0].state, RunState::Failed);
    assert!(recorded[0].completed_at.is_some());

    // The period is no longer blocked by a run stuck in Running
    let retry = harness.run(&pipeline).await;
    assert_eq!(retry.state, RunState::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn failed_notification_is_not_retried() {
    let pipeline = bank_telemarketing().unwrap();
    let harness = Harness::new(
        ScriptedTrigger::new(),
        RecordingNotifier::failing(),
        OverlapPolicy::SkipActive,
    );

    let run = harness.run(&pipeline).await;

    assert_eq!(run.state, RunState::Failed);
    let notify = run.step("success_notification").unwrap();
    assert_eq!(notify.state, StepState::Failed);
    assert_eq!(notify.attempts.len(), 1);

    // One try at the success email, then the failure alert, which also fails
    let sent = harness.notifier.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].subject, SUCCESS_SUBJECT);
    assert_eq!(sent[1].to, vec![FAILURE_RECIPIENT]);
}

#[tokio::test(start_paused = true)]
async fn manual_run_overlapping_scheduled_run_is_skipped() {
    let trigger = ScriptedTrigger::new().script(1001, [Script::Hang(Duration::from_secs(600))]);
    let harness = Harness::with_trigger(trigger);
    let cron = harness.cron(bank_telemarketing().unwrap());

    let scheduled = cron.fire(period()).await.unwrap();
    let manual = cron
        .trigger_manual(period() + chrono::Duration::days(3))
        .await
        .unwrap();

    assert_eq!(manual.state, RunState::Skipped);
    assert_eq!(manual.trigger, RunTrigger::Manual);
    assert!(manual.steps.iter().all(|s| s.state == StepState::Skipped));

    scheduled.await.unwrap();
    let runs = harness.registry.runs_for("bank_telemarketing_pipeline", period()).await;
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].state, RunState::Succeeded);
    assert_eq!(harness.trigger.calls_for(1001).len(), 1);
    assert_eq!(harness.notifier.sent_to(SUCCESS_RECIPIENT).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn overlapping_runs_both_execute_when_allowed() {
    let trigger = ScriptedTrigger::new().script(1001, [Script::Hang(Duration::from_secs(600))]);
    let harness = Harness::new(trigger, RecordingNotifier::new(), OverlapPolicy::Allow);
    let cron = harness.cron(bank_telemarketing().unwrap());

    let scheduled = cron.fire(period()).await.unwrap();
    let manual = cron
        .trigger_manual(period() + chrono::Duration::days(3))
        .await
        .unwrap();
    scheduled.await.unwrap();

    assert_eq!(manual.state, RunState::Succeeded);
    let runs = harness.registry.runs_for("bank_telemarketing_pipeline", period()).await;
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.state == RunState::Succeeded));
    assert_eq!(harness.trigger.calls_for(1001).len(), 2);
    assert_eq!(harness.notifier.sent_to(SUCCESS_RECIPIENT).len(), 2);
}
