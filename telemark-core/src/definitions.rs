//! Bundled pipeline definitions

use chrono::NaiveDate;
use std::time::Duration;

use crate::domain::pipeline::PipelineDefinition;
use crate::domain::policy::ExecutionPolicy;
use crate::domain::step::{EmailMessage, JobReference, Step};
use crate::error::DefinitionError;

pub const BANK_TELEMARKETING_ID: &str = "bank_telemarketing_pipeline";

/// Connection used by every remote job in the bank pipeline
pub const DATABRICKS_CONNECTION: &str = "databricks_default";

pub const FAILURE_RECIPIENT: &str = "dataengineer@bank.com";
pub const SUCCESS_RECIPIENT: &str = "marketing_team@bank.com";
pub const SUCCESS_SUBJECT: &str = "Bank Telemarketing Pipeline Complete";

const SUCCESS_BODY: &str = r#"
<h3>Pipeline completed successfully</h3>
<p>All tables updated:</p>
<ul>
    <li>bank_silver — cleaned data</li>
    <li>bank_gold — feature engineered data</li>
    <li>bank_dim_customer — with cluster labels</li>
    <li>bank_fact_marketing — with predictions</li>
</ul>
<p>Power BI dashboard is now refreshed.</p>
"#;

/// (step id, remote job id) for the five notebook jobs, in run order
const JOBS: [(&str, u64); 5] = [
    ("silver_cleaning", 1001),
    ("eda", 1002),
    ("feature_engineering", 1003),
    ("ml_training", 1004),
    ("clustering", 1005),
];

/// Default policy for the bank pipeline
pub fn bank_policy() -> Result<ExecutionPolicy, DefinitionError> {
    let start_date = NaiveDate::from_ymd_opt(2025, 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| DefinitionError::invalid_field("start_date", "not a calendar date"))?;

    Ok(ExecutionPolicy::new("data_engineering_team", start_date)
        .with_max_retries(2)
        .with_retry_delay(Duration::from_secs(5 * 60))
        .with_failure_alerts([FAILURE_RECIPIENT])
        .with_retry_alerts(false))
}

/// Monthly bank telemarketing analytics pipeline
///
/// Five notebook jobs run in sequence on the 1st of every month at 06:00,
/// then the marketing team is told the dashboard is fresh.
pub fn bank_telemarketing() -> Result<PipelineDefinition, DefinitionError> {
    let policy = bank_policy()?;

    let mut builder = PipelineDefinition::builder(BANK_TELEMARKETING_ID, policy.clone())
        .description("End to end bank telemarketing analytics pipeline")
        .schedule("0 6 1 * *")
        .catchup(false)
        .tags(["bank", "telemarketing", "pyspark"]);

    for (ordinal, (id, job_id)) in JOBS.iter().enumerate() {
        let job = JobReference::new(DATABRICKS_CONNECTION, *job_id).with_param("env", "production");
        builder = builder.step(
            Step::remote_job(*id, &policy, job).with_display_id(format!("{:02}_{}", ordinal + 1, id)),
        );
    }

    let notify = Step::notification(
        "success_notification",
        &policy,
        EmailMessage::new([SUCCESS_RECIPIENT], SUCCESS_SUBJECT, SUCCESS_BODY),
    )
    .with_display_id("06_success_notification");

    let order: Vec<&str> = JOBS
        .iter()
        .map(|(id, _)| *id)
        .chain(std::iter::once("success_notification"))
        .collect();

    builder.step(notify).chain(&order).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use crate::domain::step::StepKind;

    #[test]
    fn test_bank_pipeline_shape() {
        let pipeline = bank_telemarketing().unwrap();

        assert_eq!(pipeline.id, "bank_telemarketing_pipeline");
        assert_eq!(pipeline.schedule.expression(), "0 6 1 * *");
        assert!(!pipeline.catchup);
        assert_eq!(pipeline.tags, vec!["bank", "telemarketing", "pyspark"]);

        let order: Vec<&str> = pipeline
            .graph
            .execution_order()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(
            order,
            vec![
                "silver_cleaning",
                "eda",
                "feature_engineering",
                "ml_training",
                "clustering",
                "success_notification",
            ]
        );
    }

    #[test]
    fn test_bank_pipeline_is_strictly_linear() {
        let pipeline = bank_telemarketing().unwrap();
        let steps: Vec<_> = pipeline.graph.execution_order().collect();
        assert!(pipeline.graph.upstream_of(&steps[0].id).is_empty());
        for pair in steps.windows(2) {
            assert_eq!(pipeline.graph.upstream_of(&pair[1].id), vec![pair[0].id.as_str()]);
        }
    }

    #[test]
    fn test_bank_jobs_and_params() {
        let pipeline = bank_telemarketing().unwrap();
        let jobs: Vec<(u64, &str)> = pipeline
            .graph
            .execution_order()
            .filter_map(|s| match &s.kind {
                StepKind::RemoteJob(job) => Some((job.job_id, job.connection_id.as_str())),
                StepKind::Notification(_) => None,
            })
            .collect();
        assert_eq!(
            jobs,
            vec![
                (1001, "databricks_default"),
                (1002, "databricks_default"),
                (1003, "databricks_default"),
                (1004, "databricks_default"),
                (1005, "databricks_default"),
            ]
        );

        let feature = pipeline.graph.step("feature_engineering").unwrap();
        assert_eq!(feature.display_id, "03_feature_engineering");
        match &feature.kind {
            StepKind::RemoteJob(job) => {
                assert_eq!(job.notebook_params.get("env").map(String::as_str), Some("production"));
            }
            StepKind::Notification(_) => panic!("expected remote job"),
        }
    }

    #[test]
    fn test_bank_policy() {
        let policy = bank_policy().unwrap();
        assert_eq!(policy.owner, "data_engineering_team");
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.retry_delay, Duration::from_secs(300));
        assert!(policy.email_on_failure);
        assert_eq!(policy.failure_recipients, vec!["dataengineer@bank.com"]);
        assert_eq!(policy.start_date, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_success_notification() {
        let pipeline = bank_telemarketing().unwrap();
        let step = pipeline.graph.step("success_notification").unwrap();
        assert_eq!(step.effective_max_retries(), 0);
        match &step.kind {
            StepKind::Notification(message) => {
                assert_eq!(message.to, vec!["marketing_team@bank.com"]);
                assert_eq!(message.subject, "Bank Telemarketing Pipeline Complete");
                assert!(message.html_body.contains("bank_fact_marketing"));
            }
            StepKind::RemoteJob(_) => panic!("expected notification"),
        }
    }
}
