//! Failure and retry alert emails

use telemark_core::domain::pipeline::PipelineDefinition;
use telemark_core::domain::run::{RunInstance, StepRecord};
use telemark_core::domain::step::{EmailMessage, Step};

/// Alert sent when a step has exhausted its attempts
pub fn failure_alert(pipeline: &PipelineDefinition, run: &RunInstance, step: &Step) -> EmailMessage {
    let subject = format!("[telemark] Task failed: {}.{}", pipeline.id, step.display_id);
    let body = alert_body("has failed", pipeline, run, step);
    EmailMessage::new(step.policy.failure_recipients.clone(), subject, body)
}

/// Alert sent when a failed attempt is about to be retried
pub fn retry_alert(pipeline: &PipelineDefinition, run: &RunInstance, step: &Step) -> EmailMessage {
    let subject = format!("[telemark] Task up for retry: {}.{}", pipeline.id, step.display_id);
    let body = alert_body("is up for retry", pipeline, run, step);
    EmailMessage::new(step.policy.failure_recipients.clone(), subject, body)
}

fn alert_body(what: &str, pipeline: &PipelineDefinition, run: &RunInstance, step: &Step) -> String {
    let record = run.step(&step.id);
    let attempts = record.map(|r| r.attempts.len()).unwrap_or(0);
    let last_error = record
        .and_then(StepRecord::last_attempt)
        .and_then(|a| a.message.as_deref())
        .unwrap_or("no details");
    let run_url = record
        .and_then(StepRecord::last_attempt)
        .and_then(|a| a.external_run_url.as_deref());

    let mut body = format!(
        "<h3>Task {} {}</h3>\n<ul>\n<li>Pipeline: {}</li>\n<li>Run: {}</li>\n<li>Logical date: {}</li>\n<li>Owner: {}</li>\n<li>Attempts: {} of {}</li>\n<li>Last error: {}</li>\n",
        escape_html(&step.display_id),
        what,
        escape_html(&pipeline.id),
        run.id,
        run.logical_date.to_rfc3339(),
        escape_html(&step.policy.owner),
        attempts,
        step.max_attempts(),
        escape_html(last_error),
    );
    if let Some(url) = run_url {
        body.push_str(&format!(
            "<li>Remote run: <a href=\"{}\">{}</a></li>\n",
            escape_html(url),
            escape_html(url)
        ));
    }
    body.push_str("</ul>\n");
    body
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
