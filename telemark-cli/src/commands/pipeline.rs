//! Pipeline command handlers
//!
//! Handles the read-only commands: printing the definition, validating it
//! and previewing its fire times.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use colored::*;
use telemark_core::definitions::bank_telemarketing;
use telemark_core::domain::pipeline::PipelineDefinition;
use telemark_core::domain::step::{Step, StepKind};

use crate::config::Config;

/// Print the pipeline definition
pub fn show(pipeline: &PipelineDefinition, json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(pipeline)
            .context("Failed to serialize pipeline definition")?;
        println!("{}", out);
        return Ok(());
    }

    print_pipeline_details(pipeline);
    Ok(())
}

/// Build and validate the definition, reporting the first problem
pub fn validate() -> Result<()> {
    let pipeline = match bank_telemarketing().and_then(|p| p.validate().map(|_| p)) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            println!("{} {}", "✗ Invalid pipeline definition:".red().bold(), e);
            return Err(e.into());
        }
    };

    println!("{}", "✓ Pipeline definition is valid".green().bold());
    println!("  ID:       {}", pipeline.id.cyan());
    println!("  Steps:    {}", pipeline.graph.len());
    println!("  Root:     {}", pipeline.graph.root().display_id);
    println!(
        "  Schedule: {} (catchup {})",
        pipeline.schedule,
        if pipeline.catchup { "on" } else { "off" }
    );

    let mut connections: Vec<&str> = pipeline
        .graph
        .steps()
        .iter()
        .filter_map(|step| match &step.kind {
            StepKind::RemoteJob(job) => Some(job.connection_id.as_str()),
            StepKind::Notification(_) => None,
        })
        .collect();
    connections.sort_unstable();
    connections.dedup();
    println!("  Connections: {}", connections.join(", ").dimmed());

    Ok(())
}

/// Print the next `count` fire times
pub fn schedule(
    pipeline: &PipelineDefinition,
    count: usize,
    after: Option<DateTime<Utc>>,
    config: &Config,
) -> Result<()> {
    let after = after.unwrap_or_else(Utc::now);
    let start_date = pipeline.default_policy.start_date;
    // Nothing fires before the start date
    let from = if after < start_date { start_date - chrono::Duration::minutes(1) } else { after };

    let ticks = pipeline.schedule.upcoming(from, count, config.timezone);
    if ticks.is_empty() {
        println!("{}", "Schedule never fires.".yellow());
        return Ok(());
    }

    println!(
        "{}",
        format!(
            "Next {} run(s) of {} ({}, UTC{}):",
            ticks.len(),
            pipeline.id,
            pipeline.schedule,
            config.timezone
        )
        .bold()
    );
    for tick in ticks {
        println!(
            "  {} {}",
            "▸".cyan(),
            tick.with_timezone(&config.timezone)
                .format("%Y-%m-%d %H:%M %:z")
        );
    }

    Ok(())
}

/// Print detailed pipeline information
fn print_pipeline_details(pipeline: &PipelineDefinition) {
    let policy = &pipeline.default_policy;

    println!("{}", "Pipeline Details:".bold());
    println!("  ID:          {}", pipeline.id.cyan());
    if let Some(desc) = &pipeline.description {
        println!("  Description: {}", desc);
    }
    println!("  Schedule:    {}", pipeline.schedule);
    println!("  Catchup:     {}", pipeline.catchup);
    if !pipeline.tags.is_empty() {
        println!("  Tags:        {}", pipeline.tags.join(", "));
    }
    println!("  Owner:       {}", policy.owner);
    println!(
        "  Start date:  {}",
        policy.start_date.format("%Y-%m-%d %H:%M:%S")
    );
    println!(
        "  Retries:     {} (delay {}s)",
        policy.max_retries,
        policy.retry_delay.as_secs()
    );
    if policy.email_on_failure {
        println!("  Alerts to:   {}", policy.failure_recipients.join(", "));
    }

    println!("\n{}", "Steps:".bold());
    for step in pipeline.graph.execution_order() {
        print_step(pipeline, step);
    }
}

fn print_step(pipeline: &PipelineDefinition, step: &Step) {
    println!(
        "  {} {} {}",
        "▸".cyan(),
        step.display_id.bold(),
        format!("[{}]", step.kind_label()).dimmed()
    );
    match &step.kind {
        StepKind::RemoteJob(job) => {
            println!("    Job:       {} on {}", job.job_id, job.connection_id);
            if !job.notebook_params.is_empty() {
                let params: Vec<String> = job
                    .notebook_params
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect();
                println!("    Params:    {}", params.join(" ").dimmed());
            }
        }
        StepKind::Notification(message) => {
            println!("    To:        {}", message.to.join(", "));
            println!("    Subject:   {}", message.subject);
        }
    }
    let upstream = pipeline.graph.upstream_of(&step.id);
    if !upstream.is_empty() {
        println!("    After:     {}", upstream.join(", ").dimmed());
    }
    println!("    Attempts:  {}", step.max_attempts());
}
