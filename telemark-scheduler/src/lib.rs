//! Telemark Scheduler
//!
//! Runs pipelines on their cron schedule and executes each run step by step
//! against the remote job runner.
//!
//! Architecture:
//! - Configuration: settings from the environment or defaults
//! - Services: run execution, the run registry and alert emails
//! - Scheduler: the cron ticker that turns schedule ticks into runs

pub mod config;
pub mod scheduler;
pub mod service;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
mod testing;
