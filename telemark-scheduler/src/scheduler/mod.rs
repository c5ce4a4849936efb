//! Scheduler layer
//!
//! Turns the pipeline's cron schedule into runs: fires due ticks, applies
//! the catch-up rule and hands admitted runs to the executor.

pub mod cron;

pub use cron::CronScheduler;
