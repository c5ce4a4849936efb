//! Configuration module
//!
//! Settings shared by every command, taken from global flags or the
//! environment.

use chrono::FixedOffset;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Offset in which cron expressions are evaluated and times are printed
    pub timezone: FixedOffset,

    /// Log progress of runs
    pub verbose: bool,
}
