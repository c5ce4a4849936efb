//! Core domain types
//!
//! Pipeline definitions are shared between the scheduler (which materializes
//! runs) and the CLI (which prints and validates them). Run types are owned
//! by the scheduler but live here so every crate sees the same state machine.

pub mod pipeline;
pub mod policy;
pub mod run;
pub mod step;
