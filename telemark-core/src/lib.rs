//! Telemark Core
//!
//! Core types for the Telemark batch pipeline engine.
//!
//! This crate contains:
//! - Domain types: pipeline definitions, steps, execution policy and runs
//! - The validated task graph and cron schedule
//! - The bundled bank telemarketing pipeline definition

pub mod definitions;
pub mod domain;
pub mod error;
pub mod graph;
pub mod schedule;

pub use error::{DefinitionError, ScheduleError, TransitionError};
