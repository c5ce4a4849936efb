//! Service layer
//!
//! Services contain the business logic of the scheduler: executing runs
//! step by step, keeping the registry of runs and composing alert emails.

pub mod alerts;
pub mod execution;
pub mod registry;

pub use execution::RunExecutor;
pub use registry::{Admission, OverlapPolicy, RunRegistry};
