//! Named connections
//!
//! Steps refer to the job runner by connection id (e.g. `databricks_default`)
//! rather than by URL. The registry maps ids to configured clients. Ids are
//! case-insensitive.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ClientError, Result};
use crate::{JobRunOutcome, JobRunRequest, JobTrigger};

/// Canonical form of a connection id
pub fn normalize_connection_id(id: &str) -> String {
    id.trim().to_ascii_lowercase()
}

/// Dispatches job runs to the client configured for the job's connection
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<String, Arc<dyn JobTrigger>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the client for a connection id
    pub fn register(&mut self, connection_id: impl Into<String>, trigger: Arc<dyn JobTrigger>) {
        self.connections
            .insert(normalize_connection_id(&connection_id.into()), trigger);
    }

    pub fn with_connection(
        mut self,
        connection_id: impl Into<String>,
        trigger: Arc<dyn JobTrigger>,
    ) -> Self {
        self.register(connection_id, trigger);
        self
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections
            .contains_key(&normalize_connection_id(connection_id))
    }

    /// Configured connection ids, sorted
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.connections.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn resolve(&self, connection_id: &str) -> Result<&Arc<dyn JobTrigger>> {
        self.connections
            .get(&normalize_connection_id(connection_id))
            .ok_or_else(|| ClientError::UnknownConnection(connection_id.to_string()))
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.ids())
            .finish()
    }
}

#[async_trait]
impl JobTrigger for ConnectionRegistry {
    async fn run_job(&self, request: &JobRunRequest) -> Result<JobRunOutcome> {
        self.resolve(&request.job.connection_id)?
            .run_job(request)
            .await
    }
}
