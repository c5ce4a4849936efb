//! Scheduler configuration
//!
//! Defines the configurable parameters of the scheduler: evaluation time
//! zone, run concurrency, overlap handling, remote polling, the mail relay
//! and the named job-runner connections.

use chrono::{FixedOffset, Offset, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use telemark_client::{
    ConnectionRegistry, DatabricksClient, MailRelayClient, normalize_connection_id,
};
use telemark_core::domain::pipeline::PipelineDefinition;
use telemark_core::domain::step::StepKind;
use telemark_core::schedule::parse_offset;

use crate::service::registry::OverlapPolicy;

const CONNECTION_PREFIX: &str = "TELEMARK_CONN_";

/// Credentials for one job-runner workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub token: String,
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Offset in which cron expressions are evaluated
    pub timezone: FixedOffset,

    /// Maximum number of runs executing at the same time
    pub max_active_runs: usize,

    /// What to do when a run for an already active period is requested
    pub overlap_policy: OverlapPolicy,

    /// How often to poll the job runner for the state of a remote run
    pub poll_interval: Duration,

    /// Mail relay base URL; alerts are only logged when unset
    pub mail_relay_url: Option<String>,

    pub mail_relay_token: Option<String>,

    pub mail_from: Option<String>,

    /// Job-runner connections keyed by normalized connection id
    pub connections: HashMap<String, ConnectionConfig>,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new() -> Self {
        Self {
            timezone: Utc.fix(),
            max_active_runs: 16,
            overlap_policy: OverlapPolicy::SkipActive,
            poll_interval: Duration::from_secs(30),
            mail_relay_url: None,
            mail_relay_token: None,
            mail_from: None,
            connections: HashMap::new(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - TELEMARK_TIMEZONE_OFFSET (optional, e.g. `+01:00`, default: UTC)
    /// - TELEMARK_MAX_ACTIVE_RUNS (optional, default: 16)
    /// - TELEMARK_OVERLAP_POLICY (optional, `skip_active` or `allow`, default: skip_active)
    /// - TELEMARK_POLL_INTERVAL (optional, seconds, default: 30)
    /// - TELEMARK_MAIL_RELAY_URL / TELEMARK_MAIL_RELAY_TOKEN / TELEMARK_MAIL_FROM (optional)
    /// - TELEMARK_CONN_<ID>_HOST and TELEMARK_CONN_<ID>_TOKEN per connection
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Builds the configuration from `(name, value)` pairs
    pub fn from_vars<I>(vars: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let mut config = Self::new();

        if let Some(value) = vars.get("TELEMARK_TIMEZONE_OFFSET") {
            config.timezone = parse_offset(value)
                .ok_or_else(|| anyhow::anyhow!("invalid TELEMARK_TIMEZONE_OFFSET `{}`", value))?;
        }

        if let Some(value) = vars.get("TELEMARK_MAX_ACTIVE_RUNS") {
            config.max_active_runs = value
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid TELEMARK_MAX_ACTIVE_RUNS `{}`", value))?;
        }

        if let Some(value) = vars.get("TELEMARK_OVERLAP_POLICY") {
            config.overlap_policy = value.parse()?;
        }

        if let Some(value) = vars.get("TELEMARK_POLL_INTERVAL") {
            config.poll_interval = value
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| anyhow::anyhow!("invalid TELEMARK_POLL_INTERVAL `{}`", value))?;
        }

        config.mail_relay_url = vars.get("TELEMARK_MAIL_RELAY_URL").cloned();
        config.mail_relay_token = vars.get("TELEMARK_MAIL_RELAY_TOKEN").cloned();
        config.mail_from = vars.get("TELEMARK_MAIL_FROM").cloned();

        for (name, value) in &vars {
            let Some(rest) = name.strip_prefix(CONNECTION_PREFIX) else {
                continue;
            };
            let Some(id) = rest.strip_suffix("_HOST") else {
                continue;
            };
            let token_var = format!("{}{}_TOKEN", CONNECTION_PREFIX, id);
            let token = vars
                .get(&token_var)
                .ok_or_else(|| anyhow::anyhow!("{} is set but {} is missing", name, token_var))?;
            config = config.with_connection(id, value.clone(), token.clone());
        }

        Ok(config)
    }

    /// Adds a connection; ids are case-insensitive
    pub fn with_connection(
        mut self,
        id: &str,
        host: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        self.connections.insert(
            normalize_connection_id(id),
            ConnectionConfig {
                host: host.into(),
                token: token.into(),
            },
        );
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_active_runs == 0 {
            anyhow::bail!("max_active_runs must be greater than 0");
        }

        if self.poll_interval.as_secs() == 0 {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if let Some(url) = &self.mail_relay_url {
            if !is_http_url(url) {
                anyhow::bail!("mail_relay_url must start with http:// or https://");
            }
        }

        for (id, conn) in &self.connections {
            if !is_http_url(&conn.host) {
                anyhow::bail!("connection '{}': host must start with http:// or https://", id);
            }
            if conn.token.is_empty() {
                anyhow::bail!("connection '{}': token cannot be empty", id);
            }
        }

        Ok(())
    }

    /// Checks that every connection the pipeline uses is configured
    ///
    /// Runs before the first tick so a misconfigured deployment fails at
    /// startup instead of on the 1st of next month.
    pub fn check_pipeline(&self, pipeline: &PipelineDefinition) -> anyhow::Result<()> {
        let mut missing: Vec<&str> = pipeline
            .graph
            .steps()
            .iter()
            .filter_map(|step| match &step.kind {
                StepKind::RemoteJob(job) => Some(job.connection_id.as_str()),
                StepKind::Notification(_) => None,
            })
            .filter(|id| !self.connections.contains_key(&normalize_connection_id(id)))
            .collect();
        missing.sort_unstable();
        missing.dedup();

        if !missing.is_empty() {
            anyhow::bail!(
                "pipeline '{}' uses unconfigured connection(s): {} (set {}<ID>_HOST and {}<ID>_TOKEN)",
                pipeline.id,
                missing.join(", "),
                CONNECTION_PREFIX,
                CONNECTION_PREFIX
            );
        }
        Ok(())
    }

    /// Creates one Databricks client per configured connection
    pub fn build_connections(&self) -> ConnectionRegistry {
        let mut registry = ConnectionRegistry::new();
        for (id, conn) in &self.connections {
            let client = DatabricksClient::new(conn.host.clone(), conn.token.clone())
                .with_polling_interval(self.poll_interval);
            registry.register(id.clone(), Arc::new(client));
        }
        registry
    }

    /// Creates the mail relay client, if one is configured
    pub fn build_mail_relay(&self) -> Option<MailRelayClient> {
        let url = self.mail_relay_url.as_ref()?;
        let mut client = MailRelayClient::new(url.clone());
        if let Some(token) = &self.mail_relay_token {
            client = client.with_token(token.clone());
        }
        if let Some(from) = &self.mail_from {
            client = client.with_from(from.clone());
        }
        Some(client)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}
