//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use twophase_common::MAX_SERVER_ID_LENGTH;

/// How phase jobs are run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ExecutorKind {
    /// On the calling thread, one after the other
    Synchronous,
    /// On a fresh thread per job
    ThreadPerJob,
    /// On a bounded pool of blocking threads
    Pooled { threads: usize },
}

/// Configuration for the transaction coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Identifier embedded in every GTRID; must be unique and stable per node
    pub server_id: Option<String>,

    /// Transaction timeout used by `Coordinator::begin`
    pub default_transaction_timeout_secs: u64,

    /// Executor running the per-branch jobs of a phase
    pub executor: ExecutorKind,

    /// How long a phase waits on a job before rechecking the deadline
    pub job_wait_interval_ms: u64,

    /// Log a warning when a transaction commits without any resource
    pub warn_about_zero_resource_transaction: bool,

    /// How long shutdown waits for in-flight transactions
    pub graceful_shutdown_interval_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            server_id: None,
            default_transaction_timeout_secs: 60,
            executor: ExecutorKind::Synchronous,
            job_wait_interval_ms: 1000,
            warn_about_zero_resource_transaction: true,
            graceful_shutdown_interval_secs: 60,
        }
    }
}

impl CoordinatorConfig {
    /// Create a config with the given server id
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: Some(server_id.into()),
            ..Default::default()
        }
    }

    /// Set the default transaction timeout
    pub fn with_default_transaction_timeout_secs(mut self, secs: u64) -> Self {
        self.default_transaction_timeout_secs = secs;
        self
    }

    /// Set the executor kind
    pub fn with_executor(mut self, executor: ExecutorKind) -> Self {
        self.executor = executor;
        self
    }

    /// Set the job wait interval
    pub fn with_job_wait_interval_ms(mut self, ms: u64) -> Self {
        self.job_wait_interval_ms = ms;
        self
    }

    /// Enable or disable the zero-resource warning
    pub fn with_warn_about_zero_resource_transaction(mut self, warn: bool) -> Self {
        self.warn_about_zero_resource_transaction = warn;
        self
    }

    /// Set the graceful shutdown interval
    pub fn with_graceful_shutdown_interval_secs(mut self, secs: u64) -> Self {
        self.graceful_shutdown_interval_secs = secs;
        self
    }

    pub fn default_transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.default_transaction_timeout_secs)
    }

    pub fn job_wait_interval(&self) -> Duration {
        Duration::from_millis(self.job_wait_interval_ms.max(1))
    }

    pub fn graceful_shutdown_interval(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_interval_secs)
    }

    /// Server id to use: configured, else `HOSTNAME`, else `localhost`
    pub fn resolve_server_id(&self) -> String {
        let server_id = match &self.server_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => match std::env::var("HOSTNAME") {
                Ok(host) if !host.is_empty() => {
                    tracing::info!("No server id configured, using host name '{}'", host);
                    host
                }
                _ => {
                    tracing::warn!(
                        "No server id configured and no host name available, using 'localhost'; \
                         recovery is unreliable unless every node has a distinct server id"
                    );
                    "localhost".to_string()
                }
            },
        };

        if !server_id.is_ascii() {
            tracing::warn!("Server id '{}' contains non-ASCII characters", server_id);
        }
        if server_id.len() > MAX_SERVER_ID_LENGTH {
            tracing::warn!(
                "Server id '{}' is longer than {} bytes and will be truncated",
                server_id,
                MAX_SERVER_ID_LENGTH
            );
        }
        server_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.default_transaction_timeout(), Duration::from_secs(60));
        assert_eq!(config.executor, ExecutorKind::Synchronous);
        assert_eq!(config.job_wait_interval(), Duration::from_millis(1000));
        assert!(config.warn_about_zero_resource_transaction);
        assert_eq!(config.graceful_shutdown_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_configured_server_id_wins() {
        let config = CoordinatorConfig::new("node-7");
        assert_eq!(config.resolve_server_id(), "node-7");
    }

    #[test]
    fn test_executor_from_json() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{ "executor": { "kind": "pooled", "threads": 4 } }"#).unwrap();
        assert_eq!(config.executor, ExecutorKind::Pooled { threads: 4 });
        assert_eq!(config.default_transaction_timeout_secs, 60);

        let config: CoordinatorConfig =
            serde_json::from_str(r#"{ "executor": { "kind": "thread-per-job" } }"#).unwrap();
        assert_eq!(config.executor, ExecutorKind::ThreadPerJob);
    }

    #[test]
    fn test_zero_wait_interval_is_clamped() {
        let config = CoordinatorConfig::default().with_job_wait_interval_ms(0);
        assert_eq!(config.job_wait_interval(), Duration::from_millis(1));
    }
}
