//! Recovery configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the recoverer and its background task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Seconds between two background recovery runs
    pub background_recovery_interval_secs: u64,

    /// Only roll back branches of transactions started by this node
    pub current_node_only_recovery: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            background_recovery_interval_secs: 60,
            current_node_only_recovery: true,
        }
    }
}

impl RecoveryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the background recovery interval
    pub fn with_background_recovery_interval_secs(mut self, secs: u64) -> Self {
        self.background_recovery_interval_secs = secs;
        self
    }

    pub fn with_current_node_only_recovery(mut self, enabled: bool) -> Self {
        self.current_node_only_recovery = enabled;
        self
    }

    /// Interval between background runs, at least one second
    pub fn background_recovery_interval(&self) -> Duration {
        Duration::from_secs(self.background_recovery_interval_secs.max(1))
    }
}
