//! Journal configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for the disk journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// First of the two log files
    pub log_part1_filename: PathBuf,

    /// Second of the two log files
    pub log_part2_filename: PathBuf,

    /// Size each log file is preallocated to, in megabytes
    pub max_log_size_in_mb: u32,

    /// Whether `force` actually syncs to disk
    pub forced_write_enabled: bool,

    /// Only write COMMITTING, COMMITTED and UNKNOWN records
    pub filter_log_status: bool,

    /// Skip records with a bad checksum instead of ending the scan there
    pub skip_corrupted_logs: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            log_part1_filename: PathBuf::from("twophase-part1.tlog"),
            log_part2_filename: PathBuf::from("twophase-part2.tlog"),
            max_log_size_in_mb: 2,
            forced_write_enabled: true,
            filter_log_status: false,
            skip_corrupted_logs: false,
        }
    }
}

impl JournalConfig {
    /// Create a config keeping both log files in the given directory
    pub fn new(directory: impl AsRef<Path>) -> Self {
        let directory = directory.as_ref();
        let defaults = Self::default();
        Self {
            log_part1_filename: directory.join(&defaults.log_part1_filename),
            log_part2_filename: directory.join(&defaults.log_part2_filename),
            ..defaults
        }
    }

    /// Set the log file names
    pub fn with_filenames(mut self, part1: impl Into<PathBuf>, part2: impl Into<PathBuf>) -> Self {
        self.log_part1_filename = part1.into();
        self.log_part2_filename = part2.into();
        self
    }

    /// Set the log file size
    pub fn with_max_log_size_in_mb(mut self, size: u32) -> Self {
        self.max_log_size_in_mb = size;
        self
    }

    /// Enable or disable fsync on `force`
    pub fn with_forced_write_enabled(mut self, enabled: bool) -> Self {
        self.forced_write_enabled = enabled;
        self
    }

    /// Enable or disable status filtering
    pub fn with_filter_log_status(mut self, enabled: bool) -> Self {
        self.filter_log_status = enabled;
        self
    }

    /// Enable or disable skipping of corrupted records
    pub fn with_skip_corrupted_logs(mut self, enabled: bool) -> Self {
        self.skip_corrupted_logs = enabled;
        self
    }

    /// Log file size in bytes
    pub fn max_log_size_bytes(&self) -> u64 {
        u64::from(self.max_log_size_in_mb) * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JournalConfig::default();
        assert_eq!(config.max_log_size_in_mb, 2);
        assert_eq!(config.max_log_size_bytes(), 2 * 1024 * 1024);
        assert!(config.forced_write_enabled);
        assert!(!config.filter_log_status);
        assert!(!config.skip_corrupted_logs);
    }

    #[test]
    fn test_new_places_files_in_directory() {
        let config = JournalConfig::new("/var/lib/tm").with_skip_corrupted_logs(true);
        assert_eq!(
            config.log_part1_filename,
            PathBuf::from("/var/lib/tm/twophase-part1.tlog")
        );
        assert_eq!(
            config.log_part2_filename,
            PathBuf::from("/var/lib/tm/twophase-part2.tlog")
        );
        assert!(config.skip_corrupted_logs);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: JournalConfig =
            serde_json::from_str(r#"{ "max_log_size_in_mb": 8 }"#).unwrap();
        assert_eq!(config.max_log_size_in_mb, 8);
        assert!(config.forced_write_enabled);
    }
}
