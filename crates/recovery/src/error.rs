//! Error types for recovery

use thiserror::Error;
use twophase_common::XaError;
use twophase_journal::JournalError;

/// Recovery error types
#[derive(Error, Debug, Clone)]
pub enum RecoveryError {
    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Recovery of resource {name} failed: {source}")]
    Resource { name: String, source: XaError },

    #[error("Recovery panicked: {0}")]
    Panicked(String),

    #[error("Cannot register resource: {0}")]
    Registration(String),
}

impl From<JournalError> for RecoveryError {
    fn from(e: JournalError) -> Self {
        RecoveryError::Journal(e.to_string())
    }
}

/// Result type for recovery operations
pub type Result<T> = std::result::Result<T, RecoveryError>;
