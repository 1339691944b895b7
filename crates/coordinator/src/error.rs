//! Error types for the coordinator

use thiserror::Error;
use twophase_common::XaError;
use twophase_journal::JournalError;

/// Coordinator error types
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Transaction rolled back: {0}")]
    Rollback(String),

    #[error("Heuristic mixed outcome: {message}")]
    HeuristicMixed {
        message: String,
        resources: Vec<String>,
        hazard: bool,
    },

    #[error("Heuristic rollback: {message}")]
    HeuristicRollback {
        message: String,
        resources: Vec<String>,
    },

    #[error("Heuristic commit: {message}")]
    HeuristicCommit {
        message: String,
        resources: Vec<String>,
    },

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Resource error: {0}")]
    Xa(#[from] XaError),

    #[error("Invalid transaction state: {0}")]
    InvalidState(String),

    #[error("Resource {0} is already registered")]
    DuplicateResource(String),

    #[error("Invalid resource name '{0}'")]
    InvalidResourceName(String),

    #[error("No registered producer owns the resource: {0}")]
    UnknownResource(String),

    #[error("Executor unavailable: {0}")]
    ExecutorUnavailable(String),

    #[error("Coordinator is shutting down")]
    ShuttingDown,
}

impl CoordinatorError {
    /// Resources implicated in a heuristic outcome
    pub fn resources(&self) -> &[String] {
        match self {
            CoordinatorError::HeuristicMixed { resources, .. }
            | CoordinatorError::HeuristicRollback { resources, .. }
            | CoordinatorError::HeuristicCommit { resources, .. } => resources,
            _ => &[],
        }
    }

    /// Whether the error reports a heuristic outcome
    pub fn is_heuristic(&self) -> bool {
        matches!(
            self,
            CoordinatorError::HeuristicMixed { .. }
                | CoordinatorError::HeuristicRollback { .. }
                | CoordinatorError::HeuristicCommit { .. }
        )
    }
}

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;
