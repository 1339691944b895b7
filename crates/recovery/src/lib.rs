//! Transaction recovery
//!
//! Reconciles the branches XA resources report in doubt with the dangling
//! transactions of the journal: branches of transactions the journal shows as
//! committing are committed, all others are rolled back (presumed abort).

pub mod config;
pub mod error;
pub mod helper;
pub mod incremental;
pub mod recoverer;
pub mod task;

pub use config::RecoveryConfig;
pub use error::{RecoveryError, Result};
pub use incremental::IncrementalRecoverer;
pub use recoverer::{Recoverer, RecoveryCounts};
