//! XA two-phase commit coordinator
//!
//! This crate provides:
//! - The resource registry producers register into
//! - Transactions enlisting XA resources as branches
//! - The phase engine running prepare, commit and rollback across branches in
//!   commit-ordering position order, with heuristic classification
//! - Executors running the per-branch jobs
//! - Mock resources for tests

pub mod branch;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod mock;
pub mod phase;
pub mod registry;
pub mod transaction;

pub use branch::{BranchSet, BranchState};
pub use config::{CoordinatorConfig, ExecutorKind};
pub use coordinator::{Coordinator, InFlightTransactions};
pub use error::{CoordinatorError, Result};
pub use executor::{Executor, JobError};
pub use phase::{Classification, Decision, PhaseEngine};
pub use registry::{ResourceProducer, ResourceRegistry};
pub use transaction::Transaction;
