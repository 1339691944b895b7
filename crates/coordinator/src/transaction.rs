//! Global transactions
//!
//! A `Transaction` enlists resources as branches while ACTIVE, then drives them
//! through two-phase commit or rollback. Status moves along
//! ACTIVE → PREPARING → PREPARED → COMMITTING → COMMITTED, or
//! ACTIVE → ROLLING_BACK → ROLLEDBACK. MARKED_ROLLBACK only allows rollback.

use crate::branch::BranchSet;
use crate::coordinator::CoordinatorContext;
use crate::error::{CoordinatorError, Result};
use crate::phase::{Committer, Preparer, Rollbacker};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use twophase_common::{TransactionStatus, Uid, XaFlags, XaResource};

struct TransactionInner {
    context: Arc<CoordinatorContext>,
    gtrid: Uid,
    timeout: Duration,
    deadline: Instant,
    status: Mutex<TransactionStatus>,
    branches: Mutex<BranchSet>,
}

impl Drop for TransactionInner {
    fn drop(&mut self) {
        let status = *self.status.get_mut();
        if !status.is_terminal() && status != TransactionStatus::Unknown {
            tracing::warn!(
                "Transaction {} dropped in status {}, it is no longer tracked as in flight",
                self.gtrid,
                status
            );
        }
        self.context.in_flight.remove(&self.gtrid);
    }
}

/// Handle to a global transaction
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    pub(crate) fn new(context: Arc<CoordinatorContext>, gtrid: Uid, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                context,
                branches: Mutex::new(BranchSet::new(gtrid.clone())),
                gtrid,
                timeout,
                deadline: Instant::now() + timeout,
                status: Mutex::new(TransactionStatus::Active),
            }),
        }
    }

    /// Global transaction id
    pub fn gtrid(&self) -> &Uid {
        &self.inner.gtrid
    }

    pub fn status(&self) -> TransactionStatus {
        *self.inner.status.lock()
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Whether the transaction outlived its timeout
    pub fn timed_out(&self) -> bool {
        Instant::now() >= self.inner.deadline
    }

    /// Number of enlisted branches
    pub fn branch_count(&self) -> usize {
        self.inner.branches.lock().size()
    }

    /// Unique names of the enlisted resources
    pub fn unique_names(&self) -> BTreeSet<String> {
        self.inner.branches.lock().unique_names()
    }

    fn set_status(&self, status: TransactionStatus) {
        let mut current = self.inner.status.lock();
        tracing::debug!(
            "Changing status of {} from {} to {}",
            self.inner.gtrid,
            *current,
            status
        );
        *current = status;
    }

    /// Enlist a resource produced by a registered producer
    ///
    /// Starts a new branch, or joins an ended branch of the same resource
    /// manager when the producer allows it.
    pub fn enlist(&self, resource: Arc<dyn XaResource>) -> Result<()> {
        match self.status() {
            TransactionStatus::Active => {}
            TransactionStatus::MarkedRollback => {
                return Err(CoordinatorError::Rollback(format!(
                    "transaction {} is marked as rollback only",
                    self.inner.gtrid
                )));
            }
            other => {
                return Err(CoordinatorError::InvalidState(format!(
                    "cannot enlist a resource in a transaction with status {}",
                    other
                )));
            }
        }
        if self.timed_out() {
            self.set_status(TransactionStatus::MarkedRollback);
            return Err(CoordinatorError::Rollback(format!(
                "transaction {} timed out after {:?}",
                self.inner.gtrid, self.inner.timeout
            )));
        }

        let context = &self.inner.context;
        let producer = context
            .registry
            .find_producer_for(resource.as_ref())
            .ok_or_else(|| {
                CoordinatorError::UnknownResource(format!(
                    "cannot enlist in transaction {}",
                    self.inner.gtrid
                ))
            })?;

        let timeout_secs = u32::try_from(self.inner.timeout.as_secs()).unwrap_or(u32::MAX);
        self.inner
            .branches
            .lock()
            .enlist(producer.as_ref(), resource, &context.uids, timeout_secs)?;
        Ok(())
    }

    /// End the branch running on the resource
    ///
    /// A failed delist marks the transaction rollback only. Returns whether the
    /// resource had an active branch.
    pub fn delist(&self, resource: &Arc<dyn XaResource>, success: bool) -> Result<bool> {
        let flags = if success {
            XaFlags::SUCCESS
        } else {
            XaFlags::FAIL
        };
        if !success {
            self.set_rollback_only()?;
        }

        let delisted = self.inner.branches.lock().delist(resource, flags);
        match delisted {
            Ok(branch) => Ok(branch.is_some()),
            Err(e) => {
                self.set_status(TransactionStatus::MarkedRollback);
                Err(e.into())
            }
        }
    }

    /// Make rollback the only possible outcome
    pub fn set_rollback_only(&self) -> Result<()> {
        let mut status = self.inner.status.lock();
        match *status {
            TransactionStatus::Active | TransactionStatus::MarkedRollback => {
                *status = TransactionStatus::MarkedRollback;
                Ok(())
            }
            other => Err(CoordinatorError::InvalidState(format!(
                "cannot mark a transaction with status {} as rollback only",
                other
            ))),
        }
    }

    /// Commit the transaction
    ///
    /// The `COMMITTING` record is forced to the journal once every branch
    /// prepared: a failure before that point rolls the transaction back, a
    /// failure after it leaves the outcome to recovery.
    pub fn commit(&self) -> Result<()> {
        let branches = self.inner.branches.lock();
        match self.status() {
            TransactionStatus::Active => {}
            TransactionStatus::MarkedRollback => {
                self.rollback_after_failure(&branches);
                return Err(CoordinatorError::Rollback(format!(
                    "transaction {} was marked as rollback only",
                    self.inner.gtrid
                )));
            }
            other => {
                return Err(CoordinatorError::InvalidState(format!(
                    "cannot commit a transaction with status {}",
                    other
                )));
            }
        }

        if self.timed_out() {
            tracing::warn!("Transaction {} timed out, rolling back", self.inner.gtrid);
            self.rollback_after_failure(&branches);
            return Err(CoordinatorError::Rollback(format!(
                "transaction {} timed out after {:?}",
                self.inner.gtrid, self.inner.timeout
            )));
        }

        let end_failures = branches.end_all();
        if !end_failures.is_empty() {
            let names: Vec<&str> = end_failures
                .iter()
                .map(|(branch, _)| branch.unique_name())
                .collect();
            for (branch, e) in &end_failures {
                tracing::warn!("Cannot end {}: {}", branch, e);
            }
            self.rollback_after_failure(&branches);
            return Err(CoordinatorError::Rollback(format!(
                "cannot end branch(es) of resource(s) [{}]",
                names.join(", ")
            )));
        }

        if branches.is_empty() {
            self.commit_empty(&branches)
        } else {
            self.commit_branches(&branches)
        }
    }

    /// Commit a transaction without resource
    fn commit_empty(&self, branches: &BranchSet) -> Result<()> {
        if self.inner.context.config.warn_about_zero_resource_transaction {
            tracing::warn!(
                "Committing transaction {} with no enlisted resource",
                branches.gtrid()
            );
        }
        self.set_status(TransactionStatus::Committed);
        self.inner.context.in_flight.remove(&self.inner.gtrid);
        Ok(())
    }

    fn commit_branches(&self, branches: &BranchSet) -> Result<()> {
        let context = &self.inner.context;

        // Phase 1: Prepare
        self.set_status(TransactionStatus::Preparing);
        let preparer = Preparer::new(
            &context.engine,
            context.config.warn_about_zero_resource_transaction,
        );
        let interested = match preparer.prepare(branches, Some(self.inner.deadline)) {
            Ok(interested) => interested,
            Err(e) => {
                tracing::warn!("Prepare of {} failed, rolling back: {}", self.inner.gtrid, e);
                self.rollback_after_failure(branches);
                return Err(e);
            }
        };
        self.set_status(TransactionStatus::Prepared);

        if interested.is_empty() {
            tracing::debug!(
                "Every resource of {} voted read-only, nothing to commit",
                self.inner.gtrid
            );
            self.set_status(TransactionStatus::Committed);
            context.in_flight.remove(&self.inner.gtrid);
            return Ok(());
        }

        // Decision point
        self.set_status(TransactionStatus::Committing);
        let all_names = branches.unique_names();
        let logged = context
            .journal
            .log(TransactionStatus::Committing, &self.inner.gtrid, &all_names)
            .and_then(|_| context.journal.force());
        if let Err(e) = logged {
            tracing::error!(
                "Cannot log the commit decision of {}, rolling back: {}",
                self.inner.gtrid,
                e
            );
            self.rollback_after_failure(branches);
            return Err(e.into());
        }

        // Phase 2: Commit
        let report = Committer::new(&context.engine).commit(branches, &interested);
        let rolled_back = matches!(report.failure, Some(CoordinatorError::Rollback(_)));
        let final_status = if rolled_back {
            TransactionStatus::RolledBack
        } else {
            TransactionStatus::Committed
        };

        let logged = self.log_resolved(final_status, &report.resolved_names);
        match &report.failure {
            None => self.set_status(TransactionStatus::Committed),
            Some(CoordinatorError::Rollback(_)) => self.set_status(TransactionStatus::RolledBack),
            Some(e) => {
                tracing::error!("Transaction {} committed with errors: {}", self.inner.gtrid, e);
                self.set_status(TransactionStatus::Unknown);
            }
        }
        context.in_flight.remove(&self.inner.gtrid);

        match report.failure {
            Some(e) => Err(e),
            None => logged,
        }
    }

    /// Roll the transaction back
    pub fn rollback(&self) -> Result<()> {
        let branches = self.inner.branches.lock();
        match self.status() {
            TransactionStatus::Active | TransactionStatus::MarkedRollback => {}
            other => {
                return Err(CoordinatorError::InvalidState(format!(
                    "cannot roll back a transaction with status {}",
                    other
                )));
            }
        }

        for (branch, e) in branches.end_all() {
            tracing::warn!("Cannot end {} before rollback: {}", branch, e);
        }
        self.rollback_branches(&branches)
    }

    fn rollback_after_failure(&self, branches: &BranchSet) {
        for (branch, e) in branches.end_all() {
            tracing::debug!("Cannot end {} before rollback: {}", branch, e);
        }
        if let Err(e) = self.rollback_branches(branches) {
            tracing::error!("Rollback of {} failed: {}", self.inner.gtrid, e);
        }
    }

    fn rollback_branches(&self, branches: &BranchSet) -> Result<()> {
        self.set_status(TransactionStatus::RollingBack);
        let report = Rollbacker::new(&self.inner.context.engine).rollback(branches);

        let logged = self.log_resolved(TransactionStatus::RolledBack, &report.resolved_names);
        match &report.failure {
            None => self.set_status(TransactionStatus::RolledBack),
            Some(e) => {
                tracing::error!("Transaction {} rolled back with errors: {}", self.inner.gtrid, e);
                self.set_status(TransactionStatus::Unknown);
            }
        }
        self.inner.context.in_flight.remove(&self.inner.gtrid);

        match report.failure {
            Some(e) => Err(e),
            None => logged,
        }
    }

    fn log_resolved(&self, status: TransactionStatus, names: &BTreeSet<String>) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        self.inner
            .context
            .journal
            .log(status, &self.inner.gtrid, names)
            .map_err(|e| {
                tracing::error!(
                    "Cannot log {} for {}, recovery will complete it: {}",
                    status,
                    self.inner.gtrid,
                    e
                );
                CoordinatorError::from(e)
            })
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "a Transaction with GTRID [{}], status={}",
            self.inner.gtrid,
            self.status()
        )
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("gtrid", &self.inner.gtrid)
            .field("status", &self.status())
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}
