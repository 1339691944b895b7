//! Full recovery of every registered resource
//!
//! A run reconciles what the resources report in doubt with what the journal
//! says: branches of a transaction still dangling in the journal are committed,
//! any other branch is rolled back (presumed abort). Branches of transactions
//! not older than the oldest in-flight transaction are never touched.

use crate::config::RecoveryConfig;
use crate::error::{RecoveryError, Result};
use crate::helper;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use twophase_common::{TransactionStatus, Uid, XaResource, Xid};
use twophase_coordinator::executor::panic_message;
use twophase_coordinator::{Coordinator, InFlightTransactions, ResourceProducer, ResourceRegistry};
use twophase_journal::{Journal, LogRecord};

/// Branches committed and rolled back by a recovery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryCounts {
    pub committed: usize,
    pub rolled_back: usize,
}

/// A producer whose recovery scan succeeded
pub(crate) struct ScannedResource {
    pub(crate) producer: Arc<dyn ResourceProducer>,
    pub(crate) resource: Arc<dyn XaResource>,
    pub(crate) xids: Vec<Xid>,
}

/// What recovery needs from the coordinator
pub(crate) struct RecoverySource {
    pub(crate) config: RecoveryConfig,
    pub(crate) journal: Arc<dyn Journal>,
    pub(crate) registry: Arc<ResourceRegistry>,
    pub(crate) in_flight: Arc<InFlightTransactions>,
    pub(crate) server_id: Vec<u8>,
}

impl RecoverySource {
    /// Open a recovery session on the producer and scan it
    ///
    /// `end_recovery` is called right away when the scan fails; otherwise the
    /// caller must call it once done with the returned resource.
    pub(crate) fn scan(&self, producer: Arc<dyn ResourceProducer>) -> Result<ScannedResource> {
        let name = producer.unique_name().to_string();
        let resource = producer
            .start_recovery()
            .map_err(|source| RecoveryError::Resource {
                name: name.clone(),
                source,
            })?;

        match helper::recover_xids(&*resource, &name) {
            Ok(xids) => Ok(ScannedResource {
                producer,
                resource,
                xids,
            }),
            Err(source) => {
                end_recovery(&*producer);
                Err(RecoveryError::Resource { name, source })
            }
        }
    }

    /// Commit dangling branches and roll back the others
    pub(crate) fn reconcile(
        &self,
        scanned: &[ScannedResource],
        dangling: &HashMap<Uid, LogRecord>,
        threshold: u64,
    ) -> Result<RecoveryCounts> {
        let mut counts = RecoveryCounts::default();

        for (gtrid, record) in dangling {
            if !is_older(gtrid, threshold) {
                tracing::debug!("Skipping dangling {}, it is not older than in-flight transactions", gtrid);
                continue;
            }

            let mut committed_names = BTreeSet::new();
            for entry in scanned {
                let name = entry.producer.unique_name();
                if !record.unique_names().contains(name) {
                    continue;
                }
                let mut matched = false;
                let mut all_committed = true;
                for xid in entry
                    .xids
                    .iter()
                    .filter(|xid| xid.global_transaction_id() == gtrid)
                {
                    matched = true;
                    if helper::commit(&*entry.resource, xid, name) {
                        counts.committed += 1;
                    } else {
                        all_committed = false;
                    }
                }
                if matched && all_committed {
                    committed_names.insert(name.to_string());
                }
            }

            if !committed_names.is_empty() {
                tracing::info!(
                    "Committed dangling transaction {} on resource(s) {:?}",
                    gtrid,
                    committed_names
                );
                self.journal
                    .log(TransactionStatus::Committed, gtrid, &committed_names)?;
            }
        }

        for entry in scanned {
            let name = entry.producer.unique_name();
            for xid in &entry.xids {
                let gtrid = xid.global_transaction_id();
                if dangling.contains_key(gtrid) || !is_older(gtrid, threshold) {
                    continue;
                }
                if self.config.current_node_only_recovery
                    && gtrid.extract_server_id() != Some(self.server_id.as_slice())
                {
                    tracing::debug!(
                        "Skipping {} of resource {}, started by another node",
                        xid,
                        name
                    );
                    continue;
                }
                if helper::rollback(&*entry.resource, xid, name) {
                    counts.rolled_back += 1;
                }
            }
        }

        Ok(counts)
    }
}

fn is_older(gtrid: &Uid, threshold: u64) -> bool {
    gtrid
        .extract_timestamp()
        .is_none_or(|timestamp| timestamp < threshold)
}

pub(crate) fn end_recovery(producer: &dyn ResourceProducer) {
    if let Err(e) = producer.end_recovery() {
        tracing::warn!("Cannot end recovery of resource {}: {}", producer.unique_name(), e);
    }
}

/// Recovers every registered resource, one run at a time
pub struct Recoverer {
    source: RecoverySource,
    running: AtomicBool,
    committed_count: AtomicUsize,
    rolledback_count: AtomicUsize,
    executions_count: AtomicUsize,
    completion_error: Mutex<Option<RecoveryError>>,
}

impl Recoverer {
    pub fn new(
        config: RecoveryConfig,
        journal: Arc<dyn Journal>,
        registry: Arc<ResourceRegistry>,
        in_flight: Arc<InFlightTransactions>,
        server_id: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            source: RecoverySource {
                config,
                journal,
                registry,
                in_flight,
                server_id: server_id.into(),
            },
            running: AtomicBool::new(false),
            committed_count: AtomicUsize::new(0),
            rolledback_count: AtomicUsize::new(0),
            executions_count: AtomicUsize::new(0),
            completion_error: Mutex::new(None),
        }
    }

    /// Recoverer sharing the coordinator's journal, registry and in-flight table
    pub fn for_coordinator(config: RecoveryConfig, coordinator: &Coordinator) -> Self {
        Self::new(
            config,
            coordinator.journal().clone(),
            coordinator.registry().clone(),
            coordinator.in_flight().clone(),
            coordinator.uid_generator().server_id(),
        )
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.source.config
    }

    /// Run a recovery
    ///
    /// Refused when another run is in progress. Failures, panics included,
    /// are logged and kept as the completion error, never returned.
    pub fn run(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!("Recoverer is already running, abandoning this recovery request");
            return;
        }

        tracing::debug!("Starting recovery");
        let (counts, error) = match panic::catch_unwind(AssertUnwindSafe(|| self.recover_all())) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => (RecoveryCounts::default(), Some(e)),
            Err(payload) => (
                RecoveryCounts::default(),
                Some(RecoveryError::Panicked(panic_message(payload.as_ref()))),
            ),
        };

        self.committed_count.store(counts.committed, Ordering::SeqCst);
        self.rolledback_count.store(counts.rolled_back, Ordering::SeqCst);
        match &error {
            None => tracing::info!(
                "Recovery committed {} dangling branch(es) and rolled back {} aborted branch(es)",
                counts.committed,
                counts.rolled_back
            ),
            Some(e) => tracing::error!(
                "Recovery completed with an error after committing {} and rolling back {} branch(es): {}",
                counts.committed,
                counts.rolled_back,
                e
            ),
        }
        *self.completion_error.lock() = error;
        self.executions_count.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    fn recover_all(&self) -> Result<(RecoveryCounts, Option<RecoveryError>)> {
        let producers = self.source.registry.producers();
        let threshold = self.source.in_flight.oldest_in_flight_timestamp();
        let dangling = self.source.journal.collect_dangling_records()?;
        tracing::debug!(
            "Recovering {} resource(s) against {} dangling transaction(s)",
            producers.len(),
            dangling.len()
        );

        let mut first_error = None;
        let mut scanned = Vec::new();
        for producer in producers {
            match self.source.scan(producer.clone()) {
                Ok(entry) => {
                    producer.set_failed(false);
                    scanned.push(entry);
                }
                Err(e) => {
                    tracing::warn!("Excluding resource {} from this recovery: {}", producer.unique_name(), e);
                    producer.set_failed(true);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        let outcome = self.source.reconcile(&scanned, &dangling, threshold);
        for entry in &scanned {
            end_recovery(&*entry.producer);
        }

        Ok((outcome?, first_error))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Branches committed by the last run
    pub fn committed_count(&self) -> usize {
        self.committed_count.load(Ordering::SeqCst)
    }

    /// Branches rolled back by the last run
    pub fn rolledback_count(&self) -> usize {
        self.rolledback_count.load(Ordering::SeqCst)
    }

    pub fn executions_count(&self) -> usize {
        self.executions_count.load(Ordering::SeqCst)
    }

    /// Error the last run ended with, if any
    pub fn completion_error(&self) -> Option<RecoveryError> {
        self.completion_error.lock().clone()
    }
}
