//! Core coordinator implementation

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::executor;
use crate::phase::PhaseEngine;
use crate::registry::ResourceRegistry;
use crate::transaction::Transaction;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use twophase_common::{MonotonicClock, Uid, UidGenerator};
use twophase_journal::Journal;

/// State shared by the coordinator and its transactions
pub(crate) struct CoordinatorContext {
    pub(crate) config: CoordinatorConfig,
    pub(crate) uids: UidGenerator,
    pub(crate) journal: Arc<dyn Journal>,
    pub(crate) registry: Arc<ResourceRegistry>,
    pub(crate) engine: PhaseEngine,
    pub(crate) in_flight: Arc<InFlightTransactions>,
}

/// Transactions begun and not yet completed, with their start timestamps
pub struct InFlightTransactions {
    entries: Mutex<HashMap<Uid, u64>>,
    emptied: Condvar,
    clock: MonotonicClock,
}

impl InFlightTransactions {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            emptied: Condvar::new(),
            clock: MonotonicClock::new(),
        }
    }

    pub fn add(&self, gtrid: Uid) {
        let timestamp = gtrid
            .extract_timestamp()
            .unwrap_or_else(|| self.clock.now_millis());
        self.entries.lock().insert(gtrid, timestamp);
    }

    pub fn remove(&self, gtrid: &Uid) {
        let mut entries = self.entries.lock();
        if entries.remove(gtrid).is_some() && entries.is_empty() {
            self.emptied.notify_all();
        }
    }

    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Start timestamp of the oldest in-flight transaction, or now
    pub fn oldest_in_flight_timestamp(&self) -> u64 {
        self.entries
            .lock()
            .values()
            .min()
            .copied()
            .unwrap_or_else(|| self.clock.now_millis())
    }

    /// Block until nothing is in flight; returns false on timeout
    pub fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut entries = self.entries.lock();
        while !entries.is_empty() {
            if self.emptied.wait_until(&mut entries, deadline).timed_out() {
                return entries.is_empty();
            }
        }
        true
    }
}

impl Default for InFlightTransactions {
    fn default() -> Self {
        Self::new()
    }
}

/// XA transaction coordinator
pub struct Coordinator {
    context: Arc<CoordinatorContext>,
    server_id: String,
    shutting_down: AtomicBool,
}

impl Coordinator {
    /// Create a coordinator and open its journal
    pub fn new(
        config: CoordinatorConfig,
        journal: Arc<dyn Journal>,
        registry: Arc<ResourceRegistry>,
    ) -> Result<Self> {
        let server_id = config.resolve_server_id();
        let executor = executor::from_kind(&config.executor)?;
        let engine = PhaseEngine::new(executor, config.job_wait_interval());

        journal.open()?;

        tracing::info!(
            "Coordinator {} started with {} executor and {} registered resource(s)",
            server_id,
            engine.executor().name(),
            registry.unique_names().len()
        );

        Ok(Self {
            context: Arc::new(CoordinatorContext {
                uids: UidGenerator::new(&server_id),
                config,
                journal,
                registry,
                engine,
                in_flight: Arc::new(InFlightTransactions::new()),
            }),
            server_id,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Begin a transaction with the default timeout
    pub fn begin(&self) -> Result<Transaction> {
        self.begin_with_timeout(self.context.config.default_transaction_timeout())
    }

    /// Begin a transaction with the given timeout
    pub fn begin_with_timeout(&self, timeout: Duration) -> Result<Transaction> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(CoordinatorError::ShuttingDown);
        }

        let gtrid = self.context.uids.generate_uid();
        self.context.in_flight.add(gtrid.clone());
        tracing::debug!("Began transaction {} with timeout {:?}", gtrid, timeout);

        Ok(Transaction::new(self.context.clone(), gtrid, timeout))
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.context.config
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn uid_generator(&self) -> &UidGenerator {
        &self.context.uids
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.context.journal
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.context.registry
    }

    pub fn in_flight(&self) -> &Arc<InFlightTransactions> {
        &self.context.in_flight
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop the coordinator
    ///
    /// New transactions are refused, in-flight ones get up to the graceful
    /// shutdown interval to complete, then the executor and the journal are
    /// shut down.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let interval = self.context.config.graceful_shutdown_interval();
        tracing::info!("Shutting down coordinator {}", self.server_id);
        if !self.context.in_flight.wait_until_empty(interval) {
            tracing::warn!(
                "{} transaction(s) still in flight after {:?}, shutting down anyway",
                self.context.in_flight.count(),
                interval
            );
        }

        self.context.engine.shutdown();
        self.context.journal.shutdown();
        tracing::info!("Coordinator {} shut down", self.server_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockProducer, MockResource};
    use twophase_common::TransactionStatus;
    use twophase_journal::NullJournal;

    fn coordinator() -> (Coordinator, Arc<MockProducer>) {
        let registry = Arc::new(ResourceRegistry::new());
        let producer = Arc::new(MockProducer::new(Arc::new(MockResource::new("db"))));
        registry.register(producer.clone()).unwrap();
        let config = CoordinatorConfig::new("node-a").with_graceful_shutdown_interval_secs(1);
        let coordinator = Coordinator::new(config, Arc::new(NullJournal::new()), registry).unwrap();
        (coordinator, producer)
    }

    #[test]
    fn test_in_flight_oldest_timestamp() {
        let uids = UidGenerator::new("node-a");
        let in_flight = InFlightTransactions::new();
        let before = MonotonicClock::new().now_millis();
        assert!(in_flight.oldest_in_flight_timestamp() >= before);

        let first = uids.generate_uid();
        let second = uids.generate_uid();
        in_flight.add(first.clone());
        in_flight.add(second.clone());

        assert_eq!(in_flight.count(), 2);
        assert_eq!(
            Some(in_flight.oldest_in_flight_timestamp()),
            first.extract_timestamp()
        );

        in_flight.remove(&first);
        in_flight.remove(&second);
        assert_eq!(in_flight.count(), 0);
        assert!(in_flight.wait_until_empty(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_until_empty_wakes_up() {
        let uids = UidGenerator::new("node-a");
        let in_flight = Arc::new(InFlightTransactions::new());
        let gtrid = uids.generate_uid();
        in_flight.add(gtrid.clone());

        assert!(!in_flight.wait_until_empty(Duration::from_millis(20)));

        let remover = in_flight.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remover.remove(&gtrid);
        });
        assert!(in_flight.wait_until_empty(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn test_transactions_tracked_in_flight() {
        let (coordinator, producer) = coordinator();
        let tx = coordinator.begin().unwrap();
        assert_eq!(coordinator.in_flight().count(), 1);

        tx.enlist(producer.resource().clone()).unwrap();
        tx.commit().unwrap();

        assert_eq!(tx.status(), TransactionStatus::Committed);
        assert_eq!(coordinator.in_flight().count(), 0);
    }

    #[test]
    fn test_dropped_transaction_no_longer_in_flight() {
        let (coordinator, _) = coordinator();
        let tx = coordinator.begin().unwrap();
        let copy = tx.clone();
        drop(tx);
        assert_eq!(coordinator.in_flight().count(), 1);
        drop(copy);
        assert_eq!(coordinator.in_flight().count(), 0);
    }

    #[test]
    fn test_unknown_resource_rejected() {
        let (coordinator, _) = coordinator();
        let tx = coordinator.begin().unwrap();

        let err = tx.enlist(Arc::new(MockResource::new("stranger"))).unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownResource(_)));
    }

    #[test]
    fn test_shutdown_refuses_new_transactions() {
        let (coordinator, _) = coordinator();
        coordinator.shutdown();

        assert!(coordinator.is_shutting_down());
        assert!(matches!(
            coordinator.begin(),
            Err(CoordinatorError::ShuttingDown)
        ));
        // Idempotent
        coordinator.shutdown();
    }
}
