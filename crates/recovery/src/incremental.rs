//! Recovery of a single resource, typically right before it is registered

use crate::config::RecoveryConfig;
use crate::error::{RecoveryError, Result};
use crate::recoverer::{RecoveryCounts, RecoverySource, end_recovery};
use std::sync::Arc;
use twophase_coordinator::{Coordinator, InFlightTransactions, ResourceProducer, ResourceRegistry};
use twophase_journal::Journal;

/// Recovers one producer at a time against the journal
pub struct IncrementalRecoverer {
    source: RecoverySource,
}

impl IncrementalRecoverer {
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
        }
    }

    pub fn for_coordinator(config: RecoveryConfig, coordinator: &Coordinator) -> Self {
        Self::new(
            config,
            coordinator.journal().clone(),
            coordinator.registry().clone(),
            coordinator.in_flight().clone(),
            coordinator.uid_generator().server_id(),
        )
    }

    /// Recover a single producer
    ///
    /// The producer is marked failed when its scan fails and healthy otherwise.
    pub fn recover(&self, producer: &Arc<dyn ResourceProducer>) -> Result<RecoveryCounts> {
        let name = producer.unique_name().to_string();
        let threshold = self.source.in_flight.oldest_in_flight_timestamp();
        let dangling = self.source.journal.collect_dangling_records()?;

        let scanned = match self.source.scan(producer.clone()) {
            Ok(scanned) => scanned,
            Err(e) => {
                tracing::error!("Incremental recovery of resource {} failed: {}", name, e);
                producer.set_failed(true);
                return Err(e);
            }
        };
        producer.set_failed(false);

        let outcome = self
            .source
            .reconcile(std::slice::from_ref(&scanned), &dangling, threshold);
        end_recovery(&**producer);
        let counts = outcome?;

        tracing::info!(
            "Incremental recovery of resource {} committed {} and rolled back {} branch(es)",
            name,
            counts.committed,
            counts.rolled_back
        );
        Ok(counts)
    }

    /// Register a producer, recovering it first
    ///
    /// The producer is invisible to transactions until its recovery is done.
    /// When recovery fails it stays registered and marked failed, so the next
    /// full recovery retries it.
    pub fn register(&self, producer: Arc<dyn ResourceProducer>) -> Result<RecoveryCounts> {
        let name = producer.unique_name().to_string();
        self.source
            .registry
            .register_uninitialized(producer.clone())
            .map_err(|e| RecoveryError::Registration(e.to_string()))?;

        let outcome = self.recover(&producer);
        self.source.registry.mark_initialized(&name);
        if outcome.is_err() {
            tracing::warn!(
                "Resource {} registered in failed state, background recovery will retry it",
                name
            );
        }
        outcome
    }
}
