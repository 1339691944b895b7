//! Registry of resource producers
//!
//! A producer stands for one resource manager known under a unique name. It
//! hands out recovery handles and tells the coordinator how its branches must
//! be scheduled. Producers registered *uninitialized* are invisible to lookups
//! until `mark_initialized` is called, so recovery of a newly added resource
//! can finish before any transaction or full recovery run sees it.

use crate::error::{CoordinatorError, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use twophase_common::{XaResource, XaResult};
use twophase_scheduler::DEFAULT_POSITION;

/// Source of XA resources for one resource manager
pub trait ResourceProducer: Send + Sync {
    /// Name under which branches of this resource are journaled
    fn unique_name(&self) -> &str;

    /// Commit ordering position, lower commits later and prepares earlier
    fn two_pc_ordering_position(&self) -> i32 {
        DEFAULT_POSITION
    }

    /// Whether a re-enlisted connection may join an ended branch
    fn use_tm_join(&self) -> bool {
        true
    }

    /// Whether the transaction timeout is passed to enlisted resources
    fn apply_transaction_timeout(&self) -> bool {
        false
    }

    /// Whether the resource emulates XA and must be prepared last
    fn is_emulating(&self) -> bool {
        false
    }

    /// Get a handle to run recovery with
    fn start_recovery(&self) -> XaResult<Arc<dyn XaResource>>;

    /// Release the recovery handle
    fn end_recovery(&self) -> XaResult<()>;

    /// Flag the resource as failing recovery
    fn set_failed(&self, failed: bool);

    fn is_failed(&self) -> bool;

    /// Whether the given live resource was produced by this producer
    fn owns(&self, resource: &dyn XaResource) -> bool;
}

struct Registration {
    producer: Arc<dyn ResourceProducer>,
    initialized: bool,
}

/// Producers by unique name
#[derive(Default)]
pub struct ResourceRegistry {
    registrations: RwLock<BTreeMap<String, Registration>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a producer, immediately visible
    pub fn register(&self, producer: Arc<dyn ResourceProducer>) -> Result<()> {
        self.insert(producer, true)
    }

    /// Register a producer that stays invisible until `mark_initialized`
    pub fn register_uninitialized(&self, producer: Arc<dyn ResourceProducer>) -> Result<()> {
        self.insert(producer, false)
    }

    /// Make an uninitialized producer visible; returns false if unknown
    pub fn mark_initialized(&self, unique_name: &str) -> bool {
        match self.registrations.write().get_mut(unique_name) {
            Some(registration) => {
                registration.initialized = true;
                true
            }
            None => false,
        }
    }

    /// Remove a producer, initialized or not
    pub fn unregister(&self, unique_name: &str) -> Option<Arc<dyn ResourceProducer>> {
        let removed = self.registrations.write().remove(unique_name);
        if removed.is_some() {
            tracing::debug!("Unregistered resource {}", unique_name);
        }
        removed.map(|registration| registration.producer)
    }

    /// Initialized producer with the given name
    pub fn get(&self, unique_name: &str) -> Option<Arc<dyn ResourceProducer>> {
        self.registrations
            .read()
            .get(unique_name)
            .filter(|registration| registration.initialized)
            .map(|registration| registration.producer.clone())
    }

    /// Whether a producer is registered under that name, initialized or not
    pub fn contains(&self, unique_name: &str) -> bool {
        self.registrations.read().contains_key(unique_name)
    }

    /// Names of the initialized producers
    pub fn unique_names(&self) -> BTreeSet<String> {
        self.registrations
            .read()
            .iter()
            .filter(|(_, registration)| registration.initialized)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Initialized producers in name order
    pub fn producers(&self) -> Vec<Arc<dyn ResourceProducer>> {
        self.registrations
            .read()
            .values()
            .filter(|registration| registration.initialized)
            .map(|registration| registration.producer.clone())
            .collect()
    }

    /// Initialized producer owning the given live resource
    pub fn find_producer_for(&self, resource: &dyn XaResource) -> Option<Arc<dyn ResourceProducer>> {
        self.registrations
            .read()
            .values()
            .filter(|registration| registration.initialized)
            .find(|registration| registration.producer.owns(resource))
            .map(|registration| registration.producer.clone())
    }

    fn insert(&self, producer: Arc<dyn ResourceProducer>, initialized: bool) -> Result<()> {
        let name = producer.unique_name().to_string();
        if name.is_empty() || name.len() > usize::from(u16::MAX) {
            return Err(CoordinatorError::InvalidResourceName(name));
        }

        let mut registrations = self.registrations.write();
        if registrations.contains_key(&name) {
            return Err(CoordinatorError::DuplicateResource(name));
        }
        tracing::debug!(
            "Registered resource {} ({})",
            name,
            if initialized { "initialized" } else { "uninitialized" }
        );
        registrations.insert(
            name,
            Registration {
                producer,
                initialized,
            },
        );
        Ok(())
    }
}
