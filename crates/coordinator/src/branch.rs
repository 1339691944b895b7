//! Resource branches of a transaction

use crate::error::Result;
use crate::registry::ResourceProducer;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use twophase_common::{Uid, UidGenerator, XaError, XaFlags, XaResource, XaResult, Xid};
use twophase_scheduler::{Order, Scheduler};

/// One resource enlisted in a transaction
pub struct BranchState {
    xid: Xid,
    resource: Arc<dyn XaResource>,
    unique_name: String,
    position: i32,
    emulating: bool,
    started: AtomicBool,
    ended: AtomicBool,
}

impl BranchState {
    pub fn new(
        xid: Xid,
        resource: Arc<dyn XaResource>,
        unique_name: impl Into<String>,
        position: i32,
        emulating: bool,
    ) -> Self {
        Self {
            xid,
            resource,
            unique_name: unique_name.into(),
            position,
            emulating,
            started: AtomicBool::new(false),
            ended: AtomicBool::new(false),
        }
    }

    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    pub fn resource(&self) -> &Arc<dyn XaResource> {
        &self.resource
    }

    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    pub fn position(&self) -> i32 {
        self.position
    }

    pub fn is_emulating(&self) -> bool {
        self.emulating
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Started and not yet ended
    pub fn is_active(&self) -> bool {
        self.is_started() && !self.is_ended()
    }

    /// Whether this branch runs on the given resource handle
    pub fn uses(&self, resource: &Arc<dyn XaResource>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.resource), Arc::as_ptr(resource))
    }

    pub fn start(&self, flags: XaFlags) -> XaResult<()> {
        self.resource.start(&self.xid, flags)?;
        self.started.store(true, Ordering::SeqCst);
        self.ended.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn end(&self, flags: XaFlags) -> XaResult<()> {
        self.resource.end(&self.xid, flags)?;
        self.ended.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl fmt::Display for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "a BranchState of {} with xid {}, position {}{}",
            self.unique_name,
            self.xid,
            self.position,
            if self.emulating { " (emulating)" } else { "" }
        )
    }
}

impl fmt::Debug for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchState")
            .field("xid", &self.xid)
            .field("unique_name", &self.unique_name)
            .field("position", &self.position)
            .field("emulating", &self.emulating)
            .field("started", &self.is_started())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Branches of one transaction, ordered by commit position
pub struct BranchSet {
    gtrid: Uid,
    branches: Scheduler<Arc<BranchState>>,
}

impl BranchSet {
    pub fn new(gtrid: Uid) -> Self {
        Self {
            gtrid,
            branches: Scheduler::new(),
        }
    }

    pub fn gtrid(&self) -> &Uid {
        &self.gtrid
    }

    /// Start a branch of this transaction on the resource
    ///
    /// A resource already running a branch is left as is. When the producer
    /// allows it and an ended branch of the same resource manager exists, that
    /// branch is joined instead of starting a new one.
    pub fn enlist(
        &mut self,
        producer: &dyn ResourceProducer,
        resource: Arc<dyn XaResource>,
        uids: &UidGenerator,
        timeout_secs: u32,
    ) -> Result<Arc<BranchState>> {
        if let Some(active) = self
            .branches
            .iter()
            .find(|branch| branch.is_active() && branch.uses(&resource))
        {
            tracing::debug!("{} already enlisted", active);
            return Ok(active.clone());
        }

        if producer.use_tm_join() {
            if let Some(joined) = self.try_join(producer, &resource)? {
                return Ok(joined);
            }
        }

        let xid = uids.generate_xid(&self.gtrid);
        if producer.apply_transaction_timeout() {
            match resource.set_transaction_timeout(timeout_secs) {
                Ok(true) => {}
                Ok(false) => tracing::debug!(
                    "Resource {} does not support transaction timeouts",
                    producer.unique_name()
                ),
                Err(e) => tracing::warn!(
                    "Cannot set transaction timeout on {}: {}",
                    producer.unique_name(),
                    e
                ),
            }
        }

        let branch = Arc::new(BranchState::new(
            xid,
            resource,
            producer.unique_name(),
            producer.two_pc_ordering_position(),
            producer.is_emulating(),
        ));
        branch.start(XaFlags::NONE)?;
        tracing::debug!("Enlisted {}", branch);

        self.branches.add(branch.clone(), branch.position());
        Ok(branch)
    }

    fn try_join(
        &mut self,
        producer: &dyn ResourceProducer,
        resource: &Arc<dyn XaResource>,
    ) -> Result<Option<Arc<BranchState>>> {
        let mut candidate = None;
        for branch in self.branches.iter() {
            if branch.is_ended()
                && branch.unique_name() == producer.unique_name()
                && resource.is_same_rm(branch.resource().as_ref())?
            {
                candidate = Some(branch.clone());
                break;
            }
        }
        let Some(previous) = candidate else {
            return Ok(None);
        };

        let joined = Arc::new(BranchState::new(
            previous.xid().clone(),
            resource.clone(),
            previous.unique_name(),
            previous.position(),
            previous.is_emulating(),
        ));
        joined.start(XaFlags::JOIN)?;
        tracing::debug!("Joined {}", joined);

        self.branches
            .remove_by(|branch| Arc::ptr_eq(branch, &previous));
        self.branches.add(joined.clone(), joined.position());
        Ok(Some(joined))
    }

    /// End the active branch running on the resource
    ///
    /// Returns the branch, or `None` if the resource has no active branch.
    pub fn delist(
        &self,
        resource: &Arc<dyn XaResource>,
        flags: XaFlags,
    ) -> XaResult<Option<Arc<BranchState>>> {
        let Some(branch) = self
            .branches
            .iter()
            .find(|branch| branch.is_active() && branch.uses(resource))
            .cloned()
        else {
            return Ok(None);
        };

        branch.end(flags)?;
        tracing::debug!("Delisted {}", branch);
        Ok(Some(branch))
    }

    /// End every active branch with `TMSUCCESS`
    ///
    /// All branches are attempted; failures are returned with their branch.
    pub fn end_all(&self) -> Vec<(Arc<BranchState>, XaError)> {
        self.branches
            .iter()
            .filter(|branch| branch.is_active())
            .filter_map(|branch| {
                branch
                    .end(XaFlags::SUCCESS)
                    .err()
                    .map(|e| (branch.clone(), e))
            })
            .collect()
    }

    pub fn size(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Unique names of every enlisted resource
    pub fn unique_names(&self) -> BTreeSet<String> {
        self.branches
            .iter()
            .map(|branch| branch.unique_name().to_string())
            .collect()
    }

    /// Branches in the given order
    pub fn branches(&self, order: Order) -> Vec<Arc<BranchState>> {
        match order {
            Order::Natural => self.branches.iter().cloned().collect(),
            Order::Reverse => self.branches.iter_reverse().cloned().collect(),
        }
    }

    pub fn scheduler(&self) -> &Scheduler<Arc<BranchState>> {
        &self.branches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockProducer, MockResource};

    fn setup(name: &str) -> (Arc<MockResource>, MockProducer) {
        let resource = Arc::new(MockResource::new(name));
        let producer = MockProducer::new(resource.clone());
        (resource, producer)
    }

    #[test]
    fn test_enlist_starts_branch() {
        let uids = UidGenerator::new("node-a");
        let mut set = BranchSet::new(uids.generate_uid());
        let (resource, producer) = setup("db");

        let branch = set.enlist(&producer, resource.clone(), &uids, 30).unwrap();

        assert!(branch.is_active());
        assert_eq!(branch.xid().global_transaction_id(), set.gtrid());
        assert_eq!(
            resource.calls(),
            vec![MockCall::Start(branch.xid().clone(), XaFlags::NONE)]
        );
        assert_eq!(set.size(), 1);
    }

    #[test]
    fn test_enlist_twice_is_noop() {
        let uids = UidGenerator::new("node-a");
        let mut set = BranchSet::new(uids.generate_uid());
        let (resource, producer) = setup("db");

        let first = set.enlist(&producer, resource.clone(), &uids, 30).unwrap();
        let second = set.enlist(&producer, resource.clone(), &uids, 30).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(set.size(), 1);
        assert_eq!(resource.calls().len(), 1);
    }

    #[test]
    fn test_reenlist_joins_ended_branch() {
        let uids = UidGenerator::new("node-a");
        let mut set = BranchSet::new(uids.generate_uid());
        let (resource, producer) = setup("db");
        let handle: Arc<dyn XaResource> = resource.clone();

        let first = set.enlist(&producer, handle.clone(), &uids, 30).unwrap();
        set.delist(&handle, XaFlags::SUCCESS).unwrap();
        let joined = set.enlist(&producer, handle.clone(), &uids, 30).unwrap();

        assert_eq!(joined.xid(), first.xid());
        assert!(joined.is_active());
        assert_eq!(set.size(), 1);
        assert_eq!(
            resource.calls().last(),
            Some(&MockCall::Start(first.xid().clone(), XaFlags::JOIN))
        );
    }

    #[test]
    fn test_no_join_when_producer_refuses() {
        let uids = UidGenerator::new("node-a");
        let mut set = BranchSet::new(uids.generate_uid());
        let resource = Arc::new(MockResource::new("db"));
        let producer = MockProducer::new(resource.clone()).with_tm_join(false);
        let handle: Arc<dyn XaResource> = resource.clone();

        let first = set.enlist(&producer, handle.clone(), &uids, 30).unwrap();
        set.delist(&handle, XaFlags::SUCCESS).unwrap();
        let second = set.enlist(&producer, handle.clone(), &uids, 30).unwrap();

        assert_ne!(first.xid(), second.xid());
        assert_eq!(set.size(), 2);
    }

    #[test]
    fn test_transaction_timeout_applied() {
        let uids = UidGenerator::new("node-a");
        let mut set = BranchSet::new(uids.generate_uid());
        let resource = Arc::new(MockResource::new("db"));
        let producer = MockProducer::new(resource.clone()).with_apply_transaction_timeout(true);

        set.enlist(&producer, resource.clone(), &uids, 42).unwrap();

        assert_eq!(resource.calls()[0], MockCall::SetTransactionTimeout(42));
        assert_eq!(resource.transaction_timeout().unwrap(), 42);
    }

    #[test]
    fn test_end_all_reports_failures() {
        let uids = UidGenerator::new("node-a");
        let mut set = BranchSet::new(uids.generate_uid());
        let (db, db_producer) = setup("db");
        let (mq, mq_producer) = setup("mq");
        mq.fail_on(crate::mock::MockOp::End, twophase_common::XaErrorCode::RmFail);

        set.enlist(&db_producer, db.clone(), &uids, 30).unwrap();
        set.enlist(&mq_producer, mq.clone(), &uids, 30).unwrap();

        let failures = set.end_all();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0.unique_name(), "mq");
        assert!(set.branches(Order::Natural)[0].is_ended());
    }

    #[test]
    fn test_ordering_by_position() {
        let uids = UidGenerator::new("node-a");
        let mut set = BranchSet::new(uids.generate_uid());
        let late = Arc::new(MockResource::new("late"));
        let early = Arc::new(MockResource::new("early"));

        set.enlist(
            &MockProducer::new(late.clone()).with_position(5),
            late.clone(),
            &uids,
            30,
        )
        .unwrap();
        set.enlist(
            &MockProducer::new(early.clone()).with_position(-5),
            early.clone(),
            &uids,
            30,
        )
        .unwrap();

        let names: Vec<_> = set
            .branches(Order::Natural)
            .iter()
            .map(|branch| branch.unique_name().to_string())
            .collect();
        assert_eq!(names, vec!["early", "late"]);
        assert_eq!(
            set.unique_names().into_iter().collect::<Vec<_>>(),
            vec!["early", "late"]
        );
    }
}
