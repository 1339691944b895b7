//! In-memory XA resource for tests and demos
//!
//! `MockResource` keeps track of the branches it knows about the way a real
//! resource manager would: started branches can be prepared, prepared branches
//! are reported by `recover` until they are committed, rolled back or
//! forgotten. Failures can be injected per operation and every call is
//! recorded.

use crate::registry::ResourceProducer;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use twophase_common::{Vote, XaError, XaErrorCode, XaFlags, XaResource, XaResult, Xid};
use twophase_scheduler::DEFAULT_POSITION;

/// A call received by a [`MockResource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Start(Xid, XaFlags),
    End(Xid, XaFlags),
    Prepare(Xid),
    Commit(Xid, bool),
    Rollback(Xid),
    Forget(Xid),
    Recover(XaFlags),
    SetTransactionTimeout(u32),
}

/// Operations failures can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Start,
    End,
    Prepare,
    Commit,
    Rollback,
    Forget,
    Recover,
}

impl MockOp {
    fn label(self) -> &'static str {
        match self {
            MockOp::Start => "start",
            MockOp::End => "end",
            MockOp::Prepare => "prepare",
            MockOp::Commit => "commit",
            MockOp::Rollback => "rollback",
            MockOp::Forget => "forget",
            MockOp::Recover => "recover",
        }
    }
}

struct MockState {
    calls: Vec<MockCall>,
    failures: HashMap<MockOp, XaErrorCode>,
    delays: HashMap<MockOp, Duration>,
    vote: Vote,
    active: HashSet<Xid>,
    in_doubt: Vec<Xid>,
    timeout: u32,
}

pub struct MockResource {
    name: String,
    state: Mutex<MockState>,
    events: Option<Arc<Mutex<Vec<String>>>>,
}

impl MockResource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MockState {
                calls: Vec::new(),
                failures: HashMap::new(),
                delays: HashMap::new(),
                vote: Vote::Ok,
                active: HashSet::new(),
                in_doubt: Vec::new(),
                timeout: 0,
            }),
            events: None,
        }
    }

    /// Resource appending `"<op> <name>"` to a log shared with other resources
    pub fn with_event_log(name: impl Into<String>, events: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            events: Some(events),
            ..Self::new(name)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_vote(&self, vote: Vote) {
        self.state.lock().vote = vote;
    }

    /// Make every following call of `op` fail with `code`
    pub fn fail_on(&self, op: MockOp, code: XaErrorCode) {
        self.state.lock().failures.insert(op, code);
    }

    pub fn clear_failure(&self, op: MockOp) {
        self.state.lock().failures.remove(&op);
    }

    /// Make every following call of `op` take `delay`
    pub fn set_delay(&self, op: MockOp, delay: Duration) {
        self.state.lock().delays.insert(op, delay);
    }

    /// Pretend a branch was left prepared by a previous run
    pub fn add_in_doubt(&self, xid: Xid) {
        self.state.lock().in_doubt.push(xid);
    }

    /// Branches currently prepared and not yet completed
    pub fn in_doubt(&self) -> Vec<Xid> {
        self.state.lock().in_doubt.clone()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    pub fn prepare_calls(&self) -> Vec<MockCall> {
        self.calls_matching(|call| matches!(call, MockCall::Prepare(_)))
    }

    pub fn commit_calls(&self) -> Vec<MockCall> {
        self.calls_matching(|call| matches!(call, MockCall::Commit(..)))
    }

    pub fn rollback_calls(&self) -> Vec<MockCall> {
        self.calls_matching(|call| matches!(call, MockCall::Rollback(_)))
    }

    pub fn forget_calls(&self) -> Vec<MockCall> {
        self.calls_matching(|call| matches!(call, MockCall::Forget(_)))
    }

    fn calls_matching(&self, predicate: impl Fn(&MockCall) -> bool) -> Vec<MockCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| predicate(call))
            .cloned()
            .collect()
    }

    /// Record the call, then sleep and fail as configured
    fn enter(&self, op: MockOp, call: MockCall) -> XaResult<()> {
        let (delay, failure) = {
            let mut state = self.state.lock();
            state.calls.push(call);
            (
                state.delays.get(&op).copied(),
                state.failures.get(&op).copied(),
            )
        };

        self.record_event(format!("{} {}", op.label(), self.name));
        if let Some(delay) = delay {
            std::thread::sleep(delay);
            self.record_event(format!("{} {} done", op.label(), self.name));
        }

        match failure {
            Some(code) => Err(XaError::new(
                code,
                format!("injected {} failure on {}", op.label(), self.name),
            )),
            None => Ok(()),
        }
    }

    fn record_event(&self, event: String) {
        if let Some(events) = &self.events {
            events.lock().push(event);
        }
    }

    fn complete(&self, xid: &Xid) -> XaResult<()> {
        let mut state = self.state.lock();
        let was_active = state.active.remove(xid);
        let before = state.in_doubt.len();
        state.in_doubt.retain(|known| known != xid);
        if was_active || state.in_doubt.len() != before {
            Ok(())
        } else {
            Err(XaError::new(
                XaErrorCode::Nota,
                format!("{} does not know {}", self.name, xid),
            ))
        }
    }
}

impl XaResource for MockResource {
    fn start(&self, xid: &Xid, flags: XaFlags) -> XaResult<()> {
        self.enter(MockOp::Start, MockCall::Start(xid.clone(), flags))?;
        self.state.lock().active.insert(xid.clone());
        Ok(())
    }

    fn end(&self, xid: &Xid, flags: XaFlags) -> XaResult<()> {
        self.enter(MockOp::End, MockCall::End(xid.clone(), flags))
    }

    fn prepare(&self, xid: &Xid) -> XaResult<Vote> {
        self.enter(MockOp::Prepare, MockCall::Prepare(xid.clone()))?;
        let mut state = self.state.lock();
        if !state.active.remove(xid) {
            return Err(XaError::new(
                XaErrorCode::Nota,
                format!("{} does not know {}", self.name, xid),
            ));
        }
        if state.vote == Vote::Ok {
            state.in_doubt.push(xid.clone());
        }
        Ok(state.vote)
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> XaResult<()> {
        self.enter(MockOp::Commit, MockCall::Commit(xid.clone(), one_phase))?;
        self.complete(xid)
    }

    fn rollback(&self, xid: &Xid) -> XaResult<()> {
        self.enter(MockOp::Rollback, MockCall::Rollback(xid.clone()))?;
        self.complete(xid)
    }

    fn forget(&self, xid: &Xid) -> XaResult<()> {
        self.enter(MockOp::Forget, MockCall::Forget(xid.clone()))?;
        let mut state = self.state.lock();
        state.active.remove(xid);
        state.in_doubt.retain(|known| known != xid);
        Ok(())
    }

    fn recover(&self, flags: XaFlags) -> XaResult<Vec<Xid>> {
        self.enter(MockOp::Recover, MockCall::Recover(flags))?;
        if flags.contains(XaFlags::START_RSCAN) {
            Ok(self.in_doubt())
        } else {
            Ok(Vec::new())
        }
    }

    fn is_same_rm(&self, other: &dyn XaResource) -> XaResult<bool> {
        Ok(std::ptr::addr_eq(self, other))
    }

    fn transaction_timeout(&self) -> XaResult<u32> {
        Ok(self.state.lock().timeout)
    }

    fn set_transaction_timeout(&self, seconds: u32) -> XaResult<bool> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::SetTransactionTimeout(seconds));
        state.timeout = seconds;
        Ok(true)
    }
}

/// Producer handing out a single [`MockResource`]
pub struct MockProducer {
    resource: Arc<MockResource>,
    position: i32,
    emulating: bool,
    tm_join: bool,
    apply_transaction_timeout: bool,
    failed: AtomicBool,
    fail_recovery_start: AtomicBool,
    recovery_starts: AtomicUsize,
    recovery_ends: AtomicUsize,
}

impl MockProducer {
    pub fn new(resource: Arc<MockResource>) -> Self {
        Self {
            resource,
            position: DEFAULT_POSITION,
            emulating: false,
            tm_join: true,
            apply_transaction_timeout: false,
            failed: AtomicBool::new(false),
            fail_recovery_start: AtomicBool::new(false),
            recovery_starts: AtomicUsize::new(0),
            recovery_ends: AtomicUsize::new(0),
        }
    }

    pub fn with_position(mut self, position: i32) -> Self {
        self.position = position;
        self
    }

    pub fn with_emulating(mut self, emulating: bool) -> Self {
        self.emulating = emulating;
        self
    }

    pub fn with_tm_join(mut self, tm_join: bool) -> Self {
        self.tm_join = tm_join;
        self
    }

    pub fn with_apply_transaction_timeout(mut self, apply: bool) -> Self {
        self.apply_transaction_timeout = apply;
        self
    }

    pub fn resource(&self) -> &Arc<MockResource> {
        &self.resource
    }

    /// Make `start_recovery` fail until reset
    pub fn set_fail_recovery_start(&self, fail: bool) {
        self.fail_recovery_start.store(fail, Ordering::SeqCst);
    }

    pub fn recovery_starts(&self) -> usize {
        self.recovery_starts.load(Ordering::SeqCst)
    }

    pub fn recovery_ends(&self) -> usize {
        self.recovery_ends.load(Ordering::SeqCst)
    }
}

impl ResourceProducer for MockProducer {
    fn unique_name(&self) -> &str {
        self.resource.name()
    }

    fn two_pc_ordering_position(&self) -> i32 {
        self.position
    }

    fn use_tm_join(&self) -> bool {
        self.tm_join
    }

    fn apply_transaction_timeout(&self) -> bool {
        self.apply_transaction_timeout
    }

    fn is_emulating(&self) -> bool {
        self.emulating
    }

    fn start_recovery(&self) -> XaResult<Arc<dyn XaResource>> {
        self.recovery_starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_recovery_start.load(Ordering::SeqCst) {
            return Err(XaError::new(
                XaErrorCode::RmFail,
                format!("{} is unreachable", self.resource.name()),
            ));
        }
        Ok(self.resource.clone())
    }

    fn end_recovery(&self) -> XaResult<()> {
        self.recovery_ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_failed(&self, failed: bool) {
        self.failed.store(failed, Ordering::SeqCst);
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn owns(&self, resource: &dyn XaResource) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.resource), resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twophase_common::UidGenerator;

    #[test]
    fn test_prepared_branch_is_recoverable() {
        let uids = UidGenerator::new("node-a");
        let xid = uids.generate_xid(&uids.generate_uid());
        let resource = MockResource::new("db");

        resource.start(&xid, XaFlags::NONE).unwrap();
        resource.end(&xid, XaFlags::SUCCESS).unwrap();
        assert_eq!(resource.prepare(&xid).unwrap(), Vote::Ok);

        assert_eq!(resource.recover(XaFlags::START_RSCAN).unwrap(), vec![xid.clone()]);
        assert!(resource.recover(XaFlags::NONE).unwrap().is_empty());

        resource.commit(&xid, false).unwrap();
        assert!(resource.in_doubt().is_empty());
        assert_eq!(
            resource.rollback(&xid).unwrap_err().code,
            XaErrorCode::Nota
        );
    }

    #[test]
    fn test_read_only_branch_not_kept() {
        let uids = UidGenerator::new("node-a");
        let xid = uids.generate_xid(&uids.generate_uid());
        let resource = MockResource::new("db");
        resource.set_vote(Vote::ReadOnly);

        resource.start(&xid, XaFlags::NONE).unwrap();
        assert_eq!(resource.prepare(&xid).unwrap(), Vote::ReadOnly);
        assert!(resource.in_doubt().is_empty());
    }

    #[test]
    fn test_injected_failure() {
        let uids = UidGenerator::new("node-a");
        let xid = uids.generate_xid(&uids.generate_uid());
        let resource = MockResource::new("db");
        resource.fail_on(MockOp::Start, XaErrorCode::RmErr);

        assert_eq!(
            resource.start(&xid, XaFlags::NONE).unwrap_err().code,
            XaErrorCode::RmErr
        );
        resource.clear_failure(MockOp::Start);
        assert!(resource.start(&xid, XaFlags::NONE).is_ok());
        assert_eq!(resource.calls().len(), 2);
    }

    #[test]
    fn test_producer_owns_its_resource() {
        let producer = MockProducer::new(Arc::new(MockResource::new("db")));
        let stranger = MockResource::new("db");

        assert!(producer.owns(&**producer.resource()));
        assert!(!producer.owns(&stranger));
        assert!(producer.resource().is_same_rm(&**producer.resource()).unwrap());
        assert!(!producer.resource().is_same_rm(&stranger).unwrap());
    }
}
