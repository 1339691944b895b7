//! Integration tests driving transactions through the coordinator

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use twophase_common::{TransactionStatus, Vote, XaErrorCode, XaResource};
use twophase_coordinator::mock::{MockCall, MockOp, MockProducer, MockResource};
use twophase_coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorError, ExecutorKind, ResourceRegistry,
};
use twophase_journal::{DiskJournal, Journal, JournalConfig, NullJournal};

struct Harness {
    coordinator: Coordinator,
    registry: Arc<ResourceRegistry>,
    events: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    fn new(journal: Arc<dyn Journal>) -> Self {
        Self::with_config(CoordinatorConfig::new("node-a"), journal)
    }

    fn with_config(config: CoordinatorConfig, journal: Arc<dyn Journal>) -> Self {
        let registry = Arc::new(ResourceRegistry::new());
        let coordinator = Coordinator::new(config, journal, registry.clone()).unwrap();
        Self {
            coordinator,
            registry,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn resource(&self, name: &str, position: i32) -> Arc<MockProducer> {
        let resource = Arc::new(MockResource::with_event_log(name, self.events.clone()));
        let producer = Arc::new(MockProducer::new(resource).with_position(position));
        self.registry.register(producer.clone()).unwrap();
        producer
    }

    fn events_starting_with(&self, prefix: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.starts_with(prefix) && !event.ends_with("done"))
            .cloned()
            .collect()
    }
}

fn disk_journal(dir: &tempfile::TempDir) -> Arc<DiskJournal> {
    Arc::new(DiskJournal::new(JournalConfig::new(dir.path())))
}

// ============================================================================
// One-phase commit
// ============================================================================

#[test]
fn test_single_resource_commits_in_one_phase() {
    let harness = Harness::new(Arc::new(NullJournal::new()));
    let db = harness.resource("db", 0);

    let tx = harness.coordinator.begin().unwrap();
    tx.enlist(db.resource().clone()).unwrap();
    tx.commit().unwrap();

    assert_eq!(tx.status(), TransactionStatus::Committed);
    assert!(db.resource().prepare_calls().is_empty());
    let commits = db.resource().commit_calls();
    assert_eq!(commits.len(), 1);
    assert!(matches!(&commits[0], MockCall::Commit(xid, true) if xid.global_transaction_id() == tx.gtrid()));
}

#[test]
fn test_one_phase_rollback_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let journal = disk_journal(&dir);
    let harness = Harness::new(journal.clone());
    let db = harness.resource("db", 0);
    db.resource().fail_on(MockOp::Commit, XaErrorCode::RbRollback);

    let tx = harness.coordinator.begin().unwrap();
    tx.enlist(db.resource().clone()).unwrap();
    let err = tx.commit().unwrap_err();

    assert!(matches!(err, CoordinatorError::Rollback(_)));
    assert_eq!(tx.status(), TransactionStatus::RolledBack);
    assert!(journal.collect_dangling_records().unwrap().is_empty());
}

// ============================================================================
// Two-phase commit
// ============================================================================

#[test]
fn test_commit_ordering_by_position() {
    let harness = Harness::new(Arc::new(NullJournal::new()));
    let producers = [
        harness.resource("a", 0),
        harness.resource("b1", 1),
        harness.resource("b2", 1),
        harness.resource("b3", 1),
        harness.resource("c", 10),
    ];

    let tx = harness.coordinator.begin().unwrap();
    for producer in &producers {
        tx.enlist(producer.resource().clone()).unwrap();
    }
    tx.commit().unwrap();

    assert_eq!(
        harness.events_starting_with("prepare"),
        vec!["prepare a", "prepare b1", "prepare b2", "prepare b3", "prepare c"]
    );
    assert_eq!(
        harness.events_starting_with("commit"),
        vec!["commit c", "commit b3", "commit b2", "commit b1", "commit a"]
    );
    for producer in &producers {
        assert!(matches!(
            producer.resource().commit_calls().as_slice(),
            [MockCall::Commit(_, false)]
        ));
    }
}

#[test]
fn test_commit_resolves_journal() {
    let dir = tempfile::tempdir().unwrap();
    let journal = disk_journal(&dir);
    let harness = Harness::new(journal.clone());
    let db = harness.resource("db", 0);
    let mq = harness.resource("mq", 0);

    let tx = harness.coordinator.begin().unwrap();
    tx.enlist(db.resource().clone()).unwrap();
    tx.enlist(mq.resource().clone()).unwrap();
    tx.commit().unwrap();

    assert_eq!(tx.status(), TransactionStatus::Committed);
    assert!(journal.collect_dangling_records().unwrap().is_empty());
    assert!(db.resource().in_doubt().is_empty());
    assert!(mq.resource().in_doubt().is_empty());
}

#[test]
fn test_read_only_resources_skip_phase_two() {
    let dir = tempfile::tempdir().unwrap();
    let journal = disk_journal(&dir);
    let harness = Harness::new(journal.clone());
    let db = harness.resource("db", 0);
    let cache = harness.resource("cache", 0);
    cache.resource().set_vote(Vote::ReadOnly);

    let tx = harness.coordinator.begin().unwrap();
    tx.enlist(db.resource().clone()).unwrap();
    tx.enlist(cache.resource().clone()).unwrap();
    tx.commit().unwrap();

    assert!(cache.resource().commit_calls().is_empty());
    assert_eq!(db.resource().commit_calls().len(), 1);
    assert!(journal.collect_dangling_records().unwrap().is_empty());
}

#[test]
fn test_prepare_failure_rolls_back_everything() {
    let harness = Harness::new(Arc::new(NullJournal::new()));
    let db = harness.resource("db", 0);
    let mq = harness.resource("mq", 1);
    mq.resource().fail_on(MockOp::Prepare, XaErrorCode::RbDeadlock);

    let tx = harness.coordinator.begin().unwrap();
    tx.enlist(db.resource().clone()).unwrap();
    tx.enlist(mq.resource().clone()).unwrap();
    let err = tx.commit().unwrap_err();

    match err {
        CoordinatorError::Rollback(message) => assert!(message.contains("[mq]")),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(tx.status(), TransactionStatus::RolledBack);
    assert_eq!(db.resource().rollback_calls().len(), 1);
    assert!(db.resource().commit_calls().is_empty());
    assert!(db.resource().in_doubt().is_empty());
}

#[test]
fn test_rollback_only_transaction_cannot_commit() {
    let harness = Harness::new(Arc::new(NullJournal::new()));
    let db = harness.resource("db", 0);

    let tx = harness.coordinator.begin().unwrap();
    let handle: Arc<dyn XaResource> = db.resource().clone();
    tx.enlist(handle.clone()).unwrap();
    assert!(tx.delist(&handle, false).unwrap());
    assert_eq!(tx.status(), TransactionStatus::MarkedRollback);

    assert!(matches!(tx.commit(), Err(CoordinatorError::Rollback(_))));
    assert_eq!(tx.status(), TransactionStatus::RolledBack);
    assert_eq!(db.resource().rollback_calls().len(), 1);
}

#[test]
fn test_transient_commit_failure_left_dangling() {
    let dir = tempfile::tempdir().unwrap();
    let journal = disk_journal(&dir);
    let harness = Harness::new(journal.clone());
    let db = harness.resource("db", 0);
    let mq = harness.resource("mq", 0);
    mq.resource().fail_on(MockOp::Commit, XaErrorCode::RmFail);

    let tx = harness.coordinator.begin().unwrap();
    tx.enlist(db.resource().clone()).unwrap();
    tx.enlist(mq.resource().clone()).unwrap();
    tx.commit().unwrap();

    let dangling = journal.collect_dangling_records().unwrap();
    let record = &dangling[tx.gtrid()];
    assert_eq!(record.unique_names(), &BTreeSet::from(["mq".to_string()]));
    assert_eq!(mq.resource().in_doubt().len(), 1);
}

// ============================================================================
// Rollback and heuristics
// ============================================================================

#[test]
fn test_heuristic_commit_during_rollback() {
    let harness = Harness::new(Arc::new(NullJournal::new()));
    let db = harness.resource("db", 0);
    db.resource().fail_on(MockOp::Rollback, XaErrorCode::HeurCom);

    let tx = harness.coordinator.begin().unwrap();
    tx.enlist(db.resource().clone()).unwrap();
    let err = tx.rollback().unwrap_err();

    assert!(matches!(err, CoordinatorError::HeuristicCommit { .. }));
    assert_eq!(err.resources(), ["db"]);
    assert_eq!(db.resource().forget_calls().len(), 1);
    assert_eq!(tx.status(), TransactionStatus::Unknown);
}

#[test]
fn test_heuristic_mixed_during_commit() {
    let harness = Harness::new(Arc::new(NullJournal::new()));
    let db = harness.resource("db", 0);
    let mq = harness.resource("mq", 0);
    mq.resource().fail_on(MockOp::Commit, XaErrorCode::HeurRb);

    let tx = harness.coordinator.begin().unwrap();
    tx.enlist(db.resource().clone()).unwrap();
    tx.enlist(mq.resource().clone()).unwrap();
    let err = tx.commit().unwrap_err();

    match &err {
        CoordinatorError::HeuristicMixed {
            resources, hazard, ..
        } => {
            assert_eq!(resources, &vec!["mq".to_string()]);
            assert!(!hazard);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(mq.resource().forget_calls().len(), 1);
}

#[test]
fn test_mixed_heuristic_during_commit_flags_hazard() {
    let harness = Harness::new(Arc::new(NullJournal::new()));
    let db = harness.resource("db", 0);
    let mq = harness.resource("mq", 0);
    mq.resource().fail_on(MockOp::Commit, XaErrorCode::HeurMix);

    let tx = harness.coordinator.begin().unwrap();
    tx.enlist(db.resource().clone()).unwrap();
    tx.enlist(mq.resource().clone()).unwrap();
    let err = tx.commit().unwrap_err();

    assert!(matches!(
        err,
        CoordinatorError::HeuristicMixed { hazard: true, .. }
    ));
    assert!(err.to_string().contains("(or hazard happened)"));
    assert_eq!(mq.resource().forget_calls().len(), 1);
}

#[test]
fn test_rollback_of_active_transaction() {
    let harness = Harness::new(Arc::new(NullJournal::new()));
    let db = harness.resource("db", 0);
    let mq = harness.resource("mq", 5);

    let tx = harness.coordinator.begin().unwrap();
    tx.enlist(db.resource().clone()).unwrap();
    tx.enlist(mq.resource().clone()).unwrap();
    tx.rollback().unwrap();

    assert_eq!(tx.status(), TransactionStatus::RolledBack);
    assert_eq!(
        harness.events_starting_with("rollback"),
        vec!["rollback mq", "rollback db"]
    );
    assert!(matches!(
        tx.commit(),
        Err(CoordinatorError::InvalidState(_))
    ));
}

// ============================================================================
// Timeouts and executors
// ============================================================================

#[test]
fn test_timed_out_transaction_rolls_back() {
    let harness = Harness::new(Arc::new(NullJournal::new()));
    let db = harness.resource("db", 0);

    let tx = harness
        .coordinator
        .begin_with_timeout(Duration::from_millis(20))
        .unwrap();
    tx.enlist(db.resource().clone()).unwrap();
    std::thread::sleep(Duration::from_millis(40));

    assert!(tx.timed_out());
    assert!(matches!(tx.commit(), Err(CoordinatorError::Rollback(_))));
    assert_eq!(db.resource().rollback_calls().len(), 1);
}

#[test]
fn test_prepare_timeout() {
    let config = CoordinatorConfig::new("node-a")
        .with_executor(ExecutorKind::ThreadPerJob)
        .with_job_wait_interval_ms(10);
    let harness = Harness::with_config(config, Arc::new(NullJournal::new()));
    let slow = harness.resource("slow", 0);
    let db = harness.resource("db", 0);
    slow.resource().set_delay(MockOp::Prepare, Duration::from_millis(400));

    let tx = harness
        .coordinator
        .begin_with_timeout(Duration::from_millis(150))
        .unwrap();
    tx.enlist(slow.resource().clone()).unwrap();
    tx.enlist(db.resource().clone()).unwrap();
    let err = tx.commit().unwrap_err();

    match err {
        CoordinatorError::Rollback(message) => assert!(message.contains("timed out")),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(db.resource().rollback_calls().len(), 1);
    assert!(db.resource().commit_calls().is_empty());
}

#[test]
fn test_parallel_executors_keep_position_barrier() {
    for executor in [ExecutorKind::ThreadPerJob, ExecutorKind::Pooled { threads: 4 }] {
        let config = CoordinatorConfig::new("node-a")
            .with_executor(executor)
            .with_job_wait_interval_ms(5);
        let harness = Harness::with_config(config, Arc::new(NullJournal::new()));
        let x1 = harness.resource("x1", 1);
        let x2 = harness.resource("x2", 1);
        let y = harness.resource("y", 2);
        for producer in [&x1, &x2, &y] {
            producer
                .resource()
                .set_delay(MockOp::Prepare, Duration::from_millis(150));
        }

        let tx = harness.coordinator.begin().unwrap();
        for producer in [&x1, &x2, &y] {
            tx.enlist(producer.resource().clone()).unwrap();
        }
        let start = Instant::now();
        tx.commit().unwrap();
        // Both position-1 prepares overlapped
        assert!(start.elapsed() < Duration::from_millis(420));

        let events = harness.events.lock().clone();
        let position = |event: &str| events.iter().position(|e| e == event).unwrap();
        assert!(position("prepare x1 done") < position("prepare y"));
        assert!(position("prepare x2 done") < position("prepare y"));

        harness.coordinator.shutdown();
    }
}

#[test]
fn test_emulating_resource_prepared_last() {
    let harness = Harness::new(Arc::new(NullJournal::new()));
    let lrc = Arc::new(
        MockProducer::new(Arc::new(MockResource::with_event_log(
            "lrc",
            harness.events.clone(),
        )))
        .with_emulating(true)
        .with_position(-10),
    );
    harness.registry.register(lrc.clone()).unwrap();
    let db = harness.resource("db", 0);

    let tx = harness.coordinator.begin().unwrap();
    tx.enlist(lrc.resource().clone()).unwrap();
    tx.enlist(db.resource().clone()).unwrap();
    tx.commit().unwrap();

    assert_eq!(
        harness.events_starting_with("prepare"),
        vec!["prepare db", "prepare lrc"]
    );
}
