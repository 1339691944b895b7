//! Phase execution
//!
//! A phase runs one job per participating branch. Branches are grouped by
//! ordering position: the jobs of one position run concurrently on the
//! executor, and the next position only starts once every job of the current
//! one is done. Waits are bounded so the transaction deadline is rechecked
//! between wait cycles.

pub mod commit;
pub mod heuristic;
pub mod prepare;
pub mod rollback;

pub use commit::{CommitPhase, Committer};
pub use heuristic::{Classification, Decision, FailedBranch, FailureKind, aggregate, classify};
pub use prepare::{PreparePhase, Preparer};
pub use rollback::{RollbackPhase, Rollbacker};

use crate::branch::BranchState;
use crate::error::CoordinatorError;
use crate::executor::{Executor, JobError, submit};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use twophase_common::{XaError, XaErrorCode, XaResult};
use twophase_scheduler::{Order, Scheduler};

/// Work a branch performs during a phase
pub type BranchJob<T> = Box<dyn FnOnce() -> XaResult<T> + Send + 'static>;

/// One kind of phase: which branches take part and what they do
pub trait Phase {
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    fn is_participating(&self, branch: &BranchState) -> bool;

    fn make_job(&self, branch: Arc<BranchState>) -> BranchJob<Self::Output>;
}

/// Why a single branch failed a phase
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BranchError {
    #[error("{0}")]
    Xa(#[from] XaError),

    #[error("{0}")]
    Job(#[from] JobError),
}

impl BranchError {
    /// The XA error, if the resource reported one
    pub fn xa(&self) -> Option<&XaError> {
        match self {
            BranchError::Xa(e) => Some(e),
            BranchError::Job(_) => None,
        }
    }
}

/// A failed branch and what went wrong
#[derive(Debug, Clone)]
pub struct BranchFailure {
    pub branch: Arc<BranchState>,
    pub error: BranchError,
}

/// Every failure of one phase execution
#[derive(Debug, Clone)]
pub struct PhaseError {
    pub failures: Vec<BranchFailure>,
    pub timed_out: bool,
}

impl fmt::Display for PhaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} branch(es) failed", self.failures.len())?;
        if self.timed_out {
            write!(f, ", timed out")?;
        }
        Ok(())
    }
}

impl std::error::Error for PhaseError {}

impl PhaseError {
    /// Names of the failing resources, deduplicated
    pub fn unique_names(&self) -> Vec<String> {
        self.failures
            .iter()
            .map(|failure| failure.branch.unique_name().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Outcome of one phase execution
pub struct PhaseReport<T> {
    pub results: Vec<(Arc<BranchState>, T)>,
    pub failures: Vec<BranchFailure>,
    pub timed_out: bool,
}

impl<T> PhaseReport<T> {
    fn new() -> Self {
        Self {
            results: Vec::new(),
            failures: Vec::new(),
            timed_out: false,
        }
    }

    /// Successful results, or every failure if there was any
    pub fn into_result(self) -> Result<Vec<(Arc<BranchState>, T)>, PhaseError> {
        if self.failures.is_empty() && !self.timed_out {
            Ok(self.results)
        } else {
            Err(PhaseError {
                failures: self.failures,
                timed_out: self.timed_out,
            })
        }
    }
}

/// Runs phases over the branches of a transaction
pub struct PhaseEngine {
    executor: Arc<dyn Executor>,
    wait_interval: Duration,
}

impl PhaseEngine {
    pub fn new(executor: Arc<dyn Executor>, wait_interval: Duration) -> Self {
        Self {
            executor,
            wait_interval,
        }
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// Run the phase position by position in the given order
    ///
    /// Every participating branch of every position is attempted unless the
    /// deadline passes, in which case the engine stops waiting and reports a
    /// time-out. Jobs still running are not cancelled.
    pub fn execute_phase<P: Phase>(
        &self,
        branches: &Scheduler<Arc<BranchState>>,
        order: Order,
        phase: &P,
        deadline: Option<Instant>,
    ) -> PhaseReport<P::Output> {
        let mut report = PhaseReport::new();

        'positions: for position in branches.positions(order) {
            let mut handles = Vec::new();
            for branch in branches.at_position(position, order) {
                if !phase.is_participating(branch) {
                    continue;
                }
                tracing::debug!("Executing {} on {}", phase.name(), branch);
                match submit(self.executor.as_ref(), phase.make_job(branch.clone())) {
                    Ok(handle) => handles.push((branch.clone(), handle)),
                    Err(e) => report.failures.push(BranchFailure {
                        branch: branch.clone(),
                        error: e.into(),
                    }),
                }
            }

            for (branch, handle) in handles {
                while !handle.wait_for(self.wait_interval) {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        tracing::warn!(
                            "Transaction timed out during {} while waiting for {}",
                            phase.name(),
                            branch
                        );
                        report.timed_out = true;
                        break 'positions;
                    }
                }

                match handle.take() {
                    Some(Ok(Ok(output))) => report.results.push((branch, output)),
                    Some(Ok(Err(e))) => {
                        tracing::debug!("{} failed on {}: {}", phase.name(), branch, e);
                        report.failures.push(BranchFailure {
                            branch,
                            error: e.into(),
                        });
                    }
                    Some(Err(e)) => {
                        tracing::error!("{} job of {} failed: {}", phase.name(), branch, e);
                        report.failures.push(BranchFailure {
                            branch,
                            error: e.into(),
                        });
                    }
                    None => report.failures.push(BranchFailure {
                        branch,
                        error: JobError::Panicked("job outcome already taken".to_string()).into(),
                    }),
                }
            }
        }

        report
    }

    pub fn shutdown(&self) {
        self.executor.shutdown();
    }
}

/// Result of a commit or rollback phase
#[derive(Debug)]
pub struct CompletionReport {
    /// Names whose every branch reached the decided outcome
    pub resolved_names: BTreeSet<String>,
    /// Error to surface to the caller, if any
    pub failure: Option<CoordinatorError>,
}

/// Classify the failures of a phase 2 and work out what got resolved
///
/// Consistent heuristic outcomes count as resolved; inconsistent ones are
/// reported. Only branches the resource reported an XA_HEUR* code for are
/// forgotten, so hazards and rolled back branches never are. Transient failures are left for recovery without error, except
/// during a one-phase commit where nothing is left prepared for recovery to
/// find.
pub(crate) fn complete_phase_two(
    decision: Decision,
    one_phase: bool,
    all_names: BTreeSet<String>,
    interested: &[Arc<BranchState>],
    report: PhaseReport<()>,
) -> CompletionReport {
    let mut unresolved = BTreeSet::new();
    let mut failed = Vec::new();

    if report.timed_out {
        // Branches never waited for are unresolved
        let seen: Vec<&Arc<BranchState>> = report
            .results
            .iter()
            .map(|(branch, _)| branch)
            .chain(report.failures.iter().map(|failure| &failure.branch))
            .collect();
        for branch in interested {
            if !seen.iter().any(|known| Arc::ptr_eq(known, branch)) {
                unresolved.insert(branch.unique_name().to_string());
            }
        }
    }

    for BranchFailure { branch, error } in report.failures {
        let name = branch.unique_name().to_string();
        let Some(xa) = error.xa() else {
            tracing::error!("Unexpected failure during {} of {}: {}", decision, branch, error);
            unresolved.insert(name.clone());
            failed.push(FailedBranch {
                unique_name: name,
                kind: FailureKind::Unexpected,
                reason: error.to_string(),
            });
            continue;
        };

        if one_phase && decision == Decision::Commit && xa.code.is_rollback() {
            return CompletionReport {
                resolved_names: all_names,
                failure: Some(CoordinatorError::Rollback(format!(
                    "resource {} rolled back the one-phase commit: {}",
                    name, xa
                ))),
            };
        }

        let classification = classify(decision, xa.code);
        match classification {
            Classification::Success => {
                tracing::debug!("{} of {} reported {}, treated as done", decision, branch, xa.code);
            }
            c if c.is_consistent_with(decision) => {
                tracing::info!("{} reported a consistent {}", branch, xa.code);
                forget_heuristic(&branch, xa.code);
            }
            c if c.is_heuristic() => {
                tracing::warn!("{} reported heuristic {} during {}", branch, xa.code, decision);
                forget_heuristic(&branch, xa.code);
                unresolved.insert(name.clone());
                failed.push(FailedBranch {
                    unique_name: name,
                    kind: if c == Classification::HeuristicMixed {
                        FailureKind::Mixed
                    } else {
                        FailureKind::Diverged
                    },
                    reason: xa.to_string(),
                });
            }
            Classification::Hazard => {
                tracing::warn!("{} reported hazard during {}: {}", branch, decision, xa);
                unresolved.insert(name.clone());
                failed.push(FailedBranch {
                    unique_name: name,
                    kind: FailureKind::Hazard,
                    reason: xa.to_string(),
                });
            }
            Classification::TransientRetry if one_phase => {
                tracing::warn!(
                    "{} failed one-phase commit with {}, outcome unknown",
                    branch,
                    xa
                );
                unresolved.insert(name.clone());
                failed.push(FailedBranch {
                    unique_name: name,
                    kind: FailureKind::Hazard,
                    reason: xa.to_string(),
                });
            }
            Classification::TransientRetry => {
                tracing::warn!(
                    "{} failed {} with {}, branch left to recovery",
                    branch,
                    decision,
                    xa
                );
                unresolved.insert(name);
            }
            _ => {
                tracing::error!("{} violated the protocol during {}: {}", branch, decision, xa);
                unresolved.insert(name.clone());
                failed.push(FailedBranch {
                    unique_name: name,
                    kind: FailureKind::Unexpected,
                    reason: xa.to_string(),
                });
            }
        }
    }

    let resolved_names = all_names.difference(&unresolved).cloned().collect();
    CompletionReport {
        resolved_names,
        failure: aggregate(decision, interested.len(), &failed),
    }
}

/// Forget a branch the resource completed heuristically
fn forget_heuristic(branch: &BranchState, code: XaErrorCode) {
    if !code.is_heuristic() {
        return;
    }
    if let Err(e) = branch.resource().forget(branch.xid()) {
        tracing::error!("Cannot forget {}: {}", branch, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{SyncExecutor, ThreadPerJobExecutor};
    use crate::mock::MockResource;
    use parking_lot::Mutex;
    use twophase_common::{Uid, UidGenerator, XaErrorCode};

    struct RecordingPhase {
        log: Arc<Mutex<Vec<String>>>,
        delay: Duration,
        failing: Option<&'static str>,
    }

    impl Phase for RecordingPhase {
        type Output = String;

        fn name(&self) -> &'static str {
            "record"
        }

        fn is_participating(&self, branch: &BranchState) -> bool {
            branch.unique_name() != "skipped"
        }

        fn make_job(&self, branch: Arc<BranchState>) -> BranchJob<String> {
            let log = self.log.clone();
            let delay = self.delay;
            let failing = self.failing;
            Box::new(move || {
                log.lock().push(format!("start {}", branch.unique_name()));
                std::thread::sleep(delay);
                log.lock().push(format!("end {}", branch.unique_name()));
                if failing == Some(branch.unique_name()) {
                    if branch.unique_name() == "panics" {
                        panic!("job exploded");
                    }
                    return Err(XaError::new(XaErrorCode::RmFail, "down"));
                }
                Ok(branch.unique_name().to_string())
            })
        }
    }

    fn branches(entries: &[(&str, i32)]) -> Scheduler<Arc<BranchState>> {
        let uids = UidGenerator::new("node-a");
        let gtrid: Uid = uids.generate_uid();
        let mut scheduler = Scheduler::new();
        for (name, position) in entries {
            let branch = BranchState::new(
                uids.generate_xid(&gtrid),
                Arc::new(MockResource::new(*name)),
                *name,
                *position,
                false,
            );
            scheduler.add(Arc::new(branch), *position);
        }
        scheduler
    }

    fn phase(delay_ms: u64, failing: Option<&'static str>) -> RecordingPhase {
        RecordingPhase {
            log: Arc::new(Mutex::new(Vec::new())),
            delay: Duration::from_millis(delay_ms),
            failing,
        }
    }

    #[test]
    fn test_natural_and_reverse_order() {
        let engine = PhaseEngine::new(Arc::new(SyncExecutor::new()), Duration::from_millis(10));
        let set = branches(&[("a", 0), ("b1", 1), ("b2", 1), ("c", 10)]);

        let natural = phase(0, None);
        let report = engine.execute_phase(&set, Order::Natural, &natural, None);
        let outputs: Vec<_> = report.results.iter().map(|(_, out)| out.clone()).collect();
        assert_eq!(outputs, vec!["a", "b1", "b2", "c"]);

        let reverse = phase(0, None);
        let report = engine.execute_phase(&set, Order::Reverse, &reverse, None);
        let outputs: Vec<_> = report.results.iter().map(|(_, out)| out.clone()).collect();
        assert_eq!(outputs, vec!["c", "b2", "b1", "a"]);
    }

    #[test]
    fn test_non_participating_branches_skipped() {
        let engine = PhaseEngine::new(Arc::new(SyncExecutor::new()), Duration::from_millis(10));
        let set = branches(&[("a", 0), ("skipped", 0)]);

        let report = engine.execute_phase(&set, Order::Natural, &phase(0, None), None);
        assert_eq!(report.results.len(), 1);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_barrier_between_positions() {
        let engine =
            PhaseEngine::new(Arc::new(ThreadPerJobExecutor::new()), Duration::from_millis(5));
        let set = branches(&[("x1", 1), ("x2", 1), ("y", 2)]);
        let recording = phase(150, None);

        let start = Instant::now();
        let report = engine.execute_phase(&set, Order::Natural, &recording, None);
        assert_eq!(report.results.len(), 3);
        // Both jobs of position 1 overlapped
        assert!(start.elapsed() < Duration::from_millis(420));

        let log = recording.log.lock().clone();
        let start_y = log.iter().position(|event| event == "start y").unwrap();
        let end_x1 = log.iter().position(|event| event == "end x1").unwrap();
        let end_x2 = log.iter().position(|event| event == "end x2").unwrap();
        assert!(end_x1 < start_y);
        assert!(end_x2 < start_y);
    }

    #[test]
    fn test_every_branch_attempted_despite_failures() {
        let engine = PhaseEngine::new(Arc::new(SyncExecutor::new()), Duration::from_millis(10));
        let set = branches(&[("a", 0), ("bad", 1), ("c", 2)]);
        let recording = phase(0, Some("bad"));

        let err = engine
            .execute_phase(&set, Order::Natural, &recording, None)
            .into_result()
            .unwrap_err();

        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.unique_names(), vec!["bad"]);
        assert_eq!(
            err.failures[0].error.xa().map(|e| e.code),
            Some(XaErrorCode::RmFail)
        );
        assert_eq!(recording.log.lock().len(), 6);
    }

    #[test]
    fn test_panicking_job_reported_as_branch_failure() {
        let engine =
            PhaseEngine::new(Arc::new(ThreadPerJobExecutor::new()), Duration::from_millis(10));
        let set = branches(&[("panics", 0), ("fine", 0)]);

        let report = engine.execute_phase(&set, Order::Natural, &phase(0, Some("panics")), None);

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].branch.unique_name(), "panics");
        assert!(matches!(
            report.failures[0].error,
            BranchError::Job(JobError::Panicked(_))
        ));
    }

    #[test]
    fn test_deadline_stops_waiting() {
        let engine =
            PhaseEngine::new(Arc::new(ThreadPerJobExecutor::new()), Duration::from_millis(10));
        let set = branches(&[("slow", 0), ("never", 1)]);
        let recording = phase(300, None);

        let deadline = Instant::now() + Duration::from_millis(50);
        let err = engine
            .execute_phase(&set, Order::Natural, &recording, Some(deadline))
            .into_result()
            .unwrap_err();

        assert!(err.timed_out);
        assert!(err.failures.is_empty());
        assert!(!recording
            .log
            .lock()
            .iter()
            .any(|event| event == "start never"));
    }
}
