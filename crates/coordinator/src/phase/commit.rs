//! Phase 2: commit

use super::{BranchJob, CompletionReport, Decision, Phase, PhaseEngine, complete_phase_two};
use crate::branch::{BranchSet, BranchState};
use std::sync::Arc;
use twophase_scheduler::Order;

/// Commits the interested branches
pub struct CommitPhase {
    one_phase: bool,
    interested: Vec<Arc<BranchState>>,
}

impl CommitPhase {
    pub fn new(one_phase: bool, interested: Vec<Arc<BranchState>>) -> Self {
        Self {
            one_phase,
            interested,
        }
    }
}

impl Phase for CommitPhase {
    type Output = ();

    fn name(&self) -> &'static str {
        if self.one_phase { "one-phase commit" } else { "commit" }
    }

    fn is_participating(&self, branch: &BranchState) -> bool {
        self.interested
            .iter()
            .any(|interested| std::ptr::eq(interested.as_ref(), branch))
    }

    fn make_job(&self, branch: Arc<BranchState>) -> BranchJob<()> {
        let one_phase = self.one_phase;
        Box::new(move || branch.resource().commit(branch.xid(), one_phase))
    }
}

pub struct Committer<'a> {
    engine: &'a PhaseEngine,
}

impl<'a> Committer<'a> {
    pub fn new(engine: &'a PhaseEngine) -> Self {
        Self { engine }
    }

    /// Commit the interested branches, last positions first
    ///
    /// A transaction with a single branch is committed in one phase. Read-only
    /// branches are not called and count as resolved.
    pub fn commit(
        &self,
        branches: &BranchSet,
        interested: &[Arc<BranchState>],
    ) -> CompletionReport {
        let all_names = branches.unique_names();
        if interested.is_empty() {
            return CompletionReport {
                resolved_names: all_names,
                failure: None,
            };
        }

        let one_phase = branches.size() == 1;
        let phase = CommitPhase::new(one_phase, interested.to_vec());
        let report = self
            .engine
            .execute_phase(branches.scheduler(), Order::Reverse, &phase, None);

        complete_phase_two(Decision::Commit, one_phase, all_names, interested, report)
    }
}
