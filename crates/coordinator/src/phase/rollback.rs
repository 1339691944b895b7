//! Phase 2: rollback

use super::{BranchJob, CompletionReport, Decision, Phase, PhaseEngine, complete_phase_two};
use crate::branch::{BranchSet, BranchState};
use std::sync::Arc;
use twophase_scheduler::Order;

/// Rolls back every branch
pub struct RollbackPhase;

impl Phase for RollbackPhase {
    type Output = ();

    fn name(&self) -> &'static str {
        "rollback"
    }

    fn is_participating(&self, _branch: &BranchState) -> bool {
        true
    }

    fn make_job(&self, branch: Arc<BranchState>) -> BranchJob<()> {
        Box::new(move || branch.resource().rollback(branch.xid()))
    }
}

pub struct Rollbacker<'a> {
    engine: &'a PhaseEngine,
}

impl<'a> Rollbacker<'a> {
    pub fn new(engine: &'a PhaseEngine) -> Self {
        Self { engine }
    }

    /// Roll back every branch of the transaction, last positions first
    pub fn rollback(&self, branches: &BranchSet) -> CompletionReport {
        let all_names = branches.unique_names();
        let interested = branches.branches(Order::Reverse);
        let report =
            self.engine
                .execute_phase(branches.scheduler(), Order::Reverse, &RollbackPhase, None);

        complete_phase_two(Decision::Rollback, false, all_names, &interested, report)
    }
}
