//! Phase 1: prepare

use super::{BranchJob, Phase, PhaseEngine, PhaseError};
use crate::branch::{BranchSet, BranchState};
use crate::error::{CoordinatorError, Result};
use std::sync::Arc;
use std::time::Instant;
use twophase_common::{Vote, XaErrorCode};
use twophase_scheduler::Order;

/// Prepares every non-emulating branch
pub struct PreparePhase;

impl Phase for PreparePhase {
    type Output = Vote;

    fn name(&self) -> &'static str {
        "prepare"
    }

    fn is_participating(&self, branch: &BranchState) -> bool {
        !branch.is_emulating()
    }

    fn make_job(&self, branch: Arc<BranchState>) -> BranchJob<Vote> {
        Box::new(move || branch.resource().prepare(branch.xid()))
    }
}

/// Runs phase 1 and works out which branches need phase 2
pub struct Preparer<'a> {
    engine: &'a PhaseEngine,
    warn_about_zero_resource_transaction: bool,
}

impl<'a> Preparer<'a> {
    pub fn new(engine: &'a PhaseEngine, warn_about_zero_resource_transaction: bool) -> Self {
        Self {
            engine,
            warn_about_zero_resource_transaction,
        }
    }

    /// Prepare the branches and return the *interested* ones
    ///
    /// With a single branch nothing is prepared: it is committed in one phase.
    /// Read-only voters are not interested. Emulating branches are prepared
    /// last, one at a time, once every other branch voted.
    pub fn prepare(
        &self,
        branches: &BranchSet,
        deadline: Option<Instant>,
    ) -> Result<Vec<Arc<BranchState>>> {
        match branches.size() {
            0 => {
                if self.warn_about_zero_resource_transaction {
                    tracing::warn!(
                        "Executing transaction {} with no enlisted resource",
                        branches.gtrid()
                    );
                }
                return Ok(Vec::new());
            }
            1 => {
                tracing::debug!(
                    "One resource enlisted in {}, no prepare needed",
                    branches.gtrid()
                );
                return Ok(branches.branches(Order::Natural));
            }
            _ => {}
        }

        let report =
            self.engine
                .execute_phase(branches.scheduler(), Order::Natural, &PreparePhase, deadline);
        let votes = report.into_result().map_err(prepare_failure)?;

        let mut interested: Vec<Arc<BranchState>> = votes
            .into_iter()
            .filter_map(|(branch, vote)| match vote {
                Vote::Ok => Some(branch),
                Vote::ReadOnly => {
                    tracing::debug!("{} voted read-only", branch);
                    None
                }
            })
            .collect();

        for branch in branches
            .branches(Order::Natural)
            .into_iter()
            .filter(|branch| branch.is_emulating())
        {
            tracing::debug!("Preparing emulating {}", branch);
            match branch.resource().prepare(branch.xid()) {
                Ok(Vote::Ok) => interested.push(branch),
                Ok(Vote::ReadOnly) => tracing::debug!("{} voted read-only", branch),
                Err(e) => {
                    return Err(prepare_failure(PhaseError {
                        failures: vec![super::BranchFailure {
                            branch,
                            error: e.into(),
                        }],
                        timed_out: false,
                    }));
                }
            }
        }

        tracing::debug!(
            "{} of {} branch(es) of {} need phase 2",
            interested.len(),
            branches.size(),
            branches.gtrid()
        );
        Ok(interested)
    }
}

fn prepare_failure(err: PhaseError) -> CoordinatorError {
    if err.timed_out {
        return CoordinatorError::Rollback("transaction timed out during prepare".to_string());
    }

    let unilateral: Vec<String> = err
        .failures
        .iter()
        .filter(|failure| failure.error.xa().is_some_and(|e| e.code == XaErrorCode::Nota))
        .map(|failure| failure.branch.unique_name().to_string())
        .collect();
    if !unilateral.is_empty() {
        return CoordinatorError::HeuristicMixed {
            message: format!(
                "resource(s) [{}] unilaterally finished transaction branch during prepare, \
                 global outcome is unknown",
                unilateral.join(", ")
            ),
            resources: err.unique_names(),
            hazard: false,
        };
    }

    let details: Vec<String> = err
        .failures
        .iter()
        .map(|failure| format!("{}: {}", failure.branch.unique_name(), failure.error))
        .collect();
    CoordinatorError::Rollback(format!(
        "transaction failed during prepare of resource(s) [{}]: {}",
        err.unique_names().join(", "),
        details.join("; ")
    ))
}
