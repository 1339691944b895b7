//! Classification of phase-2 outcomes

use crate::error::CoordinatorError;
use std::fmt;
use twophase_common::XaErrorCode;

/// Decision the coordinator is applying in phase 2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Commit,
    Rollback,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Commit => f.write_str("commit"),
            Decision::Rollback => f.write_str("rollback"),
        }
    }
}

/// What a resource-manager error means for the branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The branch reached the decided outcome
    Success,
    /// The branch was heuristically committed
    HeuristicCommit,
    /// The branch was heuristically rolled back
    HeuristicRollback,
    /// The branch was partly committed and partly rolled back
    HeuristicMixed,
    /// Nobody can tell which way the branch went
    Hazard,
    /// The resource is unavailable, recovery will retry
    TransientRetry,
    /// The call was invalid for the branch state
    ProtocolViolation,
}

impl Classification {
    /// Whether a heuristic outcome matches the decision
    pub fn is_consistent_with(self, decision: Decision) -> bool {
        matches!(
            (self, decision),
            (Classification::HeuristicCommit, Decision::Commit)
                | (Classification::HeuristicRollback, Decision::Rollback)
        )
    }

    pub fn is_heuristic(self) -> bool {
        matches!(
            self,
            Classification::HeuristicCommit
                | Classification::HeuristicRollback
                | Classification::HeuristicMixed
        )
    }
}

/// Map an error reported by a phase-2 call to its meaning
pub fn classify(decision: Decision, code: XaErrorCode) -> Classification {
    match code {
        XaErrorCode::HeurCom => Classification::HeuristicCommit,
        XaErrorCode::HeurRb => Classification::HeuristicRollback,
        XaErrorCode::HeurMix => Classification::HeuristicMixed,
        XaErrorCode::HeurHaz => Classification::Hazard,

        XaErrorCode::RbRollback
        | XaErrorCode::RbCommFail
        | XaErrorCode::RbDeadlock
        | XaErrorCode::RbIntegrity
        | XaErrorCode::RbOther
        | XaErrorCode::RbProto
        | XaErrorCode::RbTimeout
        | XaErrorCode::RbTransient => match decision {
            Decision::Commit => Classification::HeuristicRollback,
            Decision::Rollback => Classification::Success,
        },

        // The branch is gone: already rolled back, or outcome unknown
        XaErrorCode::Nota => match decision {
            Decision::Commit => Classification::Hazard,
            Decision::Rollback => Classification::Success,
        },

        XaErrorCode::RmFail | XaErrorCode::RmErr | XaErrorCode::Retry => {
            Classification::TransientRetry
        }

        // Branch had nothing to complete
        XaErrorCode::RdOnly => Classification::Success,

        XaErrorCode::NoMigrate
        | XaErrorCode::Async
        | XaErrorCode::Inval
        | XaErrorCode::Proto
        | XaErrorCode::DupId
        | XaErrorCode::Outside => Classification::ProtocolViolation,
    }
}

/// Why a branch counts as not completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Heuristic outcome contradicting the decision
    Diverged,
    /// Heuristic outcome partly contradicting the decision, the rest unknown
    Mixed,
    /// Outcome cannot be determined
    Hazard,
    /// Protocol violation, panic or rejected job
    Unexpected,
}

/// A branch that failed phase 2, by resource name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedBranch {
    pub unique_name: String,
    pub kind: FailureKind,
    pub reason: String,
}

/// Turn the failed branches of a phase 2 into the error to raise
///
/// When every interested branch diverged and none is a hazard, the outcome is
/// uniformly the opposite of the decision. Anything else is mixed. A mixed
/// heuristic branch counts as diverged and raises the hazard flag.
pub fn aggregate(
    decision: Decision,
    interested: usize,
    failures: &[FailedBranch],
) -> Option<CoordinatorError> {
    if failures.is_empty() {
        return None;
    }

    let names_of = |kinds: &[FailureKind]| -> Vec<String> {
        failures
            .iter()
            .filter(|failure| kinds.contains(&failure.kind))
            .map(|failure| failure.unique_name.clone())
            .collect()
    };
    let diverged = names_of(&[FailureKind::Diverged, FailureKind::Mixed]);
    let unexpected = names_of(&[FailureKind::Unexpected]);
    let hazard_names = names_of(&[FailureKind::Hazard]);
    let hazard = !hazard_names.is_empty()
        || failures
            .iter()
            .any(|failure| failure.kind == FailureKind::Mixed);
    let resources: Vec<String> = failures
        .iter()
        .map(|failure| failure.unique_name.clone())
        .collect();

    let opposite = match decision {
        Decision::Commit => "rolled back",
        Decision::Rollback => "committed",
    };

    if diverged.len() == interested && unexpected.is_empty() && !hazard {
        let message = format!(
            "all resource(s) {} improperly unilaterally {}",
            list(&diverged),
            opposite
        );
        return Some(match decision {
            Decision::Commit => CoordinatorError::HeuristicRollback { message, resources },
            Decision::Rollback => CoordinatorError::HeuristicCommit { message, resources },
        });
    }

    let mut parts = Vec::new();
    if !unexpected.is_empty() {
        parts.push(format!(
            "resource(s) {} threw unexpected error",
            list(&unexpected)
        ));
    }
    let mut divergent = diverged;
    divergent.extend(hazard_names);
    if !divergent.is_empty() {
        parts.push(format!(
            "resource(s) {} improperly unilaterally {}{}",
            list(&divergent),
            opposite,
            if hazard { " (or hazard happened)" } else { "" }
        ));
    }

    let done = match decision {
        Decision::Commit => "committed",
        Decision::Rollback => "rolled back",
    };
    let message = format!(
        "transaction partly {}, partly unknown: {}",
        done,
        parts.join(" and ")
    );
    Some(CoordinatorError::HeuristicMixed {
        message,
        resources,
        hazard,
    })
}

fn list(names: &[String]) -> String {
    format!("[{}]", names.join(", "))
}
