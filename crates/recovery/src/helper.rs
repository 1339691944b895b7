//! Recovery scan and single-branch completion

use std::collections::HashSet;
use twophase_common::{XaError, XaErrorCode, XaFlags, XaResource, XaResult, Xid};
use twophase_coordinator::phase::{Classification, Decision, classify};

/// Branches of this coordinator's format the resource reports in doubt
///
/// Scans with `TMSTARTRSCAN`, keeps asking with `TMNOFLAGS` while new Xids
/// come back, then closes the scan with `TMENDRSCAN`.
pub fn recover_xids(resource: &dyn XaResource, unique_name: &str) -> XaResult<Vec<Xid>> {
    let mut seen = HashSet::new();
    let mut own = Vec::new();
    let mut flags = XaFlags::START_RSCAN;

    loop {
        let batch = resource.recover(flags)?;
        flags = XaFlags::NONE;

        let mut new_xids = 0;
        for xid in batch {
            if !seen.insert(xid.clone()) {
                continue;
            }
            new_xids += 1;
            if xid.is_own() {
                own.push(xid);
            } else {
                tracing::debug!(
                    "Skipping {} of resource {}, format id {:#x} is not ours",
                    xid,
                    unique_name,
                    xid.format_id()
                );
            }
        }
        if new_xids == 0 {
            break;
        }
    }

    if let Err(e) = resource.recover(XaFlags::END_RSCAN) {
        tracing::warn!("Cannot end recovery scan of resource {}: {}", unique_name, e);
    }

    tracing::debug!(
        "Resource {} reported {} in-doubt branch(es)",
        unique_name,
        own.len()
    );
    Ok(own)
}

/// Commit an in-doubt branch; returns whether it ended up committed
pub fn commit(resource: &dyn XaResource, xid: &Xid, unique_name: &str) -> bool {
    match resource.commit(xid, false) {
        Ok(()) => {
            tracing::debug!("Committed in-doubt {} of resource {}", xid, unique_name);
            true
        }
        Err(e) if e.code == XaErrorCode::Nota => {
            tracing::debug!(
                "Resource {} no longer knows {}, considering it committed",
                unique_name,
                xid
            );
            true
        }
        Err(e) => complete_failed(resource, xid, unique_name, Decision::Commit, e),
    }
}

/// Roll back an in-doubt branch; returns whether it ended up rolled back
pub fn rollback(resource: &dyn XaResource, xid: &Xid, unique_name: &str) -> bool {
    match resource.rollback(xid) {
        Ok(()) => {
            tracing::debug!("Rolled back in-doubt {} of resource {}", xid, unique_name);
            true
        }
        Err(e) => complete_failed(resource, xid, unique_name, Decision::Rollback, e),
    }
}

fn complete_failed(
    resource: &dyn XaResource,
    xid: &Xid,
    unique_name: &str,
    decision: Decision,
    error: XaError,
) -> bool {
    match classify(decision, error.code) {
        Classification::Success => true,
        c if c.is_consistent_with(decision) => {
            tracing::info!(
                "Resource {} reported {} for {}",
                unique_name,
                error.code,
                xid
            );
            forget_heuristic(resource, xid, unique_name, error.code);
            true
        }
        c if c.is_heuristic() => {
            tracing::error!(
                "Resource {} heuristically diverged on {} of {}: {}",
                unique_name,
                decision,
                xid,
                error
            );
            forget_heuristic(resource, xid, unique_name, error.code);
            false
        }
        Classification::Hazard => {
            tracing::error!(
                "Outcome of {} on resource {} is unknown: {}",
                xid,
                unique_name,
                error
            );
            false
        }
        Classification::TransientRetry => {
            tracing::warn!(
                "Cannot {} {} on resource {}, will retry: {}",
                decision,
                xid,
                unique_name,
                error
            );
            false
        }
        _ => {
            tracing::error!(
                "Resource {} rejected {} of {}: {}",
                unique_name,
                decision,
                xid,
                error
            );
            false
        }
    }
}

/// Only XA_HEUR* outcomes are remembered by the resource
fn forget_heuristic(resource: &dyn XaResource, xid: &Xid, unique_name: &str, code: XaErrorCode) {
    if !code.is_heuristic() {
        return;
    }
    if let Err(e) = resource.forget(xid) {
        tracing::error!("Cannot forget {} on resource {}: {}", xid, unique_name, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twophase_common::{Uid, UidGenerator, Vote};
    use twophase_coordinator::mock::{MockCall, MockOp, MockResource};

    fn prepared(resource: &MockResource, uids: &UidGenerator) -> Xid {
        let xid = uids.generate_xid(&uids.generate_uid());
        resource.start(&xid, XaFlags::NONE).unwrap();
        resource.end(&xid, XaFlags::SUCCESS).unwrap();
        assert_eq!(resource.prepare(&xid).unwrap(), Vote::Ok);
        xid
    }

    #[test]
    fn test_scan_keeps_own_format() {
        let uids = UidGenerator::new("node-a");
        let resource = MockResource::new("db");
        let own = prepared(&resource, &uids);
        let foreign = Xid::with_format_id(
            0x1234,
            Uid::from_bytes(b"other-gtrid".to_vec()),
            Uid::from_bytes(b"other-bqual".to_vec()),
        );
        resource.add_in_doubt(foreign);

        let xids = recover_xids(&resource, "db").unwrap();

        assert_eq!(xids, vec![own]);
        let scans: Vec<MockCall> = resource
            .calls()
            .into_iter()
            .filter(|call| matches!(call, MockCall::Recover(_)))
            .collect();
        assert_eq!(
            scans,
            vec![
                MockCall::Recover(XaFlags::START_RSCAN),
                MockCall::Recover(XaFlags::NONE),
                MockCall::Recover(XaFlags::END_RSCAN),
            ]
        );
    }

    #[test]
    fn test_scan_failure_is_returned() {
        let resource = MockResource::new("db");
        resource.fail_on(MockOp::Recover, XaErrorCode::RmFail);

        assert_eq!(
            recover_xids(&resource, "db").unwrap_err().code,
            XaErrorCode::RmFail
        );
    }

    #[test]
    fn test_commit_outcomes() {
        let uids = UidGenerator::new("node-a");
        let resource = MockResource::new("db");

        let xid = prepared(&resource, &uids);
        assert!(commit(&resource, &xid, "db"));
        // Already gone
        assert!(commit(&resource, &xid, "db"));

        let xid = prepared(&resource, &uids);
        resource.fail_on(MockOp::Commit, XaErrorCode::RmFail);
        assert!(!commit(&resource, &xid, "db"));
        assert!(resource.forget_calls().is_empty());

        resource.fail_on(MockOp::Commit, XaErrorCode::HeurCom);
        assert!(commit(&resource, &xid, "db"));
        assert_eq!(resource.forget_calls().len(), 1);
    }

    #[test]
    fn test_rollback_outcomes() {
        let uids = UidGenerator::new("node-a");
        let resource = MockResource::new("db");

        let xid = prepared(&resource, &uids);
        resource.fail_on(MockOp::Rollback, XaErrorCode::HeurCom);
        assert!(!rollback(&resource, &xid, "db"));
        assert_eq!(resource.forget_calls().len(), 1);

        resource.clear_failure(MockOp::Rollback);
        assert!(rollback(&resource, &xid, "db"));
    }

    #[test]
    fn test_rolled_back_commit_is_not_forgotten() {
        let uids = UidGenerator::new("node-a");
        let resource = MockResource::new("db");

        let xid = prepared(&resource, &uids);
        resource.fail_on(MockOp::Commit, XaErrorCode::RbRollback);
        assert!(!commit(&resource, &xid, "db"));
        assert!(resource.forget_calls().is_empty());
    }
}
