//! XA branch identifiers

use crate::uid::Uid;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Format id carried by every Xid this coordinator generates ("TPC\0")
pub const FORMAT_ID: i32 = 0x5450_4300;

/// Branch identifier: global transaction id plus a branch qualifier
///
/// Two Xids with the same GTRID but different qualifiers are different
/// branches of the same transaction.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    format_id: i32,
    gtrid: Uid,
    bqual: Uid,
}

impl Xid {
    /// Create a branch identifier with this coordinator's format id
    pub fn new(gtrid: Uid, bqual: Uid) -> Self {
        Self::with_format_id(FORMAT_ID, gtrid, bqual)
    }

    /// Create a branch identifier with an arbitrary format id
    pub fn with_format_id(format_id: i32, gtrid: Uid, bqual: Uid) -> Self {
        Self {
            format_id,
            gtrid,
            bqual,
        }
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    pub fn global_transaction_id(&self) -> &Uid {
        &self.gtrid
    }

    pub fn branch_qualifier(&self) -> &Uid {
        &self.bqual
    }

    /// Whether this branch was generated by a twophase coordinator
    pub fn is_own(&self) -> bool {
        self.format_id == FORMAT_ID
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} : {}]", self.gtrid, self.bqual)
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Xid {{ format_id: {:#010x}, gtrid: {}, bqual: {} }}",
            self.format_id, self.gtrid, self.bqual
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branches_of_same_transaction() {
        let gtrid = Uid::from_bytes(vec![1, 2, 3]);
        let a = Xid::new(gtrid.clone(), Uid::from_bytes(vec![9]));
        let b = Xid::new(gtrid.clone(), Uid::from_bytes(vec![8]));

        assert_ne!(a, b);
        assert_eq!(a.global_transaction_id(), b.global_transaction_id());
        assert!(a.is_own());
    }

    #[test]
    fn test_foreign_format_id() {
        let xid = Xid::with_format_id(0x1234, Uid::from_bytes(vec![1]), Uid::from_bytes(vec![2]));
        assert!(!xid.is_own());
        assert_eq!(xid.to_string(), "[01 : 02]");
    }

    #[test]
    fn test_serde_roundtrip() {
        let xid = Xid::new(Uid::from_bytes(vec![1, 2]), Uid::from_bytes(vec![3, 4]));
        let json = serde_json::to_string(&xid).unwrap();
        let parsed: Xid = serde_json::from_str(&json).unwrap();
        assert_eq!(xid, parsed);
    }
}
