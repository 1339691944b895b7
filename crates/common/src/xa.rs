//! The XA resource-manager contract
//!
//! Every transactional resource enlisted in a global transaction is driven
//! through `XaResource`. The coordinator never cares how a resource handle was
//! obtained (pooling, driver wrapping), only about this contract.

use crate::xid::Xid;
use std::fmt;
use thiserror::Error;

/// Result type for resource-manager calls
pub type XaResult<T> = std::result::Result<T, XaError>;

/// Flags passed to `start`, `end` and `recover`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XaFlags(i32);

impl XaFlags {
    pub const NONE: XaFlags = XaFlags(0);
    pub const JOIN: XaFlags = XaFlags(0x0020_0000);
    pub const END_RSCAN: XaFlags = XaFlags(0x0080_0000);
    pub const START_RSCAN: XaFlags = XaFlags(0x0100_0000);
    pub const SUSPEND: XaFlags = XaFlags(0x0200_0000);
    pub const SUCCESS: XaFlags = XaFlags(0x0400_0000);
    pub const RESUME: XaFlags = XaFlags(0x0800_0000);
    pub const FAIL: XaFlags = XaFlags(0x2000_0000);
    pub const ONE_PHASE: XaFlags = XaFlags(0x4000_0000);

    pub const fn bits(self) -> i32 {
        self.0
    }

    pub const fn from_bits(bits: i32) -> Self {
        XaFlags(bits)
    }

    pub const fn contains(self, other: XaFlags) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub const fn union(self, other: XaFlags) -> Self {
        XaFlags(self.0 | other.0)
    }
}

/// A branch's answer to `prepare`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// Ready to commit, phase 2 required
    Ok,
    /// No updates, no phase 2 call needed
    ReadOnly,
}

/// Closed set of XA error codes a resource manager can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XaErrorCode {
    /// XA_RBROLLBACK
    RbRollback,
    /// XA_RBCOMMFAIL
    RbCommFail,
    /// XA_RBDEADLOCK
    RbDeadlock,
    /// XA_RBINTEGRITY
    RbIntegrity,
    /// XA_RBOTHER
    RbOther,
    /// XA_RBPROTO
    RbProto,
    /// XA_RBTIMEOUT
    RbTimeout,
    /// XA_RBTRANSIENT
    RbTransient,
    /// XA_NOMIGRATE
    NoMigrate,
    /// XA_HEURHAZ
    HeurHaz,
    /// XA_HEURCOM
    HeurCom,
    /// XA_HEURRB
    HeurRb,
    /// XA_HEURMIX
    HeurMix,
    /// XA_RETRY
    Retry,
    /// XA_RDONLY
    RdOnly,
    /// XAER_ASYNC
    Async,
    /// XAER_RMERR
    RmErr,
    /// XAER_NOTA
    Nota,
    /// XAER_INVAL
    Inval,
    /// XAER_PROTO
    Proto,
    /// XAER_RMFAIL
    RmFail,
    /// XAER_DUPID
    DupId,
    /// XAER_OUTSIDE
    Outside,
}

impl XaErrorCode {
    /// Numeric code as defined by X/Open XA
    pub fn code(self) -> i32 {
        match self {
            XaErrorCode::RbRollback => 100,
            XaErrorCode::RbCommFail => 101,
            XaErrorCode::RbDeadlock => 102,
            XaErrorCode::RbIntegrity => 103,
            XaErrorCode::RbOther => 104,
            XaErrorCode::RbProto => 105,
            XaErrorCode::RbTimeout => 106,
            XaErrorCode::RbTransient => 107,
            XaErrorCode::NoMigrate => 9,
            XaErrorCode::HeurHaz => 8,
            XaErrorCode::HeurCom => 7,
            XaErrorCode::HeurRb => 6,
            XaErrorCode::HeurMix => 5,
            XaErrorCode::Retry => 4,
            XaErrorCode::RdOnly => 3,
            XaErrorCode::Async => -2,
            XaErrorCode::RmErr => -3,
            XaErrorCode::Nota => -4,
            XaErrorCode::Inval => -5,
            XaErrorCode::Proto => -6,
            XaErrorCode::RmFail => -7,
            XaErrorCode::DupId => -8,
            XaErrorCode::Outside => -9,
        }
    }

    /// Map a numeric code back to the enumeration
    pub fn from_code(code: i32) -> Option<Self> {
        let value = match code {
            100 => XaErrorCode::RbRollback,
            101 => XaErrorCode::RbCommFail,
            102 => XaErrorCode::RbDeadlock,
            103 => XaErrorCode::RbIntegrity,
            104 => XaErrorCode::RbOther,
            105 => XaErrorCode::RbProto,
            106 => XaErrorCode::RbTimeout,
            107 => XaErrorCode::RbTransient,
            9 => XaErrorCode::NoMigrate,
            8 => XaErrorCode::HeurHaz,
            7 => XaErrorCode::HeurCom,
            6 => XaErrorCode::HeurRb,
            5 => XaErrorCode::HeurMix,
            4 => XaErrorCode::Retry,
            3 => XaErrorCode::RdOnly,
            -2 => XaErrorCode::Async,
            -3 => XaErrorCode::RmErr,
            -4 => XaErrorCode::Nota,
            -5 => XaErrorCode::Inval,
            -6 => XaErrorCode::Proto,
            -7 => XaErrorCode::RmFail,
            -8 => XaErrorCode::DupId,
            -9 => XaErrorCode::Outside,
            _ => return None,
        };
        Some(value)
    }

    /// One of the XA_RB* codes: the branch has been rolled back
    pub fn is_rollback(self) -> bool {
        (100..=107).contains(&self.code())
    }

    /// One of the XA_HEUR* codes
    pub fn is_heuristic(self) -> bool {
        matches!(
            self,
            XaErrorCode::HeurHaz | XaErrorCode::HeurCom | XaErrorCode::HeurRb | XaErrorCode::HeurMix
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            XaErrorCode::RbRollback => "XA_RBROLLBACK",
            XaErrorCode::RbCommFail => "XA_RBCOMMFAIL",
            XaErrorCode::RbDeadlock => "XA_RBDEADLOCK",
            XaErrorCode::RbIntegrity => "XA_RBINTEGRITY",
            XaErrorCode::RbOther => "XA_RBOTHER",
            XaErrorCode::RbProto => "XA_RBPROTO",
            XaErrorCode::RbTimeout => "XA_RBTIMEOUT",
            XaErrorCode::RbTransient => "XA_RBTRANSIENT",
            XaErrorCode::NoMigrate => "XA_NOMIGRATE",
            XaErrorCode::HeurHaz => "XA_HEURHAZ",
            XaErrorCode::HeurCom => "XA_HEURCOM",
            XaErrorCode::HeurRb => "XA_HEURRB",
            XaErrorCode::HeurMix => "XA_HEURMIX",
            XaErrorCode::Retry => "XA_RETRY",
            XaErrorCode::RdOnly => "XA_RDONLY",
            XaErrorCode::Async => "XAER_ASYNC",
            XaErrorCode::RmErr => "XAER_RMERR",
            XaErrorCode::Nota => "XAER_NOTA",
            XaErrorCode::Inval => "XAER_INVAL",
            XaErrorCode::Proto => "XAER_PROTO",
            XaErrorCode::RmFail => "XAER_RMFAIL",
            XaErrorCode::DupId => "XAER_DUPID",
            XaErrorCode::Outside => "XAER_OUTSIDE",
        }
    }
}

impl fmt::Display for XaErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Failure reported by a resource manager
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct XaError {
    pub code: XaErrorCode,
    pub message: String,
}

impl XaError {
    pub fn new(code: XaErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Contract of an XA resource manager as seen by one live connection
pub trait XaResource: Send + Sync {
    /// Start work on behalf of a branch
    fn start(&self, xid: &Xid, flags: XaFlags) -> XaResult<()>;

    /// End work on behalf of a branch (`SUCCESS`, `FAIL` or `SUSPEND`)
    fn end(&self, xid: &Xid, flags: XaFlags) -> XaResult<()>;

    /// Ask the resource manager to prepare the branch
    fn prepare(&self, xid: &Xid) -> XaResult<Vote>;

    /// Commit the branch, in one phase when `one_phase` is set
    fn commit(&self, xid: &Xid, one_phase: bool) -> XaResult<()>;

    /// Roll the branch back
    fn rollback(&self, xid: &Xid) -> XaResult<()>;

    /// Forget a heuristically completed branch
    fn forget(&self, xid: &Xid) -> XaResult<()>;

    /// List prepared or heuristically completed branches
    fn recover(&self, flags: XaFlags) -> XaResult<Vec<Xid>>;

    /// Whether `other` is connected to the same resource manager
    fn is_same_rm(&self, other: &dyn XaResource) -> XaResult<bool>;

    /// Current branch timeout in seconds
    fn transaction_timeout(&self) -> XaResult<u32>;

    /// Set the branch timeout; returns false when the resource doesn't support it
    fn set_transaction_timeout(&self, seconds: u32) -> XaResult<bool>;
}
