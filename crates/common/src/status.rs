//! Transaction status codes
//!
//! The integer codes are the ones written to the journal.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a global transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    Active,
    MarkedRollback,
    Prepared,
    Committed,
    RolledBack,
    Unknown,
    NoTransaction,
    Preparing,
    Committing,
    RollingBack,
}

impl TransactionStatus {
    /// Journal code of this status
    pub fn code(self) -> i32 {
        match self {
            TransactionStatus::Active => 0,
            TransactionStatus::MarkedRollback => 1,
            TransactionStatus::Prepared => 2,
            TransactionStatus::Committed => 3,
            TransactionStatus::RolledBack => 4,
            TransactionStatus::Unknown => 5,
            TransactionStatus::NoTransaction => 6,
            TransactionStatus::Preparing => 7,
            TransactionStatus::Committing => 8,
            TransactionStatus::RollingBack => 9,
        }
    }

    /// Parse a journal code
    pub fn from_code(code: i32) -> Option<Self> {
        let status = match code {
            0 => TransactionStatus::Active,
            1 => TransactionStatus::MarkedRollback,
            2 => TransactionStatus::Prepared,
            3 => TransactionStatus::Committed,
            4 => TransactionStatus::RolledBack,
            5 => TransactionStatus::Unknown,
            6 => TransactionStatus::NoTransaction,
            7 => TransactionStatus::Preparing,
            8 => TransactionStatus::Committing,
            9 => TransactionStatus::RollingBack,
            _ => return None,
        };
        Some(status)
    }

    /// COMMITTED or ROLLEDBACK
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionStatus::Committed | TransactionStatus::RolledBack
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            TransactionStatus::Active => "ACTIVE",
            TransactionStatus::MarkedRollback => "MARKED_ROLLBACK",
            TransactionStatus::Prepared => "PREPARED",
            TransactionStatus::Committed => "COMMITTED",
            TransactionStatus::RolledBack => "ROLLEDBACK",
            TransactionStatus::Unknown => "UNKNOWN",
            TransactionStatus::NoTransaction => "NO_TRANSACTION",
            TransactionStatus::Preparing => "PREPARING",
            TransactionStatus::Committing => "COMMITTING",
            TransactionStatus::RollingBack => "ROLLING_BACK",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
