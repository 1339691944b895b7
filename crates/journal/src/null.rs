//! Journal that records nothing

use crate::Journal;
use crate::error::Result;
use crate::record::LogRecord;
use std::collections::{BTreeSet, HashMap};
use twophase_common::{TransactionStatus, Uid};

/// Journal for deployments that don't need crash recovery
///
/// Every operation succeeds and no transaction is ever reported dangling, so
/// recovery run against it only ever rolls back.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullJournal;

impl NullJournal {
    pub fn new() -> Self {
        Self
    }
}

impl Journal for NullJournal {
    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn force(&self) -> Result<()> {
        Ok(())
    }

    fn shutdown(&self) {}

    fn log(
        &self,
        _status: TransactionStatus,
        _gtrid: &Uid,
        _unique_names: &BTreeSet<String>,
    ) -> Result<()> {
        Ok(())
    }

    fn collect_dangling_records(&self) -> Result<HashMap<Uid, LogRecord>> {
        Ok(HashMap::new())
    }
}
