//! Transaction journal
//!
//! The journal records the coordinator's decisions so that recovery can tell,
//! after a crash, which prepared branches must be committed. Only two kinds of
//! records matter: `COMMITTING`, written (and forced) at the decision point,
//! and `COMMITTED`/`ROLLEDBACK`, written once branches are resolved. A
//! transaction whose `COMMITTING` names are not all resolved is *dangling*.

pub mod config;
pub mod dangling;
pub mod disk;
pub mod error;
mod file;
mod log_file;
pub mod null;
pub mod record;

pub use config::JournalConfig;
pub use dangling::collect_dangling;
pub use disk::DiskJournal;
pub use error::{JournalError, RecordError, Result};
pub use null::NullJournal;
pub use record::LogRecord;

use std::collections::{BTreeSet, HashMap};
use twophase_common::{TransactionStatus, Uid};

/// Durable log of transaction decisions
pub trait Journal: Send + Sync {
    /// Open the journal; opening an already open journal does nothing
    fn open(&self) -> Result<()>;

    /// Close the journal, marking it cleanly shut down
    fn close(&self) -> Result<()>;

    /// Flush written records to stable storage
    fn force(&self) -> Result<()>;

    /// Close the journal, logging instead of returning errors
    fn shutdown(&self);

    /// Append a record for the given transaction and resource names
    fn log(
        &self,
        status: TransactionStatus,
        gtrid: &Uid,
        unique_names: &BTreeSet<String>,
    ) -> Result<()>;

    /// Transactions that were decided but not fully resolved, keyed by GTRID
    fn collect_dangling_records(&self) -> Result<HashMap<Uid, LogRecord>>;
}
