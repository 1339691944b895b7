//! Folding records into dangling transactions

use crate::record::LogRecord;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use twophase_common::{TransactionStatus, Uid};

/// Fold records, in log order, into the transactions still awaiting resolution
///
/// `COMMITTING` adds its names to the GTRID's entry, `COMMITTED` and
/// `ROLLEDBACK` remove theirs, and an entry left without names is dropped.
/// Each remaining entry keeps the time and sequence of its first `COMMITTING`
/// record and carries exactly the outstanding names.
pub fn collect_dangling(records: impl IntoIterator<Item = LogRecord>) -> HashMap<Uid, LogRecord> {
    let mut dangling: HashMap<Uid, LogRecord> = HashMap::new();

    for record in records {
        match record.status() {
            TransactionStatus::Committing => match dangling.entry(record.gtrid().clone()) {
                Entry::Occupied(mut entry) => {
                    entry
                        .get_mut()
                        .unique_names_mut()
                        .extend(record.unique_names().iter().cloned());
                }
                Entry::Vacant(entry) => {
                    entry.insert(record);
                }
            },
            TransactionStatus::Committed | TransactionStatus::RolledBack => {
                if let Entry::Occupied(mut entry) = dangling.entry(record.gtrid().clone()) {
                    let names = entry.get_mut().unique_names_mut();
                    for name in record.unique_names() {
                        names.remove(name);
                    }
                    if names.is_empty() {
                        entry.remove();
                    }
                }
            }
            _ => {}
        }
    }

    dangling
}
