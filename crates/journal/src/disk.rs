//! Two-file rotating disk journal

use crate::Journal;
use crate::config::JournalConfig;
use crate::error::{JournalError, Result};
use crate::log_file::{HEADER_LENGTH, LogFile, LogState};
use crate::record::LogRecord;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use twophase_common::{MonotonicClock, TransactionStatus, Uid};

struct LogFiles {
    active: LogFile,
    passive: LogFile,
    next_sequence: i32,
}

/// Journal writing records to two preallocated files in turn
///
/// Records are appended to the active file. When it cannot hold the next
/// record, the transactions still dangling in it are carried over to the
/// other file, which then becomes active.
pub struct DiskJournal {
    config: JournalConfig,
    max_size: u64,
    files: Mutex<Option<LogFiles>>,
    clock: MonotonicClock,
}

impl DiskJournal {
    pub fn new(config: JournalConfig) -> Self {
        let max_size = config.max_log_size_bytes();
        Self::with_max_size(config, max_size)
    }

    fn with_max_size(config: JournalConfig, max_size: u64) -> Self {
        Self {
            config,
            max_size,
            files: Mutex::new(None),
            clock: MonotonicClock::new(),
        }
    }

    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.files.lock().is_some()
    }

    fn now(&self) -> i64 {
        i64::try_from(self.clock.now_millis()).unwrap_or(i64::MAX)
    }

    fn should_write(&self, status: TransactionStatus) -> bool {
        !self.config.filter_log_status
            || matches!(
                status,
                TransactionStatus::Committing
                    | TransactionStatus::Committed
                    | TransactionStatus::Unknown
            )
    }

    /// Carry the active file's dangling transactions over to the passive one
    /// and swap them
    fn rotate(&self, files: &mut LogFiles, needed: u64) -> Result<()> {
        let dangling = files.active.dangling(self.config.skip_corrupted_logs)?;

        let mut carried: Vec<LogRecord> = dangling
            .into_values()
            .map(|record| {
                LogRecord::new(
                    TransactionStatus::Committing,
                    record.time(),
                    record.sequence(),
                    record.gtrid().clone(),
                    record.unique_names().clone(),
                )
            })
            .collect();
        carried.sort_by_key(|record| (record.time(), record.sequence()));

        let encoded = carried
            .iter()
            .map(|record| record.encode())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let carried_size: u64 = encoded.iter().map(|bytes| bytes.len() as u64).sum();
        let available = files.passive.usable_capacity();
        if carried_size + needed > available {
            return Err(JournalError::JournalFull {
                needed: carried_size + needed,
                available,
            });
        }

        tracing::debug!(
            "Rotating journal from {:?} to {:?}, carrying {} dangling transaction(s)",
            files.active.path(),
            files.passive.path(),
            carried.len()
        );

        write_carried(&mut files.passive, &encoded)?;
        let timestamp = self.now().max(files.active.timestamp() + 1);
        promote(&mut files.passive, timestamp)?;

        files.active.set_state(LogState::Clean)?;
        files.active.force()?;

        std::mem::swap(&mut files.active, &mut files.passive);
        Ok(())
    }
}

/// Write the carried-over records to the passive file
///
/// Its header timestamp stays older than the active file's, so a crash before
/// `promote` reopens the untouched active file.
fn write_carried(passive: &mut LogFile, encoded: &[Vec<u8>]) -> Result<()> {
    passive.reset()?;
    for bytes in encoded {
        passive.append(bytes)?;
    }
    passive.set_state(LogState::Unclean)?;
    passive.force()
}

/// Make the passive file the newest one, once its content is durable
fn promote(passive: &mut LogFile, timestamp: i64) -> Result<()> {
    passive.set_timestamp(timestamp)?;
    passive.force()
}

impl Journal for DiskJournal {
    fn open(&self) -> Result<()> {
        let mut guard = self.files.lock();
        if guard.is_some() {
            tracing::debug!("Journal already open");
            return Ok(());
        }

        if self.max_size <= HEADER_LENGTH {
            return Err(JournalError::InvalidConfig(format!(
                "log file size of {} bytes cannot hold a header",
                self.max_size
            )));
        }

        let part1 = LogFile::open(&self.config.log_part1_filename, self.max_size)?;
        let part2 = LogFile::open(&self.config.log_part2_filename, self.max_size)?;

        let (mut active, passive) = if part2.timestamp() > part1.timestamp() {
            (part2, part1)
        } else {
            (part1, part2)
        };

        if active.timestamp() == 0 {
            active.set_timestamp(self.now())?;
        }
        if active.state() == LogState::Unclean {
            tracing::warn!(
                "Active journal file {:?} is unclean, previous process did not shut down properly",
                active.path()
            );
        }

        // Repairs a torn tail and finds where the sequence left off
        let records = active.read_records(self.config.skip_corrupted_logs)?;
        let next_sequence = records
            .iter()
            .map(|record| record.sequence())
            .max()
            .map_or(1, |sequence| sequence.wrapping_add(1));

        active.set_state(LogState::Unclean)?;
        active.force()?;

        tracing::info!(
            "Opened journal, active file {:?} with {} record(s) up to position {}",
            active.path(),
            records.len(),
            active.position()
        );

        *guard = Some(LogFiles {
            active,
            passive,
            next_sequence,
        });
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.files.lock();
        let Some(mut files) = guard.take() else {
            return Ok(());
        };

        files.active.set_state(LogState::Clean)?;
        files.active.force()?;
        files.passive.force()?;
        files.active.close();
        files.passive.close();

        tracing::info!("Closed journal");
        Ok(())
    }

    fn force(&self) -> Result<()> {
        if !self.config.forced_write_enabled {
            return Ok(());
        }
        let mut guard = self.files.lock();
        let files = guard.as_mut().ok_or(JournalError::NotOpen)?;
        files.active.force()
    }

    fn shutdown(&self) {
        if let Err(e) = self.close() {
            tracing::error!("Error shutting down journal: {}", e);
        }
    }

    fn log(
        &self,
        status: TransactionStatus,
        gtrid: &Uid,
        unique_names: &BTreeSet<String>,
    ) -> Result<()> {
        if !self.should_write(status) {
            return Ok(());
        }

        let mut guard = self.files.lock();
        let files = guard.as_mut().ok_or(JournalError::NotOpen)?;

        let record = LogRecord::new(
            status,
            self.now(),
            files.next_sequence,
            gtrid.clone(),
            unique_names.clone(),
        );
        let bytes = record.encode()?;

        if !files.active.has_room(bytes.len() as u64) {
            self.rotate(files, bytes.len() as u64)?;
        }
        files.active.append(&bytes)?;
        files.next_sequence = files.next_sequence.wrapping_add(1);

        tracing::debug!("Logged {}", record);
        Ok(())
    }

    fn collect_dangling_records(&self) -> Result<HashMap<Uid, LogRecord>> {
        let mut guard = self.files.lock();
        let files = guard.as_mut().ok_or(JournalError::NotOpen)?;
        files.active.dangling(self.config.skip_corrupted_logs)
    }
}

impl Drop for DiskJournal {
    fn drop(&mut self) {
        if self.files.get_mut().is_some() {
            self.shutdown();
        }
    }
}
