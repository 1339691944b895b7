//! One of the two journal files
//!
//! Header layout (big-endian):
//!
//! ```text
//! format id  i32
//! timestamp  i64   newest header wins the active role
//! state      u8    clean / unclean
//! position   i64   end of the last record written
//! ```

use crate::dangling::collect_dangling;
use crate::error::{JournalError, Result};
use crate::file::ReopenableFile;
use crate::record::LogRecord;
use std::collections::HashMap;
use std::path::Path;
use twophase_common::Uid;

/// Identifies a twophase journal file
pub(crate) const FORMAT_ID: i32 = 0x5450_4A4C;

pub(crate) const HEADER_LENGTH: u64 = 4 + 8 + 1 + 8;

const TIMESTAMP_OFFSET: u64 = 4;
const STATE_OFFSET: u64 = 12;
const POSITION_OFFSET: u64 = 13;

/// Whether the file was closed by a clean shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogState {
    Clean,
    Unclean,
}

impl LogState {
    fn to_byte(self) -> u8 {
        match self {
            LogState::Clean => 0,
            LogState::Unclean => 0xFF,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(LogState::Clean),
            0xFF => Some(LogState::Unclean),
            _ => None,
        }
    }
}

pub(crate) struct LogFile {
    file: ReopenableFile,
    capacity: u64,
    timestamp: i64,
    state: LogState,
    position: u64,
}

impl LogFile {
    /// Open a log file, preallocating and initializing it when new
    pub(crate) fn open(path: &Path, max_size: u64) -> Result<Self> {
        let mut file = ReopenableFile::open(path)?;
        let existing = file.len()?;

        if existing == 0 {
            file.set_len(max_size)?;
            let mut log = Self {
                file,
                capacity: max_size,
                timestamp: 0,
                state: LogState::Clean,
                position: HEADER_LENGTH,
            };
            log.write_header()?;
            log.file.sync()?;
            tracing::debug!("Created journal file {:?} of {} bytes", path, max_size);
            return Ok(log);
        }

        if existing < HEADER_LENGTH {
            return Err(corrupted(path, format!("file of {} bytes has no header", existing)));
        }
        if existing < max_size {
            file.set_len(max_size)?;
        }
        let capacity = existing.max(max_size);

        let mut header = [0u8; HEADER_LENGTH as usize];
        file.read_exact_at(0, &mut header)?;

        let format_id = i32::from_be_bytes(array(&header[0..4]));
        if format_id != FORMAT_ID {
            return Err(corrupted(path, format!("unknown format id {:#010x}", format_id)));
        }
        let timestamp = i64::from_be_bytes(array(&header[4..12]));
        let state = LogState::from_byte(header[12])
            .ok_or_else(|| corrupted(path, format!("invalid state {:#04x}", header[12])))?;
        let position = u64::from_be_bytes(array(&header[13..21]));
        if position < HEADER_LENGTH || position > capacity {
            return Err(corrupted(path, format!("position {} out of bounds", position)));
        }

        Ok(Self {
            file,
            capacity,
            timestamp,
            state,
            position,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        self.file.path()
    }

    pub(crate) fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub(crate) fn state(&self) -> LogState {
        self.state
    }

    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    /// Bytes available for records in an empty file
    pub(crate) fn usable_capacity(&self) -> u64 {
        self.capacity - HEADER_LENGTH
    }

    pub(crate) fn has_room(&self, length: u64) -> bool {
        self.position + length <= self.capacity
    }

    /// Append encoded bytes and advance the header position
    pub(crate) fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let length = bytes.len() as u64;
        if !self.has_room(length) {
            return Err(JournalError::JournalFull {
                needed: length,
                available: self.capacity - self.position,
            });
        }

        self.file.write_all_at(self.position, bytes)?;
        self.position += length;
        self.write_position()
    }

    /// Read every record up to the header position
    ///
    /// The scan ends at the first record that cannot be decoded; the
    /// position is pulled back there so the next append overwrites the torn
    /// bytes. With `skip_corrupted` a record whose framing is intact but whose
    /// content is not is stepped over instead.
    pub(crate) fn read_records(&mut self, skip_corrupted: bool) -> Result<Vec<LogRecord>> {
        let length = (self.position - HEADER_LENGTH) as usize;
        let mut buf = vec![0u8; length];
        self.file.read_exact_at(HEADER_LENGTH, &mut buf)?;

        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset < buf.len() {
            match LogRecord::decode(&buf[offset..]) {
                Ok((record, consumed)) => {
                    records.push(record);
                    offset += consumed;
                }
                Err(e) => match e.skippable_length() {
                    Some(consumed) if skip_corrupted => {
                        tracing::warn!(
                            "Skipping corrupted record at {} in {:?}: {}",
                            HEADER_LENGTH + offset as u64,
                            self.path(),
                            e
                        );
                        offset += consumed;
                    }
                    _ => {
                        tracing::warn!(
                            "Invalid record at {} in {:?}, ignoring the rest of the file: {}",
                            HEADER_LENGTH + offset as u64,
                            self.path(),
                            e
                        );
                        self.position = HEADER_LENGTH + offset as u64;
                        self.write_position()?;
                        break;
                    }
                },
            }
        }

        Ok(records)
    }

    /// Records of this file folded into dangling transactions
    pub(crate) fn dangling(&mut self, skip_corrupted: bool) -> Result<HashMap<Uid, LogRecord>> {
        Ok(collect_dangling(self.read_records(skip_corrupted)?))
    }

    /// Forget every record and take a new header timestamp
    /// Empty the file, keeping its header timestamp
    pub(crate) fn reset(&mut self) -> Result<()> {
        self.position = HEADER_LENGTH;
        self.write_header()
    }

    pub(crate) fn set_state(&mut self, state: LogState) -> Result<()> {
        self.state = state;
        self.file
            .write_all_at(STATE_OFFSET, &[state.to_byte()])
            .map_err(JournalError::from)
    }

    pub(crate) fn set_timestamp(&mut self, timestamp: i64) -> Result<()> {
        self.timestamp = timestamp;
        self.file
            .write_all_at(TIMESTAMP_OFFSET, &timestamp.to_be_bytes())
            .map_err(JournalError::from)
    }

    pub(crate) fn force(&mut self) -> Result<()> {
        self.file.sync().map_err(JournalError::from)
    }

    pub(crate) fn close(&mut self) {
        self.file.close();
    }

    fn write_position(&mut self) -> Result<()> {
        self.file
            .write_all_at(POSITION_OFFSET, &self.position.to_be_bytes())
            .map_err(JournalError::from)
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = Vec::with_capacity(HEADER_LENGTH as usize);
        header.extend_from_slice(&FORMAT_ID.to_be_bytes());
        header.extend_from_slice(&self.timestamp.to_be_bytes());
        header.push(self.state.to_byte());
        header.extend_from_slice(&self.position.to_be_bytes());
        self.file.write_all_at(0, &header).map_err(JournalError::from)
    }
}

fn corrupted(path: &Path, reason: String) -> JournalError {
    JournalError::CorruptedHeader {
        path: path.to_path_buf(),
        reason,
    }
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(bytes);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;
    use twophase_common::TransactionStatus;

    fn record(gtrid: u8, sequence: i32) -> LogRecord {
        LogRecord::new(
            TransactionStatus::Committing,
            1000,
            sequence,
            Uid::from_bytes(vec![gtrid; 4]),
            ["db".to_string()].into_iter().collect::<BTreeSet<_>>(),
        )
    }

    #[test]
    fn test_new_file_is_preallocated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part1");
        let log = LogFile::open(&path, 4096).unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
        assert_eq!(log.position(), HEADER_LENGTH);
        assert_eq!(log.timestamp(), 0);
        assert_eq!(log.state(), LogState::Clean);
    }

    #[test]
    fn test_header_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part1");
        {
            let mut log = LogFile::open(&path, 4096).unwrap();
            log.append(&record(1, 1).encode().unwrap()).unwrap();
            log.set_timestamp(77).unwrap();
            log.set_state(LogState::Unclean).unwrap();
        }

        let mut log = LogFile::open(&path, 4096).unwrap();
        assert_eq!(log.timestamp(), 77);
        assert_eq!(log.state(), LogState::Unclean);
        assert_eq!(log.read_records(false).unwrap(), vec![record(1, 1)]);
    }

    #[test]
    fn test_torn_tail_pulls_position_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part1");
        let mut log = LogFile::open(&path, 4096).unwrap();

        let first = record(1, 1).encode().unwrap();
        let second = record(2, 2).encode().unwrap();
        log.append(&first).unwrap();
        log.append(&second).unwrap();

        // Tear the second record's end marker
        let torn_at = HEADER_LENGTH + (first.len() + second.len() - 1) as u64;
        log.file.write_all_at(torn_at, &[0]).unwrap();

        assert_eq!(log.read_records(false).unwrap(), vec![record(1, 1)]);
        assert_eq!(log.position(), HEADER_LENGTH + first.len() as u64);

        // The next append lands where the torn record was
        log.append(&record(3, 3).encode().unwrap()).unwrap();
        assert_eq!(
            log.read_records(false).unwrap(),
            vec![record(1, 1), record(3, 3)]
        );
    }

    #[test]
    fn test_skip_corrupted_record() {
        let dir = TempDir::new().unwrap();
        let mut log = LogFile::open(&dir.path().join("part1"), 4096).unwrap();

        let first = record(1, 1).encode().unwrap();
        log.append(&first).unwrap();
        log.append(&record(2, 2).encode().unwrap()).unwrap();
        log.append(&record(3, 3).encode().unwrap()).unwrap();

        // Corrupt the second record's gtrid, framing stays intact
        let gtrid_at = HEADER_LENGTH + first.len() as u64 + 25;
        log.file.write_all_at(gtrid_at, &[0xEE]).unwrap();

        assert_eq!(
            log.read_records(true).unwrap(),
            vec![record(1, 1), record(3, 3)]
        );
        assert_eq!(log.read_records(false).unwrap(), vec![record(1, 1)]);
    }

    #[test]
    fn test_append_refused_when_full() {
        let dir = TempDir::new().unwrap();
        let mut log = LogFile::open(&dir.path().join("part1"), HEADER_LENGTH + 40).unwrap();

        let bytes = record(1, 1).encode().unwrap();
        assert!(!log.has_room(bytes.len() as u64));
        assert!(matches!(
            log.append(&bytes),
            Err(JournalError::JournalFull { .. })
        ));
    }

    #[test]
    fn test_foreign_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("part1");
        std::fs::write(&path, vec![0x42u8; 64]).unwrap();

        assert!(matches!(
            LogFile::open(&path, 4096),
            Err(JournalError::CorruptedHeader { .. })
        ));
    }
}
