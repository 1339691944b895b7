//! Error types for the journal

use std::path::PathBuf;
use thiserror::Error;

/// Failure to encode or decode a single log record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Record truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid record length {0}")]
    InvalidLength(i32),

    #[error("Missing end-of-record marker, found {0:#010x}")]
    BadEndMarker(u32),

    #[error("Malformed record: {0}")]
    Malformed(String),

    #[error("CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch {
        stored: u32,
        computed: u32,
        length: usize,
    },

    #[error("Unknown transaction status {code}")]
    UnknownStatus { code: i32, length: usize },

    #[error("GTRID of {0} bytes does not fit in a record")]
    GtridTooLong(usize),

    #[error("Resource name of {0} bytes does not fit in a record")]
    NameTooLong(usize),
}

impl RecordError {
    /// Size of the record when its framing is intact but its content is not
    ///
    /// Such a record can be stepped over; any other error leaves the reader
    /// unable to tell where the next record starts.
    pub fn skippable_length(&self) -> Option<usize> {
        match self {
            RecordError::CrcMismatch { length, .. } | RecordError::UnknownStatus { length, .. } => {
                Some(*length)
            }
            _ => None,
        }
    }
}

/// Journal errors
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupted header in {path:?}: {reason}")]
    CorruptedHeader { path: PathBuf, reason: String },

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Journal full: {needed} bytes needed, {available} available")]
    JournalFull { needed: u64, available: u64 },

    #[error("Journal is not open")]
    NotOpen,

    #[error("Invalid journal configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for journal operations
pub type Result<T> = std::result::Result<T, JournalError>;
