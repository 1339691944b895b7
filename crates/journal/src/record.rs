//! Log record codec
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! status        i32
//! record length i32   bytes following this field
//! crc32         u32   over status and everything from time to the last name
//! time          i64   milliseconds since the Unix epoch
//! sequence      i32
//! gtrid         u8 length + bytes
//! name count    i32
//! names         u16 length + UTF-8 bytes, each
//! end marker    u32   0x786E7442
//! ```

use crate::error::RecordError;
use std::collections::BTreeSet;
use std::fmt;
use twophase_common::{TransactionStatus, Uid};

/// Marks the end of every record
pub const END_RECORD: u32 = 0x786E_7442;

/// status + record length
const PREFIX_LENGTH: usize = 4 + 4;

/// Shortest possible value of the record length field: crc, time, sequence,
/// empty gtrid, zero name count and the end marker
const MIN_RECORD_LENGTH: usize = 4 + 8 + 4 + 1 + 4 + 4;

/// One journal entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    status: TransactionStatus,
    time: i64,
    sequence: i32,
    gtrid: Uid,
    unique_names: BTreeSet<String>,
}

impl LogRecord {
    pub fn new(
        status: TransactionStatus,
        time: i64,
        sequence: i32,
        gtrid: Uid,
        unique_names: BTreeSet<String>,
    ) -> Self {
        Self {
            status,
            time,
            sequence,
            gtrid,
            unique_names,
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Write timestamp in milliseconds
    pub fn time(&self) -> i64 {
        self.time
    }

    pub fn sequence(&self) -> i32 {
        self.sequence
    }

    pub fn gtrid(&self) -> &Uid {
        &self.gtrid
    }

    pub fn unique_names(&self) -> &BTreeSet<String> {
        &self.unique_names
    }

    pub(crate) fn unique_names_mut(&mut self) -> &mut BTreeSet<String> {
        &mut self.unique_names
    }

    /// Value of the record length field
    pub fn record_length(&self) -> usize {
        MIN_RECORD_LENGTH
            + self.gtrid.len()
            + self
                .unique_names
                .iter()
                .map(|name| 2 + name.len())
                .sum::<usize>()
    }

    /// Total encoded size
    pub fn encoded_length(&self) -> usize {
        PREFIX_LENGTH + self.record_length()
    }

    /// Checksum stored in the encoded record
    pub fn crc32(&self) -> Result<u32, RecordError> {
        let bytes = self.encode()?;
        Ok(checksum(&bytes, self.record_length()))
    }

    /// Serialize the record
    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        let gtrid_length = u8::try_from(self.gtrid.len())
            .map_err(|_| RecordError::GtridTooLong(self.gtrid.len()))?;
        let record_length = self.record_length();
        let length_field = i32::try_from(record_length)
            .map_err(|_| RecordError::InvalidLength(i32::MAX))?;

        let mut buf = Vec::with_capacity(PREFIX_LENGTH + record_length);
        buf.extend_from_slice(&self.status.code().to_be_bytes());
        buf.extend_from_slice(&length_field.to_be_bytes());
        // Placeholder, filled once the body is written
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&self.time.to_be_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.push(gtrid_length);
        buf.extend_from_slice(self.gtrid.as_bytes());

        let count = i32::try_from(self.unique_names.len())
            .map_err(|_| RecordError::Malformed("too many resource names".to_string()))?;
        buf.extend_from_slice(&count.to_be_bytes());
        for name in &self.unique_names {
            let length =
                u16::try_from(name.len()).map_err(|_| RecordError::NameTooLong(name.len()))?;
            buf.extend_from_slice(&length.to_be_bytes());
            buf.extend_from_slice(name.as_bytes());
        }
        buf.extend_from_slice(&END_RECORD.to_be_bytes());

        let crc = checksum(&buf, record_length);
        buf[8..12].copy_from_slice(&crc.to_be_bytes());
        Ok(buf)
    }

    /// Deserialize the record at the start of `bytes`
    ///
    /// Returns the record and the number of bytes it occupies. Framing (length
    /// bounds and end marker) is checked first, then the checksum, and only
    /// then are the fields interpreted.
    pub fn decode(bytes: &[u8]) -> Result<(LogRecord, usize), RecordError> {
        if bytes.len() < PREFIX_LENGTH {
            return Err(RecordError::Truncated {
                needed: PREFIX_LENGTH,
                available: bytes.len(),
            });
        }

        let length_field = read_i32(bytes, 4);
        let record_length = usize::try_from(length_field)
            .ok()
            .filter(|length| *length >= MIN_RECORD_LENGTH)
            .ok_or(RecordError::InvalidLength(length_field))?;
        let total = PREFIX_LENGTH + record_length;
        if bytes.len() < total {
            return Err(RecordError::Truncated {
                needed: total,
                available: bytes.len(),
            });
        }

        let marker = read_u32(bytes, total - 4);
        if marker != END_RECORD {
            return Err(RecordError::BadEndMarker(marker));
        }

        let stored = read_u32(bytes, 8);
        let computed = checksum(bytes, record_length);
        if stored != computed {
            return Err(RecordError::CrcMismatch {
                stored,
                computed,
                length: total,
            });
        }

        let code = read_i32(bytes, 0);
        let status =
            TransactionStatus::from_code(code).ok_or(RecordError::UnknownStatus { code, length: total })?;

        let body_end = total - 4;
        let mut reader = Reader {
            bytes: &bytes[..body_end],
            offset: 12,
        };
        let time = i64::from_be_bytes(reader.take_array()?);
        let sequence = i32::from_be_bytes(reader.take_array()?);
        let [gtrid_length] = reader.take_array::<1>()?;
        let gtrid = Uid::from_bytes(reader.take(usize::from(gtrid_length))?);

        let count = i32::from_be_bytes(reader.take_array()?);
        if count < 0 {
            return Err(RecordError::Malformed(format!("negative name count {}", count)));
        }
        let mut unique_names = BTreeSet::new();
        for _ in 0..count {
            let length = u16::from_be_bytes(reader.take_array()?);
            let raw = reader.take(usize::from(length))?;
            let name = String::from_utf8(raw.to_vec())
                .map_err(|e| RecordError::Malformed(format!("resource name: {}", e)))?;
            unique_names.insert(name);
        }

        if reader.offset != body_end {
            return Err(RecordError::Malformed(format!(
                "{} unread bytes before end marker",
                body_end - reader.offset
            )));
        }

        let record = LogRecord {
            status,
            time,
            sequence,
            gtrid,
            unique_names,
        };
        Ok((record, total))
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "a LogRecord with status={}, gtrid={}, time={}, sequence={}, names={:?}",
            self.status, self.gtrid, self.time, self.sequence, self.unique_names
        )
    }
}

/// CRC32 over the status field and the body up to the end marker
fn checksum(bytes: &[u8], record_length: usize) -> u32 {
    let body_end = PREFIX_LENGTH + record_length - 4;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[0..4]);
    hasher.update(&bytes[12..body_end]);
    hasher.finalize()
}

fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    i32::from_be_bytes(buf)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_be_bytes(buf)
}

/// Bounds-checked cursor over the record body
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, length: usize) -> Result<&'a [u8], RecordError> {
        let end = self.offset + length;
        if end > self.bytes.len() {
            return Err(RecordError::Malformed(format!(
                "field of {} bytes at offset {} overruns the record",
                length, self.offset
            )));
        }
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], RecordError> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }
}
