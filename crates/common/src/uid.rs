//! Global transaction identifiers
//!
//! A `Uid` is laid out as `server id | timestamp (8 bytes) | sequence (4 bytes)`,
//! all big-endian. The same layout is used for branch qualifiers, so every
//! identifier generated by a coordinator can be traced back to the server that
//! created it and the moment it was created.

use crate::clock::MonotonicClock;
use crate::xid::Xid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Longest server id that still lets a `Uid` fit in an XA GTRID (64 bytes)
pub const MAX_SERVER_ID_LENGTH: usize = 51;

const TIMESTAMP_LENGTH: usize = 8;
const SEQUENCE_LENGTH: usize = 4;
const SUFFIX_LENGTH: usize = TIMESTAMP_LENGTH + SEQUENCE_LENGTH;

/// Immutable byte identifier used as GTRID and as branch qualifier
///
/// Ordering is lexicographic over the raw bytes, which for identifiers of the
/// same server sorts by creation timestamp then sequence.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid(Vec<u8>);

impl Uid {
    /// Wrap raw identifier bytes (for deserialization and foreign Xids)
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Server id prefix, if this identifier has the generated layout
    pub fn extract_server_id(&self) -> Option<&[u8]> {
        let end = self.0.len().checked_sub(SUFFIX_LENGTH)?;
        Some(&self.0[..end])
    }

    /// Creation timestamp in milliseconds since the Unix epoch
    pub fn extract_timestamp(&self) -> Option<u64> {
        let start = self.0.len().checked_sub(SUFFIX_LENGTH)?;
        let mut buf = [0u8; TIMESTAMP_LENGTH];
        buf.copy_from_slice(&self.0[start..start + TIMESTAMP_LENGTH]);
        Some(u64::from_be_bytes(buf))
    }

    /// Sequence number assigned by the generator
    pub fn extract_sequence(&self) -> Option<u32> {
        let start = self.0.len().checked_sub(SEQUENCE_LENGTH)?;
        if self.0.len() < SUFFIX_LENGTH {
            return None;
        }
        let mut buf = [0u8; SEQUENCE_LENGTH];
        buf.copy_from_slice(&self.0[start..]);
        Some(u32::from_be_bytes(buf))
    }

    /// Upper-case hexadecimal rendering
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02X}", b)).collect()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self.to_hex())
    }
}

/// Generates GTRIDs and branch Xids for one coordinator
pub struct UidGenerator {
    server_id: Vec<u8>,
    clock: MonotonicClock,
    sequence: AtomicU32,
}

impl UidGenerator {
    /// Create a generator for the given server id
    ///
    /// Server ids longer than `MAX_SERVER_ID_LENGTH` bytes are truncated.
    pub fn new(server_id: &str) -> Self {
        let mut bytes = server_id.as_bytes().to_vec();
        if bytes.len() > MAX_SERVER_ID_LENGTH {
            tracing::warn!(
                "server id '{}' is longer than {} bytes, it will be truncated",
                server_id,
                MAX_SERVER_ID_LENGTH
            );
            bytes.truncate(MAX_SERVER_ID_LENGTH);
        }

        Self {
            server_id: bytes,
            clock: MonotonicClock::new(),
            sequence: AtomicU32::new(0),
        }
    }

    /// The (possibly truncated) server id embedded in every generated `Uid`
    pub fn server_id(&self) -> &[u8] {
        &self.server_id
    }

    /// Generate a new unique identifier
    pub fn generate_uid(&self) -> Uid {
        let timestamp = self.clock.now_millis();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst).wrapping_add(1);

        let mut bytes = Vec::with_capacity(self.server_id.len() + SUFFIX_LENGTH);
        bytes.extend_from_slice(&self.server_id);
        bytes.extend_from_slice(&timestamp.to_be_bytes());
        bytes.extend_from_slice(&sequence.to_be_bytes());
        Uid(bytes)
    }

    /// Generate a new branch of the given global transaction
    pub fn generate_xid(&self, gtrid: &Uid) -> Xid {
        Xid::new(gtrid.clone(), self.generate_uid())
    }
}
