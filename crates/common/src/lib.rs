//! Common types for the twophase transaction coordinator
//!
//! This crate defines:
//! - Global transaction identifiers and branch qualifiers (`Uid`)
//! - XA branch identifiers (`Xid`)
//! - Transaction status codes as stored in the journal
//! - The XA resource-manager contract every enlisted resource implements

mod clock;
mod status;
mod uid;
mod xa;
mod xid;

pub use clock::MonotonicClock;
pub use status::TransactionStatus;
pub use uid::{MAX_SERVER_ID_LENGTH, Uid, UidGenerator};
pub use xa::{Vote, XaError, XaErrorCode, XaFlags, XaResource, XaResult};
pub use xid::{FORMAT_ID, Xid};
