//! Ordering authority for two-phase commit
//!
//! Resources enlisted in a transaction carry an ordering position. The
//! `Scheduler` groups items by position so that the phase engine can run
//! positions one after the other while items sharing a position run
//! concurrently.

mod scheduler;

pub use scheduler::{
    ALWAYS_FIRST_POSITION, ALWAYS_LAST_POSITION, Cursor, DEFAULT_POSITION, Order, Scheduler,
};
