//! The storage engine: sharded record files, in-memory lookup tables, and
//! the append-only change log that makes mutations durable.

mod aol;
mod file;
mod store;

pub use aol::{Aol, Line, Op};
pub use file::{Header, RecordFile, FORMAT_VERSION, HEADER_SIZE};
pub use store::{
    sanitize_key, sanitize_value, FreeSlot, SetOutcome, Slot, Status, Store, StoreOptions,
};

/// Returns the current unix time in seconds.
pub(crate) fn unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
