pub mod delta;
pub mod error;
pub mod freeze;
pub mod fulltext;
pub mod fuzzy;
pub mod graph;
pub mod idempotency;
pub mod lock;
pub mod queue;
pub mod tombstone;
pub mod vector;
pub mod version;

pub use error::StorageError;

/// Current Unix time in whole seconds.
pub(crate) fn epoch_secs() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
