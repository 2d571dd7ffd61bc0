//! Errors raised by durable-storage interactions.
//!
//! In-memory tracking never fails; only the snapshot slot and the
//! completion store can, and none of these errors is fatal.

use tally_core::{CalendarDay, ItemId};
use tally_storage::StorageError;

/// Errors surfaced by persistence and reconciliation.
#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    /// Snapshot write or read failed; retried at the next checkpoint
    #[error("snapshot persistence failed: {0}")]
    TransientPersistence(#[source] StorageError),

    /// Stored snapshot could not be decoded
    #[error("snapshot payload is corrupt: {0}")]
    CorruptSnapshot(String),

    /// The catalog could not be consulted for an item
    #[error("catalog lookup for item {item} failed: {reason}")]
    DurableStoreLookup {
        /// Item being reconciled
        item: ItemId,
        /// Underlying failure
        reason: String,
    },

    /// Completion write failed; the in-memory amount is kept
    #[error("completion write for item {item} on {day} failed: {source}")]
    DurableStoreTransaction {
        /// Item being reconciled
        item: ItemId,
        /// Day being written
        day: CalendarDay,
        /// Underlying failure
        #[source]
        source: StorageError,
    },
}

impl TrackingError {
    /// Whether a later checkpoint may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TrackingError::TransientPersistence(_) | TrackingError::DurableStoreTransaction { .. }
        )
    }
}
