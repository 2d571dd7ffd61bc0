//! Storage trait abstraction.

use async_trait::async_trait;
use tally_core::{CalendarDay, CatalogItem, CompletionEntry, ItemId, ItemKind};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A multi-step write could not be committed
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Named key-value slots holding opaque payloads.
///
/// The progress engine keeps its table snapshot in one slot.
#[async_trait]
pub trait SnapshotSlot: Send + Sync {
    /// Read a slot. Missing slots are `None`.
    async fn read_slot(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the slot contents.
    async fn write_slot(&self, name: &str, payload: &[u8]) -> Result<()>;

    /// Remove the slot. Clearing a missing slot succeeds.
    async fn clear_slot(&self, name: &str) -> Result<()>;
}

/// Durable one-row-per-day completion history.
#[async_trait]
pub trait CompletionStore: Send + Sync {
    /// Entries recorded for `(item, day)`. Normally zero or one.
    async fn entries(&self, item: &ItemId, day: CalendarDay) -> Result<Vec<CompletionEntry>>;

    /// Atomically delete every entry for `(item, day)` and insert one entry
    /// holding `amount`.
    async fn replace_entries(
        &self,
        item: &ItemId,
        day: CalendarDay,
        amount: u64,
    ) -> Result<CompletionEntry>;

    /// All entries of an item, oldest day first.
    async fn history(&self, item: &ItemId) -> Result<Vec<CompletionEntry>>;
}

/// The item catalog, as far as the engine needs it.
#[async_trait]
pub trait ItemCatalog: Send + Sync {
    /// Save an item (create or update).
    async fn register_item(&self, item: &CatalogItem) -> Result<()>;

    /// Load an item by ID.
    async fn load_item(&self, id: &ItemId) -> Result<Option<CatalogItem>>;

    /// List all items.
    async fn list_items(&self) -> Result<Vec<CatalogItem>>;

    /// Delete an item. Returns false if it did not exist.
    async fn remove_item(&self, id: &ItemId) -> Result<bool>;

    /// Kind of a registered item.
    async fn kind_of(&self, id: &ItemId) -> Result<Option<ItemKind>> {
        Ok(self.load_item(id).await?.map(|item| item.kind))
    }
}

/// Reject slot names that could escape the storage root.
pub(crate) fn check_slot_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(StorageError::Other(format!("invalid slot name: {name:?}")))
    }
}
