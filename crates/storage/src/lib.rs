//! Storage abstraction and implementations for Tally.
//!
//! This crate provides trait-based interfaces for the snapshot slot, the
//! durable completion history and the item catalog, with a JSON directory
//! backend, an in-memory backend and an optional SQLite backend.

#![warn(missing_docs)]

pub mod trait_;
pub mod json_storage;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite_storage;

pub use trait_::{CompletionStore, ItemCatalog, Result, SnapshotSlot, StorageError};
pub use json_storage::JsonStorage;
pub use memory::InMemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite_storage::SqliteStorage;
