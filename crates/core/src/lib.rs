//! Tally core data models.
//!
//! This crate defines the plain data structures shared by the progress
//! engine, its storage backends and the host application.

#![warn(missing_docs)]

// Identities
mod id;
mod item;

// Progress state
mod record;
mod completion;
mod clock;

// Re-exports
pub use id::*;
pub use item::{CatalogItem, ItemKind};
pub use record::{ProgressRecord, ProgressTable, ItemProgress, TableView};
pub use completion::{CompletionEntry, CalendarDay};
pub use clock::{Clock, SystemClock, ManualClock};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
