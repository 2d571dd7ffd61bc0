//! Catalog-side description of a trackable item.

use crate::id::ItemId;
use crate::Time;
use serde::{Deserialize, Serialize};

/// How an item measures progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Discrete count, never accrues time
    Counter,
    /// Elapsed seconds, accrues while running
    Timer,
}

impl ItemKind {
    /// Whether items of this kind accrue wall-clock time.
    pub fn accrues(self) -> bool {
        matches!(self, ItemKind::Timer)
    }

    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Counter => "counter",
            ItemKind::Timer => "timer",
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "counter" | "count" => Ok(ItemKind::Counter),
            "timer" | "time" => Ok(ItemKind::Timer),
            other => Err(format!("unknown item kind: {other}")),
        }
    }
}

/// Minimal catalog record kept by the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    /// Unique identifier
    pub id: ItemId,

    /// Display name
    pub name: String,

    /// Measurement kind
    pub kind: ItemKind,

    /// When the item was registered
    pub created_at: Time,
}

impl CatalogItem {
    /// Create a new catalog item with a fresh id.
    pub fn new(name: impl Into<String>, kind: ItemKind) -> Self {
        Self {
            id: ItemId::new(),
            name: name.into(),
            kind,
            created_at: chrono::Utc::now(),
        }
    }
}
