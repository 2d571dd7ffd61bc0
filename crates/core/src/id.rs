//! Unique identifiers for tracked items.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Error returned when parsing an [`ItemId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ItemIdError {
    /// The id was empty or only whitespace
    #[error("item id must not be empty")]
    Empty,
}

/// Opaque identifier for a trackable item.
///
/// Ids are owned by the item catalog. Freshly registered items get a ULID,
/// but any non-empty string is accepted so ids minted elsewhere keep working.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Generate a new ItemId
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ItemId {
    type Err = ItemIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ItemIdError::Empty);
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(ItemId::new(), ItemId::new());
    }

    #[test]
    fn test_parse_rejects_blank() {
        assert_eq!("  ".parse::<ItemId>(), Err(ItemIdError::Empty));
        assert_eq!("reading".parse::<ItemId>().unwrap().as_str(), "reading");
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = ItemId::from("water");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"water\"");
    }
}
