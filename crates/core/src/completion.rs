//! Durable per-day completion records.

use crate::id::ItemId;
use serde::{Deserialize, Serialize};

/// A calendar day in the user's local time.
pub type CalendarDay = chrono::NaiveDate;

/// Final amount logged for an item on one day.
///
/// The durable store keeps at most one entry per `(item_id, day)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEntry {
    /// Item the entry belongs to
    pub item_id: ItemId,
    /// Day the amount was logged for
    pub day: CalendarDay,
    /// Logged amount
    pub amount: u64,
}

impl CompletionEntry {
    /// Create a new entry.
    pub fn new(item_id: ItemId, day: CalendarDay, amount: u64) -> Self {
        Self { item_id, day, amount }
    }

    /// Whether this entry is keyed by `(item_id, day)`.
    pub fn is_for(&self, item_id: &ItemId, day: CalendarDay) -> bool {
        &self.item_id == item_id && self.day == day
    }
}
