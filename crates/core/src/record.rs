//! Per-item accrual state.

use crate::id::ItemId;
use crate::Time;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// The in-memory table of every tracked item.
pub type ProgressTable = HashMap<ItemId, ProgressRecord>;

/// Point-in-time amounts for every item, ordered by id.
pub type TableView = BTreeMap<ItemId, ItemProgress>;

/// Accrual state of a single item.
///
/// `is_accruing` is true exactly when `accrual_started_at` is set. All
/// mutators take the current time explicitly so callers decide which clock
/// drives them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressRecord {
    accumulated_amount: u64,
    is_accruing: bool,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    accrual_started_at: Option<Time>,
}

impl ProgressRecord {
    /// Create an idle record holding `amount`.
    pub fn new(amount: u64) -> Self {
        Self {
            accumulated_amount: amount,
            is_accruing: false,
            accrual_started_at: None,
        }
    }

    /// Create a record that has been accruing since `started_at`.
    pub fn accruing_since(amount: u64, started_at: Time) -> Self {
        Self {
            accumulated_amount: amount,
            is_accruing: true,
            accrual_started_at: Some(started_at),
        }
    }

    /// Amount folded so far, excluding any running accrual.
    pub fn accumulated_amount(&self) -> u64 {
        self.accumulated_amount
    }

    /// Whether the record is currently accruing time.
    pub fn is_accruing(&self) -> bool {
        self.is_accruing
    }

    /// When the running accrual started.
    pub fn accrual_started_at(&self) -> Option<Time> {
        self.accrual_started_at
    }

    /// Whole seconds accrued since `accrual_started_at`, zero if idle or if
    /// the clock went backwards.
    pub fn elapsed(&self, now: Time) -> u64 {
        match self.accrual_started_at {
            Some(started) => (now - started).num_seconds().max(0) as u64,
            None => 0,
        }
    }

    /// Accumulated amount plus any running accrual.
    pub fn current_amount(&self, now: Time) -> u64 {
        self.accumulated_amount.saturating_add(self.elapsed(now))
    }

    /// Fold elapsed whole seconds into the accumulated amount. The start
    /// moves forward by exactly the folded seconds, so a partial second
    /// keeps running.
    pub fn fold(&mut self, now: Time) {
        let Some(started) = self.accrual_started_at else {
            return;
        };
        let folded = self.elapsed(now);
        if folded == 0 {
            return;
        }
        self.accumulated_amount = self.accumulated_amount.saturating_add(folded);
        self.accrual_started_at = Some(started + Duration::seconds(folded as i64));
    }

    /// Apply a signed delta after folding; the result floors at zero.
    pub fn add(&mut self, delta: i64, now: Time) -> u64 {
        self.fold(now);
        self.accumulated_amount = if delta >= 0 {
            self.accumulated_amount.saturating_add(delta as u64)
        } else {
            self.accumulated_amount.saturating_sub(delta.unsigned_abs())
        };
        self.accumulated_amount
    }

    /// Begin accruing. Returns false when already accruing, leaving the
    /// original start time in place.
    pub fn start(&mut self, now: Time) -> bool {
        if self.is_accruing {
            return false;
        }
        self.is_accruing = true;
        self.accrual_started_at = Some(now);
        true
    }

    /// Fold and stop accruing. Returns false when the record was idle.
    pub fn stop(&mut self, now: Time) -> bool {
        if !self.is_accruing {
            return false;
        }
        self.fold(now);
        self.is_accruing = false;
        self.accrual_started_at = None;
        true
    }

    /// Zero the amount. A running accrual keeps running from `now`.
    pub fn reset(&mut self, now: Time) {
        self.accumulated_amount = 0;
        if self.is_accruing {
            self.accrual_started_at = Some(now);
        }
    }

    /// Restore the accrual invariant on records read from outside.
    ///
    /// An accruing record without a start time restarts at `now`; an idle
    /// record carrying a stale start time drops it. Returns true if anything
    /// changed.
    pub fn normalize(&mut self, now: Time) -> bool {
        match (self.is_accruing, self.accrual_started_at) {
            (true, None) => {
                self.accrual_started_at = Some(now);
                true
            }
            (false, Some(_)) => {
                self.accrual_started_at = None;
                true
            }
            _ => false,
        }
    }

    /// Read-only view at `now`.
    pub fn progress(&self, now: Time) -> ItemProgress {
        ItemProgress {
            amount: self.current_amount(now),
            is_accruing: self.is_accruing,
        }
    }
}

/// Derived amount of an item at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemProgress {
    /// Current amount including running accrual
    pub amount: u64,
    /// Whether the item is accruing
    pub is_accruing: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn t(secs: i64) -> Time {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_idle_amount_is_accumulated() {
        let record = ProgressRecord::new(7);
        assert_eq!(record.current_amount(t(100)), 7);
        assert!(!record.is_accruing());
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut record = ProgressRecord::new(0);
        assert!(record.start(t(0)));
        assert!(!record.start(t(30)));
        assert_eq!(record.accrual_started_at(), Some(t(0)));
    }

    #[test]
    fn test_fold_add_stop() {
        let mut record = ProgressRecord::new(10);
        record.start(t(0));
        assert_eq!(record.add(5, t(4)), 19);
        assert_eq!(record.accrual_started_at(), Some(t(4)));
        assert!(record.stop(t(6)));
        assert_eq!(record.accumulated_amount(), 21);
        assert_eq!(record.current_amount(t(500)), 21);
        assert_eq!(record.accrual_started_at(), None);
    }

    #[test]
    fn test_fold_keeps_partial_second() {
        let mut record = ProgressRecord::new(0);
        record.start(t(0));

        let mid = t(1) + Duration::milliseconds(600);
        assert_eq!(record.add(0, mid), 1);
        assert_eq!(record.accrual_started_at(), Some(t(1)));
        assert_eq!(record.current_amount(t(2)), 2);

        record.add(0, t(2) + Duration::milliseconds(700));
        assert!(record.stop(t(3)));
        assert_eq!(record.accumulated_amount(), 3);
    }

    #[test]
    fn test_negative_delta_floors_at_zero() {
        let mut record = ProgressRecord::new(3);
        assert_eq!(record.add(-5, t(0)), 0);
        assert_eq!(record.add(i64::MIN, t(0)), 0);
        assert_eq!(record.add(2, t(0)), 2);
    }

    #[test]
    fn test_reset_keeps_accrual_running() {
        let mut record = ProgressRecord::new(0);
        record.start(t(0));
        record.reset(t(50));
        assert!(record.is_accruing());
        assert_eq!(record.current_amount(t(50)), 0);
        assert_eq!(record.current_amount(t(53)), 3);
    }

    #[test]
    fn test_clock_going_backwards_accrues_nothing() {
        let record = ProgressRecord::accruing_since(4, t(10));
        assert_eq!(record.current_amount(t(10) - Duration::seconds(5)), 4);
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let mut record = ProgressRecord::new(2);
        assert!(!record.stop(t(9)));
        assert_eq!(record.accumulated_amount(), 2);
    }

    #[test]
    fn test_normalize_repairs_invariant() {
        let mut broken: ProgressRecord = serde_json::from_str(
            r#"{"accumulated_amount":5,"is_accruing":true,"accrual_started_at":null}"#,
        )
        .unwrap();
        assert!(broken.normalize(t(0)));
        assert_eq!(broken.accrual_started_at(), Some(t(0)));

        let mut stale: ProgressRecord = serde_json::from_str(
            r#"{"accumulated_amount":5,"is_accruing":false,"accrual_started_at":1700000000}"#,
        )
        .unwrap();
        assert!(stale.normalize(t(0)));
        assert_eq!(stale.accrual_started_at(), None);
    }

    #[test]
    fn test_serialized_start_is_epoch_seconds() {
        let record = ProgressRecord::accruing_since(1, t(0));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["accrual_started_at"], 1_700_000_000);
        assert_eq!(json["is_accruing"], true);
    }
}
