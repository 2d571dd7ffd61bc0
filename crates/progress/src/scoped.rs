//! Private tracking sessions for days other than today.
//!
//! Editing yesterday's timer must not disturb a live accrual for today, so a
//! session owns its own record and never touches the shared store or the
//! completion store. Whatever it ends with is handed to the caller's
//! callback, and writing it anywhere is the caller's job.

use async_trait::async_trait;
use std::sync::Arc;
use tally_core::{CalendarDay, Clock, ItemId, ItemKind, ProgressRecord};
use tokio::sync::Mutex;
use tracing::debug;

use crate::facade::ProgressTracking;

/// Final state of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedOutcome {
    /// Item the session edited
    pub item: ItemId,
    /// Day the session edited
    pub day: CalendarDay,
    /// Amount at the end of the session
    pub amount: u64,
}

/// Called exactly once when a session ends.
pub type CompletionCallback = Box<dyn FnOnce(ScopedOutcome) + Send>;

/// An isolated accrual session for one item and day.
pub struct ScopedSession {
    item: ItemId,
    day: CalendarDay,
    record: Mutex<ProgressRecord>,
    clock: Arc<dyn Clock>,
    on_complete: Mutex<Option<CompletionCallback>>,
}

impl ScopedSession {
    /// Open a session starting from `initial_amount`.
    pub fn new(
        item: ItemId,
        day: CalendarDay,
        initial_amount: u64,
        clock: Arc<dyn Clock>,
        on_complete: impl FnOnce(ScopedOutcome) + Send + 'static,
    ) -> Self {
        Self {
            item,
            day,
            record: Mutex::new(ProgressRecord::new(initial_amount)),
            clock,
            on_complete: Mutex::new(Some(Box::new(on_complete))),
        }
    }

    /// Item being edited.
    pub fn item(&self) -> &ItemId {
        &self.item
    }

    /// Day being edited.
    pub fn day(&self) -> CalendarDay {
        self.day
    }

    /// Current amount of the session record.
    pub async fn amount(&self) -> u64 {
        self.record.lock().await.current_amount(self.clock.now())
    }

    /// Whether the session record is accruing.
    pub async fn accruing(&self) -> bool {
        self.record.lock().await.is_accruing()
    }

    /// Start accruing.
    pub async fn start(&self) {
        self.record.lock().await.start(self.clock.now());
    }

    /// Stop accruing.
    pub async fn stop(&self) {
        self.record.lock().await.stop(self.clock.now());
    }

    /// Apply a signed delta, flooring at zero.
    pub async fn add(&self, delta: i64) -> u64 {
        self.record.lock().await.add(delta, self.clock.now())
    }

    /// Zero the amount.
    pub async fn reset(&self) {
        self.record.lock().await.reset(self.clock.now());
    }

    /// End the session, stopping any accrual, and report the final amount.
    pub fn finish(mut self) -> u64 {
        self.complete()
    }

    fn complete(&mut self) -> u64 {
        let now = self.clock.now();
        let record = self.record.get_mut();
        record.stop(now);
        let amount = record.accumulated_amount();

        if let Some(callback) = self.on_complete.get_mut().take() {
            debug!("Scoped session for {} on {} ended at {}", self.item, self.day, amount);
            callback(ScopedOutcome {
                item: self.item.clone(),
                day: self.day,
                amount,
            });
        }
        amount
    }

    fn owns(&self, id: &ItemId) -> bool {
        if id != &self.item {
            debug!("Scoped session for {} ignoring call for {}", self.item, id);
            return false;
        }
        true
    }
}

impl Drop for ScopedSession {
    fn drop(&mut self) {
        self.complete();
    }
}

#[async_trait]
impl ProgressTracking for ScopedSession {
    fn kind(&self) -> ItemKind {
        ItemKind::Timer
    }

    async fn current_amount(&self, id: &ItemId) -> u64 {
        if !self.owns(id) {
            return 0;
        }
        self.amount().await
    }

    async fn is_accruing(&self, id: &ItemId) -> bool {
        self.owns(id) && self.accruing().await
    }

    async fn start_accrual(&self, id: &ItemId, _initial_amount: u64) {
        if self.owns(id) {
            self.start().await;
        }
    }

    async fn stop_accrual(&self, id: &ItemId) {
        if self.owns(id) {
            self.stop().await;
        }
    }

    async fn add_amount(&self, id: &ItemId, delta: i64) -> u64 {
        if !self.owns(id) {
            return 0;
        }
        self.add(delta).await
    }

    async fn reset_amount(&self, id: &ItemId) {
        if self.owns(id) {
            self.reset().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Mutex as StdMutex;
    use tally_core::ManualClock;

    fn day() -> CalendarDay {
        CalendarDay::from_ymd_opt(2024, 2, 28).unwrap()
    }

    #[tokio::test]
    async fn test_session_reports_final_amount_once() {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let outcomes = Arc::new(StdMutex::new(Vec::new()));

        let sink = outcomes.clone();
        let session = ScopedSession::new(ItemId::from("run"), day(), 600, clock.clone(), move |outcome| {
            sink.lock().unwrap().push(outcome);
        });

        session.start().await;
        clock.advance(Duration::seconds(30));
        session.add(-100).await;
        clock.advance(Duration::seconds(10));

        assert_eq!(session.finish(), 540);
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0], ScopedOutcome { item: ItemId::from("run"), day: day(), amount: 540 });
    }

    #[tokio::test]
    async fn test_drop_completes_session() {
        let clock = Arc::new(ManualClock::default());
        let reported = Arc::new(StdMutex::new(None));

        let sink = reported.clone();
        let session = ScopedSession::new(ItemId::from("read"), day(), 5, clock, move |outcome| {
            *sink.lock().unwrap() = Some(outcome.amount);
        });
        session.add(2).await;
        drop(session);

        assert_eq!(*reported.lock().unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_calls_for_other_items_are_ignored() {
        let clock = Arc::new(ManualClock::default());
        let session = ScopedSession::new(ItemId::from("read"), day(), 5, clock, |_| {});

        assert_eq!(session.add_amount(&ItemId::from("other"), 9).await, 0);
        assert_eq!(session.current_amount(&ItemId::from("read")).await, 5);
        assert!(!session.is_accruing(&ItemId::from("other")).await);
    }
}
