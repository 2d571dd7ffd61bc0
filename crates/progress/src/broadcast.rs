//! Fan-out of table snapshots to subscribers.
//!
//! Updates travel over a bounded `tokio::sync::broadcast` channel. A
//! subscriber that falls behind loses its oldest updates and is told how many
//! it skipped; it never blocks the publisher or other subscribers.

use std::sync::Arc;
use tally_core::{ItemId, TableView, Time};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Why an update was emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCause {
    /// An explicit tracking call changed this item
    Mutation(ItemId),
    /// The timer observed accrual drift
    Tick,
    /// The table was replaced or re-announced (restore, resume, rollover)
    Refresh,
}

/// Read-only copy of the table at one instant.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Why this update was sent
    pub cause: UpdateCause,
    /// When the amounts were computed
    pub emitted_at: Time,
    /// Amounts of every item
    pub items: Arc<TableView>,
}

impl ProgressUpdate {
    /// Amount of one item in this update, 0 if absent.
    pub fn amount(&self, id: &ItemId) -> u64 {
        self.items.get(id).map_or(0, |p| p.amount)
    }

    /// Whether an item was accruing in this update.
    pub fn is_accruing(&self, id: &ItemId) -> bool {
        self.items.get(id).is_some_and(|p| p.is_accruing)
    }
}

/// Result of a drift emission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftOutcome {
    /// The update went out
    Sent,
    /// Nothing changed since the last emission
    Unchanged,
    /// A change is pending until the throttle window passes
    Throttled,
}

struct EmitState {
    last: TableView,
    last_emit: Option<Instant>,
}

/// Publishes [`ProgressUpdate`]s.
pub struct UpdateBroadcaster {
    tx: broadcast::Sender<ProgressUpdate>,
    state: Mutex<EmitState>,
    min_interval: Duration,
}

impl UpdateBroadcaster {
    /// Create a broadcaster buffering `capacity` updates per subscriber and
    /// emitting drift at most once per `min_interval`.
    pub fn new(capacity: usize, min_interval: Duration) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            state: Mutex::new(EmitState {
                last: TableView::new(),
                last_emit: None,
            }),
            min_interval,
        }
    }

    /// Emit immediately, ignoring the throttle.
    pub async fn publish(&self, cause: UpdateCause, items: TableView, at: Time) {
        let mut state = self.state.lock().await;
        state.last = items.clone();
        state.last_emit = Some(Instant::now());
        drop(state);

        self.send(ProgressUpdate {
            cause,
            emitted_at: at,
            items: Arc::new(items),
        });
    }

    /// Emit if `items` differs from the last emission and the throttle
    /// window has passed. A suppressed change stays pending and goes out on
    /// a later call.
    pub async fn publish_drift(&self, items: TableView, at: Time) -> DriftOutcome {
        let mut state = self.state.lock().await;
        if state.last == items {
            return DriftOutcome::Unchanged;
        }
        if let Some(last_emit) = state.last_emit {
            if last_emit.elapsed() < self.min_interval {
                trace!("Drift emission throttled");
                return DriftOutcome::Throttled;
            }
        }
        state.last = items.clone();
        state.last_emit = Some(Instant::now());
        drop(state);

        self.send(ProgressUpdate {
            cause: UpdateCause::Tick,
            emitted_at: at,
            items: Arc::new(items),
        });
        DriftOutcome::Sent
    }

    fn send(&self, update: ProgressUpdate) {
        match self.tx.send(update) {
            Ok(receivers) => trace!("Update delivered to {} subscribers", receivers),
            Err(_) => trace!("No subscribers for update"),
        }
    }

    /// Subscribe without a cancellation hook.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            on_cancel: None,
        }
    }

    /// Subscribe; `on_cancel` runs once when the subscription is cancelled
    /// or dropped.
    pub fn subscribe_with(&self, on_cancel: impl FnOnce() + Send + 'static) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            on_cancel: Some(Box::new(on_cancel)),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A live subscription to progress updates.
pub struct Subscription {
    rx: broadcast::Receiver<ProgressUpdate>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wait for the next update. `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<ProgressUpdate> {
        loop {
            match self.rx.recv().await {
                Ok(update) => return Some(update),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged, skipped {} updates", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered update without waiting.
    pub fn try_recv(&mut self) -> Option<ProgressUpdate> {
        loop {
            match self.rx.try_recv() {
                Ok(update) => return Some(update),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged, skipped {} updates", skipped);
                }
                Err(_) => return None,
            }
        }
    }

    /// Cancel the subscription, running its cancellation hook.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hook) = self.on_cancel.take() {
            debug!("Subscription cancelled");
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tally_core::ItemProgress;

    fn view(amount: u64) -> TableView {
        let mut view = TableView::new();
        view.insert(ItemId::from("a"), ItemProgress { amount, is_accruing: true });
        view
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let broadcaster = UpdateBroadcaster::new(8, Duration::from_secs(1));
        let mut first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();

        broadcaster
            .publish(UpdateCause::Mutation(ItemId::from("a")), view(3), chrono::Utc::now())
            .await;

        assert_eq!(first.recv().await.unwrap().amount(&ItemId::from("a")), 3);
        assert_eq!(second.recv().await.unwrap().amount(&ItemId::from("a")), 3);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let broadcaster = UpdateBroadcaster::new(8, Duration::from_secs(1));
        broadcaster.publish(UpdateCause::Refresh, view(1), chrono::Utc::now()).await;
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_is_throttled_but_not_lost() {
        let broadcaster = UpdateBroadcaster::new(8, Duration::from_secs(1));
        let mut sub = broadcaster.subscribe();
        let now = chrono::Utc::now();

        assert_eq!(broadcaster.publish_drift(view(1), now).await, DriftOutcome::Sent);
        assert_eq!(broadcaster.publish_drift(view(1), now).await, DriftOutcome::Unchanged);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(broadcaster.publish_drift(view(2), now).await, DriftOutcome::Throttled);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(broadcaster.publish_drift(view(2), now).await, DriftOutcome::Sent);

        assert_eq!(sub.try_recv().unwrap().amount(&ItemId::from("a")), 1);
        let second = sub.try_recv().unwrap();
        assert_eq!(second.amount(&ItemId::from("a")), 2);
        assert_eq!(second.cause, UpdateCause::Tick);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_publish_ignores_throttle() {
        let broadcaster = UpdateBroadcaster::new(8, Duration::from_secs(1));
        let mut sub = broadcaster.subscribe();
        let now = chrono::Utc::now();

        broadcaster.publish(UpdateCause::Refresh, view(1), now).await;
        broadcaster.publish(UpdateCause::Mutation(ItemId::from("a")), view(2), now).await;

        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let broadcaster = UpdateBroadcaster::new(2, Duration::ZERO);
        let mut slow = broadcaster.subscribe();
        let mut fast = broadcaster.subscribe();
        let now = chrono::Utc::now();

        for amount in 1..=5 {
            broadcaster.publish(UpdateCause::Tick, view(amount), now).await;
            assert_eq!(fast.try_recv().unwrap().amount(&ItemId::from("a")), amount);
        }

        assert_eq!(slow.try_recv().unwrap().amount(&ItemId::from("a")), 4);
        assert_eq!(slow.try_recv().unwrap().amount(&ItemId::from("a")), 5);
    }

    #[tokio::test]
    async fn test_cancel_runs_hook_once() {
        let broadcaster = UpdateBroadcaster::new(4, Duration::from_secs(1));
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let sub = broadcaster.subscribe_with(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(broadcaster.subscriber_count(), 1);

        sub.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
