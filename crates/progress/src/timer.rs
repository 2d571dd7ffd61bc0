//! The background tick loop that publishes accrual drift.
//!
//! There is one loop per engine, not one per item. It parks on a
//! [`Notify`] while nothing accrues and only ticks while at least one record
//! is accruing. State lives in the [`ProgressStore`], so stopping the loop
//! loses nothing.

use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::broadcast::{DriftOutcome, UpdateBroadcaster};
use crate::store::ProgressStore;

struct RunningLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owner of the tick loop.
pub struct TimerEngine {
    store: Arc<ProgressStore>,
    broadcaster: Arc<UpdateBroadcaster>,
    tick_interval: Duration,
    wake: Arc<Notify>,
    running: Mutex<Option<RunningLoop>>,
}

impl TimerEngine {
    /// Create a stopped timer engine.
    pub fn new(store: Arc<ProgressStore>, broadcaster: Arc<UpdateBroadcaster>, tick_interval: Duration) -> Self {
        Self {
            store,
            broadcaster,
            tick_interval,
            wake: Arc::new(Notify::new()),
            running: Mutex::new(None),
        }
    }

    /// Spawn the loop. Returns false if it was already running.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(
            self.store.clone(),
            self.broadcaster.clone(),
            self.tick_interval,
            self.wake.clone(),
            shutdown_rx,
        ));
        *running = Some(RunningLoop { shutdown, handle });

        info!("Timer engine started ({:?} ticks)", self.tick_interval);
        true
    }

    /// Stop the loop and wait for it to exit. Returns false if it was not
    /// running.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.running.lock().await.take() else {
            return false;
        };

        let _ = running.shutdown.send(true);
        if let Err(e) = running.handle.await {
            warn!("Timer loop ended abnormally: {}", e);
        }

        info!("Timer engine stopped");
        true
    }

    /// Whether the loop is alive.
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Resume a parked loop after an accrual starts.
    pub fn wake(&self) {
        self.wake.notify_one();
    }
}

impl Drop for TimerEngine {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.shutdown.send(true);
        }
    }
}

async fn run_loop(
    store: Arc<ProgressStore>,
    broadcaster: Arc<UpdateBroadcaster>,
    tick_interval: Duration,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if !store.any_accruing().await {
            debug!("Nothing accruing, timer parked");
            tokio::select! {
                _ = wake.notified() => continue,
                _ = shutdown.changed() => return,
            }
        }

        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }

            let now = store.clock().now();
            let view = store.view().await;
            let still_accruing = view.values().any(|p| p.is_accruing);
            let outcome = broadcaster.publish_drift(view, now).await;

            // Keep ticking until a throttled final state has gone out.
            if !still_accruing && outcome != DriftOutcome::Throttled {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::UpdateCause;
    use chrono::{TimeZone, Utc};
    use tally_core::{ItemId, ManualClock};

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<ProgressStore>,
        broadcaster: Arc<UpdateBroadcaster>,
        timer: TimerEngine,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let store = Arc::new(ProgressStore::new(clock.clone()));
        let broadcaster = Arc::new(UpdateBroadcaster::new(16, Duration::from_secs(1)));
        let timer = TimerEngine::new(store.clone(), broadcaster.clone(), Duration::from_millis(500));
        Fixture { clock, store, broadcaster, timer }
    }

    async fn step(f: &Fixture, millis: u64) {
        f.clock.advance(chrono::Duration::milliseconds(millis as i64));
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_are_idempotent() {
        let f = fixture();
        assert!(f.timer.start().await);
        assert!(!f.timer.start().await);
        assert!(f.timer.is_running().await);

        assert!(f.timer.stop().await);
        assert!(!f.timer.stop().await);
        assert!(!f.timer.is_running().await);

        assert!(f.timer.start().await);
        assert!(f.timer.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_publish_accrual_drift() {
        let f = fixture();
        let mut sub = f.broadcaster.subscribe();
        let id = ItemId::from("focus");

        f.timer.start().await;
        f.store.start_accrual(&id, 0, false).await;
        f.timer.wake();

        for _ in 0..6 {
            step(&f, 500).await;
        }

        let mut last = None;
        while let Some(update) = sub.try_recv() {
            assert_eq!(update.cause, UpdateCause::Tick);
            last = Some(update);
        }
        let last = last.expect("timer should have published drift");
        assert!(last.is_accruing(&id));
        assert!(last.amount(&id) >= 2);

        f.timer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_parks_when_nothing_accrues() {
        let f = fixture();
        let mut sub = f.broadcaster.subscribe();
        let id = ItemId::from("focus");

        f.timer.start().await;
        f.store.start_accrual(&id, 0, false).await;
        f.timer.wake();
        step(&f, 1500).await;

        f.store.stop_accrual(&id).await;
        step(&f, 1500).await;
        while sub.try_recv().is_some() {}

        for _ in 0..10 {
            step(&f, 1000).await;
        }
        assert!(sub.try_recv().is_none());
        assert!(f.timer.is_running().await);

        f.timer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_keeps_store_state() {
        let f = fixture();
        let id = ItemId::from("focus");

        f.timer.start().await;
        f.store.start_accrual(&id, 0, false).await;
        f.timer.wake();
        step(&f, 3000).await;
        f.timer.stop().await;

        assert!(f.store.is_accruing(&id).await);
        assert_eq!(f.store.current_amount(&id).await, 3);
    }
}
