//! Composition root.
//!
//! [`ProgressEngine`] wires the store, broadcaster, timer, persistence and
//! reconciler together and exposes the public tracking API plus the
//! lifecycle hooks a host application calls.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tally_core::{CalendarDay, Clock, CompletionEntry, ItemId, ItemKind, SystemClock, TableView};
use tally_storage::{CompletionStore, ItemCatalog, SnapshotSlot};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::broadcast::{Subscription, UpdateBroadcaster, UpdateCause};
use crate::error::TrackingError;
use crate::facade::{ProgressTracking, TrackerProvider};
use crate::persistence::{PersistenceAdapter, ReloadPolicy};
use crate::reconciler::{CompletionReconciler, ReconcileOutcome, ReconcileReport};
use crate::scoped::{ScopedOutcome, ScopedSession};
use crate::store::ProgressStore;
use crate::timer::TimerEngine;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between timer ticks
    pub tick_interval: Duration,
    /// Minimum gap between drift emissions
    pub ui_refresh_interval: Duration,
    /// Updates buffered per subscriber before the oldest are dropped
    pub broadcast_capacity: usize,
    /// Name of the snapshot slot
    pub snapshot_slot: String,
    /// Treatment of records accruing at snapshot time
    pub reload_policy: ReloadPolicy,
    /// Starting an accrual stops every other one
    pub single_active_accrual: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            ui_refresh_interval: Duration::from_secs(1),
            broadcast_capacity: 64,
            snapshot_slot: "progress_table".to_string(),
            reload_policy: ReloadPolicy::CarryGap,
            single_active_accrual: false,
        }
    }
}

impl EngineConfig {
    /// Set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the drift throttle.
    pub fn with_ui_refresh_interval(mut self, interval: Duration) -> Self {
        self.ui_refresh_interval = interval;
        self
    }

    /// Set the reload policy.
    pub fn with_reload_policy(mut self, policy: ReloadPolicy) -> Self {
        self.reload_policy = policy;
        self
    }

    /// Enable or disable single active accrual.
    pub fn with_single_active_accrual(mut self, enabled: bool) -> Self {
        self.single_active_accrual = enabled;
        self
    }
}

/// External collaborators of an engine.
#[derive(Clone)]
pub struct EngineDeps {
    /// Where the table snapshot lives
    pub slot: Arc<dyn SnapshotSlot>,
    /// Durable daily history
    pub completions: Arc<dyn CompletionStore>,
    /// Item catalog
    pub catalog: Arc<dyn ItemCatalog>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl EngineDeps {
    /// Use one backend for every storage concern, with the system clock.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: SnapshotSlot + CompletionStore + ItemCatalog + 'static,
    {
        Self {
            slot: backend.clone(),
            completions: backend.clone(),
            catalog: backend,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Shared internals reachable from every strategy.
pub(crate) struct EngineCore {
    pub(crate) store: Arc<ProgressStore>,
    pub(crate) broadcaster: Arc<UpdateBroadcaster>,
    pub(crate) timer: TimerEngine,
    pub(crate) persistence: PersistenceAdapter,
    pub(crate) reconciler: CompletionReconciler,
    pub(crate) catalog: Arc<dyn ItemCatalog>,
    pub(crate) completions: Arc<dyn CompletionStore>,
    pub(crate) config: EngineConfig,
    save_lock: Mutex<()>,
}

impl EngineCore {
    /// Force an emission of the current table.
    pub(crate) async fn emit(&self, cause: UpdateCause) {
        let now = self.store.clock().now();
        let view = self.store.view().await;
        self.broadcaster.publish(cause, view, now).await;
    }

    /// Write the snapshot.
    ///
    /// Saves run one at a time and copy the table only once they hold the
    /// save lock, so the last write to land is always the newest table. The
    /// table lock itself is released before the write starts.
    pub(crate) async fn save_snapshot(&self) -> Result<(), TrackingError> {
        let _saving = self.save_lock.lock().await;
        let table = self.store.snapshot().await;
        self.persistence.save(&table).await
    }

    /// Save the snapshot, logging a failure instead of returning it.
    pub(crate) async fn checkpoint(&self) {
        if let Err(e) = self.save_snapshot().await {
            warn!("Checkpoint failed, will retry at the next one: {}", e);
        }
    }
}

/// Flush the snapshot in the background, if the engine and a runtime are
/// still around.
fn background_flush(core: Weak<EngineCore>) {
    let Some(core) = core.upgrade() else {
        return;
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                core.checkpoint().await;
            });
        }
        Err(_) => debug!("No runtime available, skipping subscription flush"),
    }
}

/// How a pass-through call reaches an item.
enum Route {
    /// The catalog knows the item's kind
    Known(Arc<dyn ProgressTracking>),
    /// The catalog has no such item
    Unregistered,
    /// The catalog could not be consulted and the kind is not cached
    Unresolved,
}

/// The progress tracking and accrual engine.
pub struct ProgressEngine {
    core: Arc<EngineCore>,
    provider: TrackerProvider,
    // Kinds never change once registered.
    kinds: RwLock<HashMap<ItemId, ItemKind>>,
}

impl ProgressEngine {
    /// Build an engine with the default configuration. Nothing is restored
    /// and the timer is not started; see [`ProgressEngine::open`].
    pub fn new(deps: EngineDeps) -> Self {
        Self::with_config(deps, EngineConfig::default())
    }

    /// Build an engine with `config`.
    pub fn with_config(deps: EngineDeps, config: EngineConfig) -> Self {
        let EngineDeps {
            slot,
            completions,
            catalog,
            clock,
        } = deps;

        let store = Arc::new(ProgressStore::new(clock.clone()));
        let broadcaster = Arc::new(UpdateBroadcaster::new(
            config.broadcast_capacity,
            config.ui_refresh_interval,
        ));
        let timer = TimerEngine::new(store.clone(), broadcaster.clone(), config.tick_interval);
        let persistence =
            PersistenceAdapter::new(slot, config.snapshot_slot.clone(), config.reload_policy, clock);
        let reconciler = CompletionReconciler::new(store.clone(), completions.clone(), catalog.clone());

        let core = Arc::new(EngineCore {
            store,
            broadcaster,
            timer,
            persistence,
            reconciler,
            catalog,
            completions,
            config,
            save_lock: Mutex::new(()),
        });
        let provider = TrackerProvider::new(core.clone());

        Self {
            core,
            provider,
            kinds: RwLock::new(HashMap::new()),
        }
    }

    /// Build an engine, restore the last snapshot and start the timer.
    pub async fn open(config: EngineConfig, deps: EngineDeps) -> Self {
        let engine = Self::with_config(deps, config);
        let restored = engine.restore().await;
        engine.core.timer.start().await;
        info!("Progress engine opened with {} items", restored);
        engine
    }

    /// Replace the table with the stored snapshot. Returns the number of
    /// restored items.
    pub async fn restore(&self) -> usize {
        let table = self.core.persistence.load().await;
        let count = table.len();
        self.core.store.replace(table).await;
        self.core.emit(UpdateCause::Refresh).await;
        self.core.timer.wake();
        count
    }

    /// Configuration in effect.
    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Strategy for an item kind.
    pub fn tracker(&self, kind: ItemKind) -> Arc<dyn ProgressTracking> {
        self.provider.tracker(kind)
    }

    /// Strategy for a registered item, `None` if the catalog does not know
    /// it.
    pub async fn tracker_for(&self, id: &ItemId) -> Result<Option<Arc<dyn ProgressTracking>>, TrackingError> {
        Ok(self.kind_of(id).await?.map(|kind| self.provider.tracker(kind)))
    }

    /// Kind of an item, from the cache or else the catalog.
    async fn kind_of(&self, id: &ItemId) -> Result<Option<ItemKind>, TrackingError> {
        if let Some(kind) = self.kinds.read().await.get(id) {
            return Ok(Some(*kind));
        }

        let kind = self
            .core
            .catalog
            .kind_of(id)
            .await
            .map_err(|e| TrackingError::DurableStoreLookup {
                item: id.clone(),
                reason: e.to_string(),
            })?;
        if let Some(kind) = kind {
            self.kinds.write().await.insert(id.clone(), kind);
        }
        Ok(kind)
    }

    async fn route(&self, id: &ItemId) -> Route {
        match self.kind_of(id).await {
            Ok(Some(kind)) => Route::Known(self.provider.tracker(kind)),
            Ok(None) => Route::Unregistered,
            Err(e) => {
                warn!("{}", e);
                Route::Unresolved
            }
        }
    }

    /// Strategy for calls valid on every kind. Unregistered items use the
    /// timer strategy, which supports every operation.
    async fn strategy_for(&self, id: &ItemId) -> Arc<dyn ProgressTracking> {
        match self.route(id).await {
            Route::Known(tracker) => tracker,
            Route::Unregistered => {
                debug!("Item {} not in catalog, using timer strategy", id);
                self.provider.tracker(ItemKind::Timer)
            }
            // Counter handling of add and reset also checkpoints, which is
            // correct for either kind.
            Route::Unresolved => self.provider.tracker(ItemKind::Counter),
        }
    }

    /// Open a private session for editing `item` on `day`. The shared table
    /// is never touched; `on_complete` receives the final amount.
    pub fn scoped_session(
        &self,
        item: ItemId,
        day: CalendarDay,
        initial_amount: u64,
        on_complete: impl FnOnce(ScopedOutcome) + Send + 'static,
    ) -> ScopedSession {
        ScopedSession::new(item, day, initial_amount, self.core.store.clock().clone(), on_complete)
    }

    /// Current amount of an item.
    pub async fn current_amount(&self, id: &ItemId) -> u64 {
        self.strategy_for(id).await.current_amount(id).await
    }

    /// Whether an item is accruing.
    pub async fn is_accruing(&self, id: &ItemId) -> bool {
        self.core.store.is_accruing(id).await
    }

    /// Start accruing an item. Refused while the item's kind cannot be
    /// determined.
    pub async fn start_accrual(&self, id: &ItemId, initial_amount: u64) {
        match self.route(id).await {
            Route::Known(tracker) => tracker.start_accrual(id, initial_amount).await,
            Route::Unregistered => {
                self.provider
                    .tracker(ItemKind::Timer)
                    .start_accrual(id, initial_amount)
                    .await
            }
            Route::Unresolved => warn!("Not starting accrual for {}: kind unknown", id),
        }
    }

    /// Stop accruing an item.
    pub async fn stop_accrual(&self, id: &ItemId) {
        match self.route(id).await {
            Route::Known(tracker) => tracker.stop_accrual(id).await,
            // Stopping is harmless for either kind.
            Route::Unregistered | Route::Unresolved => {
                self.provider.tracker(ItemKind::Timer).stop_accrual(id).await
            }
        }
    }

    /// Apply a signed delta to an item. Returns the new amount.
    pub async fn add_amount(&self, id: &ItemId, delta: i64) -> u64 {
        self.strategy_for(id).await.add_amount(id, delta).await
    }

    /// Zero an item's amount.
    pub async fn reset_amount(&self, id: &ItemId) {
        self.strategy_for(id).await.reset_amount(id).await
    }

    /// Record one item's current amount for `day` (today if `None`).
    pub async fn persist_one(
        &self,
        id: &ItemId,
        day: Option<CalendarDay>,
    ) -> Result<ReconcileOutcome, TrackingError> {
        self.core.reconciler.persist_one(id, day).await
    }

    /// Record every positive amount for `day` (today if `None`).
    pub async fn persist_all(&self, day: Option<CalendarDay>) -> ReconcileReport {
        self.core.reconciler.persist_all(day).await
    }

    /// Subscribe to updates. Dropping or cancelling the subscription
    /// flushes the snapshot in the background.
    pub fn subscribe(&self) -> Subscription {
        let core = Arc::downgrade(&self.core);
        self.core
            .broadcaster
            .subscribe_with(move || background_flush(core))
    }

    /// Point-in-time amounts of every item.
    pub async fn view(&self) -> TableView {
        self.core.store.view().await
    }

    /// Recorded completions of an item, oldest first.
    pub async fn history(&self, id: &ItemId) -> Result<Vec<CompletionEntry>, TrackingError> {
        self.core
            .completions
            .history(id)
            .await
            .map_err(|e| TrackingError::DurableStoreLookup {
                item: id.clone(),
                reason: e.to_string(),
            })
    }

    /// Write the snapshot now.
    pub async fn save_snapshot(&self) -> Result<(), TrackingError> {
        self.core.save_snapshot().await
    }

    /// The host is going to the background: reconcile today and save the
    /// snapshot.
    pub async fn suspend(&self) -> ReconcileReport {
        let report = self.persist_all(None).await;
        self.core.checkpoint().await;
        info!("Engine suspended");
        report
    }

    /// The host is back: make sure the timer runs and re-announce the
    /// table.
    pub async fn resume(&self) {
        self.core.timer.start().await;
        self.core.timer.wake();
        self.core.emit(UpdateCause::Refresh).await;
        info!("Engine resumed");
    }

    /// Close out `finished_day`: reconcile its amounts, then deduct every
    /// amount that reconciled. Progress made while the reconciliation ran
    /// carries into the new day, running accruals keep running, and amounts
    /// that failed to reconcile are kept for a retry.
    pub async fn roll_over(&self, finished_day: CalendarDay) -> ReconcileReport {
        let amounts = self.core.store.positive_amounts().await;
        let report = self.core.reconciler.persist_amounts(amounts.clone(), finished_day).await;

        let settled: Vec<(ItemId, u64)> = amounts
            .into_iter()
            .filter(|(id, _)| !report.failures.iter().any(|(failed, _)| failed == id))
            .collect();
        self.core.store.settle(&settled).await;

        self.core.emit(UpdateCause::Refresh).await;
        self.core.checkpoint().await;
        info!("Rolled over {} ({} items settled)", finished_day, settled.len());
        report
    }

    /// Drop the record of an item deleted from the catalog.
    pub async fn forget_item(&self, id: &ItemId) -> bool {
        self.kinds.write().await.remove(id);
        if self.core.store.remove(id).await.is_none() {
            return false;
        }
        self.core.emit(UpdateCause::Mutation(id.clone())).await;
        self.core.checkpoint().await;
        debug!("Forgot item {}", id);
        true
    }

    /// Stop the timer and flush the snapshot.
    pub async fn shutdown(&self) {
        self.core.timer.stop().await;
        self.core.checkpoint().await;
        info!("Progress engine shut down");
    }
}
