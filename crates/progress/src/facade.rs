//! One tracking interface, two strategies.
//!
//! Counters and timers share the same store, broadcaster and persistence
//! plumbing; they differ only in whether start/stop mean anything and in how
//! eagerly they checkpoint.

use async_trait::async_trait;
use std::sync::Arc;
use tally_core::{ItemId, ItemKind};
use tracing::{debug, info};

use crate::broadcast::UpdateCause;
use crate::engine::EngineCore;

/// Tracking operations on a single item.
#[async_trait]
pub trait ProgressTracking: Send + Sync {
    /// Kind of items this strategy handles.
    fn kind(&self) -> ItemKind;

    /// Current amount, never negative.
    async fn current_amount(&self, id: &ItemId) -> u64;

    /// Whether the item is accruing time.
    async fn is_accruing(&self, id: &ItemId) -> bool;

    /// Start accruing; no-op if already accruing.
    async fn start_accrual(&self, id: &ItemId, initial_amount: u64);

    /// Stop accruing; no-op if idle.
    async fn stop_accrual(&self, id: &ItemId);

    /// Apply a signed delta; the result floors at zero. Returns the new
    /// amount.
    async fn add_amount(&self, id: &ItemId, delta: i64) -> u64;

    /// Zero the amount without changing the accrual state.
    async fn reset_amount(&self, id: &ItemId);
}

/// Strategy for discrete counts. Never accrues.
pub struct CounterTracker {
    core: Arc<EngineCore>,
}

impl CounterTracker {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl ProgressTracking for CounterTracker {
    fn kind(&self) -> ItemKind {
        ItemKind::Counter
    }

    async fn current_amount(&self, id: &ItemId) -> u64 {
        self.core.store.current_amount(id).await
    }

    async fn is_accruing(&self, _id: &ItemId) -> bool {
        false
    }

    async fn start_accrual(&self, id: &ItemId, _initial_amount: u64) {
        debug!("Ignoring start for counter item {}", id);
    }

    async fn stop_accrual(&self, id: &ItemId) {
        debug!("Ignoring stop for counter item {}", id);
    }

    async fn add_amount(&self, id: &ItemId, delta: i64) -> u64 {
        let amount = self.core.store.add_amount(id, delta).await;
        self.core.emit(UpdateCause::Mutation(id.clone())).await;
        // Counters change rarely, so every change is checkpointed.
        self.core.checkpoint().await;
        amount
    }

    async fn reset_amount(&self, id: &ItemId) {
        if self.core.store.reset_amount(id).await {
            self.core.emit(UpdateCause::Mutation(id.clone())).await;
            self.core.checkpoint().await;
        }
    }
}

/// Strategy for elapsed time. Drives the Idle/Accruing state machine.
pub struct TimerTracker {
    core: Arc<EngineCore>,
}

impl TimerTracker {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl ProgressTracking for TimerTracker {
    fn kind(&self) -> ItemKind {
        ItemKind::Timer
    }

    async fn current_amount(&self, id: &ItemId) -> u64 {
        self.core.store.current_amount(id).await
    }

    async fn is_accruing(&self, id: &ItemId) -> bool {
        self.core.store.is_accruing(id).await
    }

    async fn start_accrual(&self, id: &ItemId, initial_amount: u64) {
        let exclusive = self.core.config.single_active_accrual;
        let outcome = self.core.store.start_accrual(id, initial_amount, exclusive).await;
        if outcome.started {
            self.core.timer.start().await;
            self.core.timer.wake();
            info!("Accrual started for {}", id);
            for other in &outcome.stopped {
                info!("Accrual stopped for {} (single active accrual)", other);
            }
        }
        self.core.emit(UpdateCause::Mutation(id.clone())).await;
    }

    async fn stop_accrual(&self, id: &ItemId) {
        if let Some(amount) = self.core.store.stop_accrual(id).await {
            info!("Accrual stopped for {} at {}", id, amount);
        }
        self.core.emit(UpdateCause::Mutation(id.clone())).await;
    }

    async fn add_amount(&self, id: &ItemId, delta: i64) -> u64 {
        let amount = self.core.store.add_amount(id, delta).await;
        self.core.emit(UpdateCause::Mutation(id.clone())).await;
        amount
    }

    async fn reset_amount(&self, id: &ItemId) {
        self.core.store.reset_amount(id).await;
        self.core.emit(UpdateCause::Mutation(id.clone())).await;
    }
}

/// Picks the strategy for an item kind.
#[derive(Clone)]
pub struct TrackerProvider {
    counter: Arc<dyn ProgressTracking>,
    timer: Arc<dyn ProgressTracking>,
}

impl TrackerProvider {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        Self {
            counter: Arc::new(CounterTracker::new(core.clone())),
            timer: Arc::new(TimerTracker::new(core)),
        }
    }

    /// Strategy for `kind`.
    pub fn tracker(&self, kind: ItemKind) -> Arc<dyn ProgressTracking> {
        match kind {
            ItemKind::Counter => self.counter.clone(),
            ItemKind::Timer => self.timer.clone(),
        }
    }
}
