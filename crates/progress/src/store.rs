//! The authoritative in-memory progress table.

use std::sync::Arc;
use tally_core::{Clock, ItemId, ProgressRecord, ProgressTable, TableView};
use tokio::sync::Mutex;
use tracing::debug;

/// Result of a start request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOutcome {
    /// Whether the item went from idle to accruing
    pub started: bool,
    /// Items stopped to honor the single-active policy
    pub stopped: Vec<ItemId>,
}

/// In-memory table of per-item accrual state.
///
/// One mutex guards the whole table. Every operation is a short map access,
/// so no caller holds the lock across I/O or across an await on anything
/// else.
pub struct ProgressStore {
    table: Mutex<ProgressTable>,
    clock: Arc<dyn Clock>,
}

impl ProgressStore {
    /// Create an empty store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_table(ProgressTable::new(), clock)
    }

    /// Create a store pre-populated with `table`.
    pub fn with_table(table: ProgressTable, clock: Arc<dyn Clock>) -> Self {
        Self {
            table: Mutex::new(table),
            clock,
        }
    }

    /// The clock driving accrual.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Current amount including any running accrual. Unknown items are 0.
    pub async fn current_amount(&self, id: &ItemId) -> u64 {
        let now = self.clock.now();
        let table = self.table.lock().await;
        table.get(id).map_or(0, |r| r.current_amount(now))
    }

    /// Whether the item is accruing.
    pub async fn is_accruing(&self, id: &ItemId) -> bool {
        let table = self.table.lock().await;
        table.get(id).is_some_and(|r| r.is_accruing())
    }

    /// Fold any running accrual, then apply `delta`, flooring at zero.
    /// Returns the new amount.
    pub async fn add_amount(&self, id: &ItemId, delta: i64) -> u64 {
        let now = self.clock.now();
        let mut table = self.table.lock().await;
        let amount = table.entry(id.clone()).or_default().add(delta, now);
        debug!("Added {} to {} -> {}", delta, id, amount);
        amount
    }

    /// Start accruing, creating the record with `initial_amount` if absent.
    ///
    /// Already accruing is a no-op. With `exclusive`, every other accruing
    /// record is stopped first, inside the same critical section.
    pub async fn start_accrual(&self, id: &ItemId, initial_amount: u64, exclusive: bool) -> StartOutcome {
        let now = self.clock.now();
        let mut table = self.table.lock().await;

        if table.get(id).is_some_and(|r| r.is_accruing()) {
            return StartOutcome::default();
        }

        let mut stopped = Vec::new();
        if exclusive {
            for (other, record) in table.iter_mut() {
                if other != id && record.stop(now) {
                    stopped.push(other.clone());
                }
            }
        }

        let record = table
            .entry(id.clone())
            .or_insert_with(|| ProgressRecord::new(initial_amount));
        record.start(now);
        debug!("Started accrual for {} (stopped {} others)", id, stopped.len());

        StartOutcome { started: true, stopped }
    }

    /// Fold and stop accruing. Returns the folded amount, or `None` if the
    /// item was not accruing.
    pub async fn stop_accrual(&self, id: &ItemId) -> Option<u64> {
        let now = self.clock.now();
        let mut table = self.table.lock().await;
        let record = table.get_mut(id)?;
        if !record.stop(now) {
            return None;
        }
        debug!("Stopped accrual for {} at {}", id, record.accumulated_amount());
        Some(record.accumulated_amount())
    }

    /// Zero the amount. A running accrual keeps running. Returns false for
    /// unknown items, which are left uncreated.
    pub async fn reset_amount(&self, id: &ItemId) -> bool {
        let now = self.clock.now();
        let mut table = self.table.lock().await;
        match table.get_mut(id) {
            Some(record) => {
                record.reset(now);
                true
            }
            None => false,
        }
    }

    /// Deduct amounts that were recorded elsewhere, under one lock.
    ///
    /// Anything added or accrued since the amounts were captured stays in
    /// the table. Running accruals keep running.
    pub async fn settle(&self, recorded: &[(ItemId, u64)]) {
        let now = self.clock.now();
        let mut table = self.table.lock().await;
        for (id, amount) in recorded {
            if let Some(record) = table.get_mut(id) {
                let delta = i64::try_from(*amount).map_or(i64::MIN, |a| -a);
                record.add(delta, now);
            }
        }
    }

    /// Drop an item's record.
    pub async fn remove(&self, id: &ItemId) -> Option<ProgressRecord> {
        self.table.lock().await.remove(id)
    }

    /// Copy of one record.
    pub async fn record(&self, id: &ItemId) -> Option<ProgressRecord> {
        self.table.lock().await.get(id).cloned()
    }

    /// Copy of the whole table, for persistence.
    pub async fn snapshot(&self) -> ProgressTable {
        self.table.lock().await.clone()
    }

    /// Point-in-time amounts of every item.
    pub async fn view(&self) -> TableView {
        let now = self.clock.now();
        let table = self.table.lock().await;
        table.iter().map(|(id, r)| (id.clone(), r.progress(now))).collect()
    }

    /// Items with a positive current amount.
    pub async fn positive_amounts(&self) -> Vec<(ItemId, u64)> {
        let now = self.clock.now();
        let table = self.table.lock().await;
        let mut amounts: Vec<_> = table
            .iter()
            .map(|(id, r)| (id.clone(), r.current_amount(now)))
            .filter(|(_, amount)| *amount > 0)
            .collect();
        amounts.sort_by(|a, b| a.0.cmp(&b.0));
        amounts
    }

    /// Whether anything is accruing.
    pub async fn any_accruing(&self) -> bool {
        self.table.lock().await.values().any(|r| r.is_accruing())
    }

    /// Replace the whole table, e.g. after loading a snapshot.
    pub async fn replace(&self, table: ProgressTable) {
        *self.table.lock().await = table;
    }
}
