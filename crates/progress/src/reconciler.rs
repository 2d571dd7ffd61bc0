//! Reconciliation of in-memory amounts into the durable completion store.

use std::sync::Arc;
use tally_core::{CalendarDay, ItemId};
use tally_storage::{CompletionStore, ItemCatalog};
use tracing::{debug, info, warn};

use crate::error::TrackingError;
use crate::store::ProgressStore;

/// What a single reconciliation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The day's entry was replaced with this amount
    Written(u64),
    /// The stored entry already held the current amount
    Unchanged,
    /// Nothing to record, the amount is zero
    Empty,
    /// The item is gone from the catalog
    Skipped,
}

/// Result of reconciling every item.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Items whose entry was written
    pub written: Vec<ItemId>,
    /// Items already up to date
    pub unchanged: Vec<ItemId>,
    /// Items missing from the catalog
    pub skipped: Vec<ItemId>,
    /// Items that failed, to be retried at the next checkpoint
    pub failures: Vec<(ItemId, TrackingError)>,
}

impl ReconcileReport {
    /// Whether every item reconciled.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, id: ItemId, result: Result<ReconcileOutcome, TrackingError>) {
        match result {
            Ok(ReconcileOutcome::Written(_)) => self.written.push(id),
            Ok(ReconcileOutcome::Unchanged) => self.unchanged.push(id),
            Ok(ReconcileOutcome::Skipped) => self.skipped.push(id),
            Ok(ReconcileOutcome::Empty) => {}
            Err(e) => self.failures.push((id, e)),
        }
    }
}

/// Copies current amounts into one-row-per-day completion entries.
pub struct CompletionReconciler {
    store: Arc<ProgressStore>,
    completions: Arc<dyn CompletionStore>,
    catalog: Arc<dyn ItemCatalog>,
}

impl CompletionReconciler {
    /// Create a reconciler.
    pub fn new(
        store: Arc<ProgressStore>,
        completions: Arc<dyn CompletionStore>,
        catalog: Arc<dyn ItemCatalog>,
    ) -> Self {
        Self {
            store,
            completions,
            catalog,
        }
    }

    /// Record the item's current amount for `day` (today if `None`).
    pub async fn persist_one(
        &self,
        id: &ItemId,
        day: Option<CalendarDay>,
    ) -> Result<ReconcileOutcome, TrackingError> {
        let day = day.unwrap_or_else(|| self.store.clock().today());
        let amount = self.store.current_amount(id).await;
        self.persist_amount(id, day, amount).await
    }

    /// Reconcile every item with a positive amount for `day` (today if
    /// `None`). Failures are collected, never abort the batch.
    pub async fn persist_all(&self, day: Option<CalendarDay>) -> ReconcileReport {
        let day = day.unwrap_or_else(|| self.store.clock().today());
        let amounts = self.store.positive_amounts().await;
        self.persist_amounts(amounts, day).await
    }

    /// Reconcile a captured set of amounts.
    pub(crate) async fn persist_amounts(&self, amounts: Vec<(ItemId, u64)>, day: CalendarDay) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for (id, amount) in amounts {
            let result = self.persist_amount(&id, day, amount).await;
            if let Err(e) = &result {
                warn!("Reconciliation failed: {}", e);
            }
            report.record(id, result);
        }

        info!(
            "Reconciled {}: {} written, {} unchanged, {} skipped, {} failed",
            day,
            report.written.len(),
            report.unchanged.len(),
            report.skipped.len(),
            report.failures.len()
        );
        report
    }

    async fn persist_amount(
        &self,
        id: &ItemId,
        day: CalendarDay,
        amount: u64,
    ) -> Result<ReconcileOutcome, TrackingError> {
        if amount == 0 {
            return Ok(ReconcileOutcome::Empty);
        }

        match self.catalog.load_item(id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!("Item {} not in catalog, skipping", id);
                return Ok(ReconcileOutcome::Skipped);
            }
            Err(e) => {
                return Err(TrackingError::DurableStoreLookup {
                    item: id.clone(),
                    reason: e.to_string(),
                })
            }
        }

        let existing = self
            .completions
            .entries(id, day)
            .await
            .map_err(|source| TrackingError::DurableStoreTransaction {
                item: id.clone(),
                day,
                source,
            })?;

        if let [entry] = existing.as_slice() {
            if entry.amount == amount {
                return Ok(ReconcileOutcome::Unchanged);
            }
        }

        self.completions
            .replace_entries(id, day, amount)
            .await
            .map_err(|source| TrackingError::DurableStoreTransaction {
                item: id.clone(),
                day,
                source,
            })?;

        debug!("Recorded {} for {} on {}", amount, id, day);
        Ok(ReconcileOutcome::Written(amount))
    }
}
