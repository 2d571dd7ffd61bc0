//! Snapshot persistence of the progress table.
//!
//! The table is written as one JSON document to a named slot:
//!
//! ```text
//! {
//!   "version": 1,
//!   "saved_at": 1700000000,
//!   "items": {
//!     "<id>": { "accumulated_amount": 42, "is_accruing": true, "accrual_started_at": 1699999990 }
//!   }
//! }
//! ```
//!
//! Timestamps are epoch seconds. Loading never fails: a payload that cannot
//! be decoded yields an empty table and the slot is cleared.

use std::collections::BTreeMap;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tally_core::{Clock, ItemId, ProgressRecord, ProgressTable, Time};
use tally_storage::SnapshotSlot;
use tracing::{debug, info, warn};

use crate::error::TrackingError;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// What happens to a record that was accruing when the snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReloadPolicy {
    /// Keep the original start time: time spent suspended counts.
    #[default]
    CarryGap,
    /// Fold what had accrued by the save, then restart the clock at load
    /// time: time spent suspended is discarded.
    RestartClock,
}

impl std::str::FromStr for ReloadPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "carry-gap" | "carry_gap" => Ok(ReloadPolicy::CarryGap),
            "restart-clock" | "restart_clock" => Ok(ReloadPolicy::RestartClock),
            other => Err(format!("unknown reload policy: {other}")),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSnapshot {
    version: u32,
    #[serde(with = "chrono::serde::ts_seconds")]
    saved_at: Time,
    items: BTreeMap<ItemId, ProgressRecord>,
}

/// Reads and writes the table snapshot.
pub struct PersistenceAdapter {
    slot: Arc<dyn SnapshotSlot>,
    slot_name: String,
    policy: ReloadPolicy,
    clock: Arc<dyn Clock>,
}

impl PersistenceAdapter {
    /// Create an adapter over `slot_name` in `slot`.
    pub fn new(
        slot: Arc<dyn SnapshotSlot>,
        slot_name: impl Into<String>,
        policy: ReloadPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            slot,
            slot_name: slot_name.into(),
            policy,
            clock,
        }
    }

    /// Reload policy in effect.
    pub fn policy(&self) -> ReloadPolicy {
        self.policy
    }

    /// Encode and write the full table.
    pub async fn save(&self, table: &ProgressTable) -> Result<(), TrackingError> {
        let snapshot = PersistedSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: self.clock.now(),
            items: table.iter().map(|(id, r)| (id.clone(), r.clone())).collect(),
        };
        let payload = serde_json::to_vec(&snapshot)
            .map_err(|e| TrackingError::CorruptSnapshot(e.to_string()))?;

        self.slot
            .write_slot(&self.slot_name, &payload)
            .await
            .map_err(TrackingError::TransientPersistence)?;

        debug!("Saved snapshot with {} items", snapshot.items.len());
        Ok(())
    }

    /// Read the table back. Never fails; see the module docs.
    pub async fn load(&self) -> ProgressTable {
        let payload = match self.slot.read_slot(&self.slot_name).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!("No snapshot in slot {}", self.slot_name);
                return ProgressTable::new();
            }
            Err(e) => {
                warn!("{}", TrackingError::TransientPersistence(e));
                return ProgressTable::new();
            }
        };

        match self.decode(&payload) {
            Ok(table) => {
                info!("Restored {} items from snapshot", table.len());
                table
            }
            Err(e) => {
                warn!("{}; starting from an empty table", e);
                if let Err(e) = self.slot.clear_slot(&self.slot_name).await {
                    warn!("Failed to clear invalid snapshot slot: {}", e);
                }
                ProgressTable::new()
            }
        }
    }

    /// Drop the stored snapshot.
    pub async fn clear(&self) -> Result<(), TrackingError> {
        self.slot
            .clear_slot(&self.slot_name)
            .await
            .map_err(TrackingError::TransientPersistence)
    }

    fn decode(&self, payload: &[u8]) -> Result<ProgressTable, TrackingError> {
        let snapshot: PersistedSnapshot = serde_json::from_slice(payload)
            .map_err(|e| TrackingError::CorruptSnapshot(e.to_string()))?;

        if snapshot.version > SNAPSHOT_VERSION {
            return Err(TrackingError::CorruptSnapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let now = self.clock.now();
        let mut table = ProgressTable::with_capacity(snapshot.items.len());
        for (id, mut record) in snapshot.items {
            if record.normalize(now) {
                warn!("Repaired inconsistent accrual state for {}", id);
            }
            if record.is_accruing() && self.policy == ReloadPolicy::RestartClock {
                record.stop(snapshot.saved_at);
                record.start(now);
            }
            table.insert(id, record);
        }
        Ok(table)
    }
}
