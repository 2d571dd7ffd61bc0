//! Progress tracking and accrual engine.
//!
//! Keeps an authoritative in-memory amount per item, accrues elapsed time
//! for timer items, broadcasts changes, snapshots the table across restarts
//! and reconciles amounts into a durable one-row-per-day history.

#![warn(missing_docs)]

pub mod error;
pub mod store;
pub mod timer;
pub mod broadcast;
pub mod persistence;
pub mod reconciler;
pub mod facade;
pub mod scoped;
pub mod engine;

pub use error::TrackingError;
pub use store::{ProgressStore, StartOutcome};
pub use timer::TimerEngine;
pub use broadcast::{DriftOutcome, ProgressUpdate, Subscription, UpdateBroadcaster, UpdateCause};
pub use persistence::{PersistenceAdapter, ReloadPolicy, SNAPSHOT_VERSION};
pub use reconciler::{CompletionReconciler, ReconcileOutcome, ReconcileReport};
pub use facade::{CounterTracker, ProgressTracking, TimerTracker, TrackerProvider};
pub use scoped::{CompletionCallback, ScopedOutcome, ScopedSession};
pub use engine::{EngineConfig, EngineDeps, ProgressEngine};
