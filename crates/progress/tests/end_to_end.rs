//! End-to-end scenarios against the JSON backend and the wall clock.

use std::sync::Arc;
use std::time::Duration;
use tally_core::{CalendarDay, CatalogItem, ItemKind};
use tally_progress::{EngineConfig, EngineDeps, ProgressEngine, ReconcileOutcome, UpdateCause};
use tally_storage::{CompletionStore, ItemCatalog, JsonStorage};
use tempfile::TempDir;

async fn open_engine(dir: &TempDir) -> (ProgressEngine, Arc<JsonStorage>) {
    let storage = Arc::new(JsonStorage::new(dir.path()).await.unwrap());
    let engine = ProgressEngine::open(EngineConfig::default(), EngineDeps::from_backend(storage.clone())).await;
    (engine, storage)
}

#[tokio::test]
async fn test_counter_and_timer_scenario() {
    let dir = TempDir::new().unwrap();
    let (engine, storage) = open_engine(&dir).await;

    let counter = CatalogItem::new("pushups", ItemKind::Counter);
    let timer = CatalogItem::new("reading", ItemKind::Timer);
    storage.register_item(&counter).await.unwrap();
    storage.register_item(&timer).await.unwrap();

    assert_eq!(engine.add_amount(&counter.id, 3).await, 3);
    assert_eq!(engine.add_amount(&counter.id, -5).await, 0);
    assert_eq!(engine.current_amount(&counter.id).await, 0);

    engine.start_accrual(&timer.id, 0).await;
    assert!(engine.is_accruing(&timer.id).await);
    tokio::time::sleep(Duration::from_secs(2)).await;

    let amount = engine.current_amount(&timer.id).await;
    assert!((2..3).contains(&amount), "unexpected amount {amount}");

    engine.stop_accrual(&timer.id).await;
    let stopped = engine.current_amount(&timer.id).await;
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(engine.current_amount(&timer.id).await, stopped);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_fold_then_add_and_reset_while_accruing() {
    let dir = TempDir::new().unwrap();
    let (engine, storage) = open_engine(&dir).await;
    let timer = CatalogItem::new("focus", ItemKind::Timer);
    storage.register_item(&timer).await.unwrap();

    engine.add_amount(&timer.id, 10).await;
    engine.start_accrual(&timer.id, 0).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    engine.add_amount(&timer.id, 5).await;
    engine.stop_accrual(&timer.id).await;
    let folded = engine.current_amount(&timer.id).await;
    assert!((16..18).contains(&folded), "unexpected amount {folded}");

    engine.start_accrual(&timer.id, 0).await;
    engine.reset_amount(&timer.id).await;
    assert!(engine.is_accruing(&timer.id).await);
    assert_eq!(engine.current_amount(&timer.id).await, 0);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(engine.current_amount(&timer.id).await >= 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_state_survives_restart_and_reconciles_once() {
    let dir = TempDir::new().unwrap();
    let day = CalendarDay::from_ymd_opt(2024, 3, 10).unwrap();
    let item = CatalogItem::new("water", ItemKind::Counter);

    {
        let (engine, storage) = open_engine(&dir).await;
        storage.register_item(&item).await.unwrap();
        engine.add_amount(&item.id, 6).await;
        engine.shutdown().await;
    }

    let (engine, storage) = open_engine(&dir).await;
    assert_eq!(engine.current_amount(&item.id).await, 6);

    assert_eq!(engine.persist_one(&item.id, Some(day)).await.unwrap(), ReconcileOutcome::Written(6));
    assert_eq!(engine.persist_one(&item.id, Some(day)).await.unwrap(), ReconcileOutcome::Unchanged);
    assert_eq!(storage.entries(&item.id, day).await.unwrap().len(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_ticks_reach_subscribers() {
    let dir = TempDir::new().unwrap();
    let (engine, storage) = open_engine(&dir).await;
    let timer = CatalogItem::new("walk", ItemKind::Timer);
    storage.register_item(&timer).await.unwrap();

    let mut sub = engine.subscribe();
    engine.start_accrual(&timer.id, 0).await;

    let update = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match sub.recv().await {
                Some(update) if update.cause == UpdateCause::Tick => return Some(update),
                Some(_) => continue,
                None => return None,
            }
        }
    })
    .await
    .unwrap()
    .unwrap();
    assert!(update.is_accruing(&timer.id));

    engine.shutdown().await;
}
