//! JSON file storage implementation.
//!
//! Stores data as JSON files under a root directory (`.tally` by default):
//!
//! ```text
//! <root>/slots/<name>.json     snapshot slots
//! <root>/items/<id>.json       catalog items, one file each
//! <root>/completions.json      completion history
//! ```
//!
//! Every write goes to a sibling temp file first and is renamed into place,
//! so a crash never leaves a half-written file behind.

use std::path::{Path, PathBuf};
use async_trait::async_trait;
use tally_core::{CalendarDay, CatalogItem, CompletionEntry, ItemId};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use ulid::Ulid;

use super::trait_::{check_slot_name, CompletionStore, ItemCatalog, Result, SnapshotSlot, StorageError};

/// File-based JSON storage backend.
pub struct JsonStorage {
    root: PathBuf,
    // Serializes read-modify-write cycles on completions.json.
    completions_lock: Mutex<()>,
}

impl JsonStorage {
    /// Create storage, creating the subdirectories it needs.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(root.join("slots")).await?;
        fs::create_dir_all(root.join("items")).await?;

        Ok(Self {
            root,
            completions_lock: Mutex::new(()),
        })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn slot_path(&self, name: &str) -> PathBuf {
        self.root.join("slots").join(format!("{}.json", name))
    }
    fn item_path(&self, id: &ItemId) -> PathBuf {
        self.root.join("items").join(format!("{}.json", id))
    }
    fn completions_path(&self) -> PathBuf {
        self.root.join("completions.json")
    }

    async fn read_completions(&self) -> Result<Vec<CompletionEntry>> {
        Ok(read_json(&self.completions_path()).await?.unwrap_or_default())
    }
}

#[async_trait]
impl SnapshotSlot for JsonStorage {
    async fn read_slot(&self, name: &str) -> Result<Option<Vec<u8>>> {
        check_slot_name(name)?;
        match fs::read(self.slot_path(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_slot(&self, name: &str, payload: &[u8]) -> Result<()> {
        check_slot_name(name)?;
        write_atomic(&self.slot_path(name), payload).await?;
        debug!("Wrote slot {} ({} bytes)", name, payload.len());
        Ok(())
    }

    async fn clear_slot(&self, name: &str) -> Result<()> {
        check_slot_name(name)?;
        fs::remove_file(self.slot_path(name)).await.or_else(|e| {
            if e.kind() == std::io::ErrorKind::NotFound { Ok(()) } else { Err(e) }
        })?;
        Ok(())
    }
}

#[async_trait]
impl CompletionStore for JsonStorage {
    async fn entries(&self, item: &ItemId, day: CalendarDay) -> Result<Vec<CompletionEntry>> {
        let all = self.read_completions().await?;
        Ok(all.into_iter().filter(|e| e.is_for(item, day)).collect())
    }

    async fn replace_entries(
        &self,
        item: &ItemId,
        day: CalendarDay,
        amount: u64,
    ) -> Result<CompletionEntry> {
        let _guard = self.completions_lock.lock().await;

        let mut all = self.read_completions().await?;
        let before = all.len();
        all.retain(|e| !e.is_for(item, day));
        let removed = before - all.len();

        let entry = CompletionEntry::new(item.clone(), day, amount);
        all.push(entry.clone());

        let json = serde_json::to_vec_pretty(&all)?;
        write_atomic(&self.completions_path(), &json)
            .await
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        debug!("Replaced {} entries for {} on {} with amount {}", removed, item, day, amount);
        Ok(entry)
    }

    async fn history(&self, item: &ItemId) -> Result<Vec<CompletionEntry>> {
        let mut entries: Vec<_> = self
            .read_completions()
            .await?
            .into_iter()
            .filter(|e| &e.item_id == item)
            .collect();
        entries.sort_by(|a, b| a.day.cmp(&b.day));
        Ok(entries)
    }
}

#[async_trait]
impl ItemCatalog for JsonStorage {
    async fn register_item(&self, item: &CatalogItem) -> Result<()> {
        check_slot_name(item.id.as_str())?;
        let json = serde_json::to_vec_pretty(item)?;
        write_atomic(&self.item_path(&item.id), &json).await
    }

    async fn load_item(&self, id: &ItemId) -> Result<Option<CatalogItem>> {
        if check_slot_name(id.as_str()).is_err() {
            return Ok(None);
        }
        read_json(&self.item_path(id)).await
    }

    async fn list_items(&self) -> Result<Vec<CatalogItem>> {
        let mut items: Vec<CatalogItem> = list_dir(&self.root.join("items")).await?;
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(items)
    }

    async fn remove_item(&self, id: &ItemId) -> Result<bool> {
        if check_slot_name(id.as_str()).is_err() {
            return Ok(false);
        }
        match fs::remove_file(self.item_path(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Concurrent writers to one path each get their own temp file.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!("{}.tmp", Ulid::new()));
    if let Err(e) = fs::write(&tmp, bytes).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn list_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        if entry.path().extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        match read_json(&entry.path()).await {
            Ok(Some(item)) => items.push(item),
            Ok(None) => {}
            Err(e) => warn!("Skipping unreadable file {}: {}", entry.path().display(), e),
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::ItemKind;

    fn day(d: u32) -> CalendarDay {
        CalendarDay::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[tokio::test]
    async fn test_slot_roundtrip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path()).await.unwrap();

        assert!(storage.read_slot("progress").await.unwrap().is_none());
        storage.write_slot("progress", b"{}").await.unwrap();
        assert_eq!(storage.read_slot("progress").await.unwrap().unwrap(), b"{}");

        storage.clear_slot("progress").await.unwrap();
        storage.clear_slot("progress").await.unwrap();
        assert!(storage.read_slot("progress").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_slot_writes_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let storage = std::sync::Arc::new(JsonStorage::new(dir.path()).await.unwrap());

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let storage = storage.clone();
                tokio::spawn(async move {
                    let payload = i.to_string();
                    storage.write_slot("progress", payload.as_bytes()).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let payload = storage.read_slot("progress").await.unwrap().unwrap();
        let value: u32 = String::from_utf8(payload).unwrap().parse().unwrap();
        assert!(value < 32);

        let mut leftovers = std::fs::read_dir(dir.path().join("slots")).unwrap();
        assert!(leftovers.all(|e| e.unwrap().path().extension().unwrap() == "json"));
    }

    #[tokio::test]
    async fn test_slot_name_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path()).await.unwrap();
        assert!(storage.write_slot("../evil", b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_replace_keeps_one_entry_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path()).await.unwrap();
        let item = ItemId::from("reading");

        storage.replace_entries(&item, day(1), 10).await.unwrap();
        storage.replace_entries(&item, day(1), 25).await.unwrap();
        storage.replace_entries(&item, day(2), 5).await.unwrap();

        let entries = storage.entries(&item, day(1)).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, 25);

        let history = storage.history(&item).await.unwrap();
        assert_eq!(history.iter().map(|e| e.amount).collect::<Vec<_>>(), vec![25, 5]);
    }

    #[tokio::test]
    async fn test_catalog_operations() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path()).await.unwrap();

        let item = CatalogItem::new("Meditate", ItemKind::Timer);
        storage.register_item(&item).await.unwrap();

        assert_eq!(storage.kind_of(&item.id).await.unwrap(), Some(ItemKind::Timer));
        assert_eq!(storage.list_items().await.unwrap().len(), 1);

        assert!(storage.remove_item(&item.id).await.unwrap());
        assert!(!storage.remove_item(&item.id).await.unwrap());
        assert!(storage.load_item(&item.id).await.unwrap().is_none());
    }
}
