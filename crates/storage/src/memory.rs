//! In-memory storage, for tests and ephemeral hosts.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tally_core::{CalendarDay, CatalogItem, CompletionEntry, ItemId};
use tokio::sync::Mutex;

use super::trait_::{check_slot_name, CompletionStore, ItemCatalog, Result, SnapshotSlot};

/// Storage backend that keeps everything in process memory.
#[derive(Default)]
pub struct InMemoryStorage {
    slots: Mutex<HashMap<String, Vec<u8>>>,
    completions: Mutex<Vec<CompletionEntry>>,
    items: Mutex<BTreeMap<ItemId, CatalogItem>>,
}

impl InMemoryStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create storage with the given items already registered.
    pub fn with_items(items: impl IntoIterator<Item = CatalogItem>) -> Self {
        let items = items.into_iter().map(|item| (item.id.clone(), item)).collect();
        Self {
            items: Mutex::new(items),
            ..Self::default()
        }
    }

    /// Every stored completion entry, in insertion order.
    pub async fn all_entries(&self) -> Vec<CompletionEntry> {
        self.completions.lock().await.clone()
    }
}

#[async_trait]
impl SnapshotSlot for InMemoryStorage {
    async fn read_slot(&self, name: &str) -> Result<Option<Vec<u8>>> {
        check_slot_name(name)?;
        Ok(self.slots.lock().await.get(name).cloned())
    }

    async fn write_slot(&self, name: &str, payload: &[u8]) -> Result<()> {
        check_slot_name(name)?;
        self.slots.lock().await.insert(name.to_string(), payload.to_vec());
        Ok(())
    }

    async fn clear_slot(&self, name: &str) -> Result<()> {
        self.slots.lock().await.remove(name);
        Ok(())
    }
}

#[async_trait]
impl CompletionStore for InMemoryStorage {
    async fn entries(&self, item: &ItemId, day: CalendarDay) -> Result<Vec<CompletionEntry>> {
        let all = self.completions.lock().await;
        Ok(all.iter().filter(|e| e.is_for(item, day)).cloned().collect())
    }

    async fn replace_entries(
        &self,
        item: &ItemId,
        day: CalendarDay,
        amount: u64,
    ) -> Result<CompletionEntry> {
        let mut all = self.completions.lock().await;
        all.retain(|e| !e.is_for(item, day));
        let entry = CompletionEntry::new(item.clone(), day, amount);
        all.push(entry.clone());
        Ok(entry)
    }

    async fn history(&self, item: &ItemId) -> Result<Vec<CompletionEntry>> {
        let all = self.completions.lock().await;
        let mut entries: Vec<_> = all.iter().filter(|e| &e.item_id == item).cloned().collect();
        entries.sort_by(|a, b| a.day.cmp(&b.day));
        Ok(entries)
    }
}

#[async_trait]
impl ItemCatalog for InMemoryStorage {
    async fn register_item(&self, item: &CatalogItem) -> Result<()> {
        self.items.lock().await.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn load_item(&self, id: &ItemId) -> Result<Option<CatalogItem>> {
        Ok(self.items.lock().await.get(id).cloned())
    }

    async fn list_items(&self) -> Result<Vec<CatalogItem>> {
        Ok(self.items.lock().await.values().cloned().collect())
    }

    async fn remove_item(&self, id: &ItemId) -> Result<bool> {
        Ok(self.items.lock().await.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::ItemKind;

    #[tokio::test]
    async fn test_replace_is_full_replace() {
        let storage = InMemoryStorage::new();
        let item = ItemId::from("pushups");
        let day = CalendarDay::from_ymd_opt(2024, 5, 1).unwrap();

        storage.replace_entries(&item, day, 3).await.unwrap();
        storage.replace_entries(&item, day, 8).await.unwrap();

        let all = storage.all_entries().await;
        assert_eq!(all, vec![CompletionEntry::new(item, day, 8)]);
    }

    #[tokio::test]
    async fn test_with_items_registers_catalog() {
        let item = CatalogItem::new("Water", ItemKind::Counter);
        let storage = InMemoryStorage::with_items([item.clone()]);
        assert_eq!(storage.kind_of(&item.id).await.unwrap(), Some(ItemKind::Counter));
        assert_eq!(storage.kind_of(&ItemId::new()).await.unwrap(), None);
    }
}
