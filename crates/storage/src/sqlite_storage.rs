//! SQLite storage backend for Tally.
//!
//! Keeps slots, catalog items and completion history in one database.
//! Completion replacement runs inside a single SQL transaction.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::Row;
use std::path::Path;
use tally_core::{CalendarDay, CatalogItem, CompletionEntry, ItemId};
use tracing::{debug, warn};

use super::trait_::{check_slot_name, CompletionStore, ItemCatalog, Result, SnapshotSlot, StorageError};

/// SQLite storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
    /// Database connection pool
    pool: sqlx::SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance.
    pub async fn new(db_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .connect(db_url)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.init_schema().await?;

        Ok(storage)
    }

    /// Create a new SQLite storage instance from a path, creating the file.
    pub async fn new_from_path(path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", path.display());
        Self::new(&url).await
    }

    /// Create an in-memory SQLite storage for testing.
    pub async fn in_memory() -> Result<Self> {
        // One connection, otherwise every pooled connection sees its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.init_schema().await?;

        Ok(storage)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS slots (
                name TEXT PRIMARY KEY,
                payload BLOB NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS items (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS completions (
                item_id TEXT NOT NULL,
                day TEXT NOT NULL,
                amount INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_completions_item_day ON completions(item_id, day)")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        Ok(())
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<CompletionEntry> {
        let item_id: String = row.try_get("item_id").map_err(|e| StorageError::Other(e.to_string()))?;
        let day: String = row.try_get("day").map_err(|e| StorageError::Other(e.to_string()))?;
        let amount: i64 = row.try_get("amount").map_err(|e| StorageError::Other(e.to_string()))?;

        let day = CalendarDay::parse_from_str(&day, "%Y-%m-%d")
            .map_err(|e| StorageError::Other(format!("bad day {day:?}: {e}")))?;

        Ok(CompletionEntry::new(ItemId::from(item_id.as_str()), day, amount.max(0) as u64))
    }
}

#[async_trait]
impl SnapshotSlot for SqliteStorage {
    async fn read_slot(&self, name: &str) -> Result<Option<Vec<u8>>> {
        check_slot_name(name)?;
        let row = sqlx::query("SELECT payload FROM slots WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        match row {
            Some(row) => {
                let payload: Vec<u8> = row.try_get("payload").map_err(|e| StorageError::Other(e.to_string()))?;
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }

    async fn write_slot(&self, name: &str, payload: &[u8]) -> Result<()> {
        check_slot_name(name)?;
        sqlx::query("INSERT OR REPLACE INTO slots (name, payload, updated_at) VALUES (?, ?, ?)")
            .bind(name)
            .bind(payload)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }

    async fn clear_slot(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM slots WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl CompletionStore for SqliteStorage {
    async fn entries(&self, item: &ItemId, day: CalendarDay) -> Result<Vec<CompletionEntry>> {
        let rows = sqlx::query("SELECT item_id, day, amount FROM completions WHERE item_id = ? AND day = ?")
            .bind(item.as_str())
            .bind(day.format("%Y-%m-%d").to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn replace_entries(
        &self,
        item: &ItemId,
        day: CalendarDay,
        amount: u64,
    ) -> Result<CompletionEntry> {
        let day_str = day.format("%Y-%m-%d").to_string();
        let amount_i64 = i64::try_from(amount)
            .map_err(|_| StorageError::Other(format!("amount {amount} out of range")))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        let deleted = sqlx::query("DELETE FROM completions WHERE item_id = ? AND day = ?")
            .bind(item.as_str())
            .bind(day_str.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Transaction(e.to_string()))?
            .rows_affected();

        sqlx::query("INSERT INTO completions (item_id, day, amount) VALUES (?, ?, ?)")
            .bind(item.as_str())
            .bind(day_str.as_str())
            .bind(amount_i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        debug!("Replaced {} rows for {} on {} with amount {}", deleted, item, day_str, amount);
        Ok(CompletionEntry::new(item.clone(), day, amount))
    }

    async fn history(&self, item: &ItemId) -> Result<Vec<CompletionEntry>> {
        let rows = sqlx::query("SELECT item_id, day, amount FROM completions WHERE item_id = ? ORDER BY day ASC")
            .bind(item.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.iter().map(Self::row_to_entry).collect()
    }
}

#[async_trait]
impl ItemCatalog for SqliteStorage {
    async fn register_item(&self, item: &CatalogItem) -> Result<()> {
        let data = serde_json::to_string(item)?;
        sqlx::query("INSERT OR REPLACE INTO items (id, data) VALUES (?, ?)")
            .bind(item.id.as_str())
            .bind(data)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }

    async fn load_item(&self, id: &ItemId) -> Result<Option<CatalogItem>> {
        let row = sqlx::query("SELECT data FROM items WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        match row {
            Some(row) => {
                let data: String = row.try_get("data").map_err(|e| StorageError::Other(e.to_string()))?;
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn list_items(&self) -> Result<Vec<CatalogItem>> {
        let rows = sqlx::query("SELECT data FROM items")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let data: String = row.try_get("data").map_err(|e| StorageError::Other(e.to_string()))?;
            match serde_json::from_str::<CatalogItem>(&data) {
                Ok(item) => items.push(item),
                Err(e) => warn!("Skipping unreadable catalog row: {}", e),
            }
        }
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(items)
    }

    async fn remove_item(&self, id: &ItemId) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM items WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?
            .rows_affected();
        Ok(affected > 0)
    }
}
