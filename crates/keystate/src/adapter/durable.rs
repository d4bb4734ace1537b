//! Durable adapter backed by redb.
//!
//! Everything lives in one `entries` table with `&str` keys and `&str`
//! values. redb calls are blocking, so the async methods hop onto tokio's
//! blocking pool; the sync read path calls redb directly.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;

use super::{AdapterFuture, StorageAdapter, SyncStorage};
use crate::error::StorageError;

/// Raw persisted strings keyed by storage key.
const ENTRIES: TableDefinition<&str, &str> = TableDefinition::new("entries");

/// Convert any `Display` error into a `StorageError::Backend`.
macro_rules! map_err {
    () => {
        |e| StorageError::Backend(e.to_string())
    };
}

/// Thread-safe adapter over a redb database.
#[derive(Clone)]
pub struct RedbAdapter {
    db: Arc<Database>,
}

impl std::fmt::Debug for RedbAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbAdapter").finish_non_exhaustive()
    }
}

impl RedbAdapter {
    /// Open (or create) a store file at `path`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let db = Database::create(path).map_err(|e| StorageError::Unavailable(e.to_string()))?;
        let adapter = Self { db: Arc::new(db) };
        adapter.ensure_table()?;
        debug!(?path, "redb store opened");
        Ok(adapter)
    }

    /// Ephemeral in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        let adapter = Self { db: Arc::new(db) };
        adapter.ensure_table()?;
        debug!("in-memory redb store opened");
        Ok(adapter)
    }

    fn ensure_table(&self) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(map_err!())?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ENTRIES).map_err(map_err!())?;
        txn.commit().map_err(map_err!())?;
        Ok(())
    }

    fn read(db: &Database, key: &str) -> Result<Option<String>, StorageError> {
        let txn = db.begin_read().map_err(map_err!())?;
        let table = txn.open_table(ENTRIES).map_err(map_err!())?;
        let value = table
            .get(key)
            .map_err(map_err!())?
            .map(|guard| guard.value().to_string());
        Ok(value)
    }

    fn write(db: &Database, key: &str, value: &str) -> Result<(), StorageError> {
        let txn = db.begin_write().map_err(map_err!())?;
        {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!())?;
            table.insert(key, value).map_err(map_err!())?;
        }
        txn.commit().map_err(map_err!())?;
        Ok(())
    }

    fn delete(db: &Database, key: &str) -> Result<(), StorageError> {
        let txn = db.begin_write().map_err(map_err!())?;
        {
            let mut table = txn.open_table(ENTRIES).map_err(map_err!())?;
            table.remove(key).map_err(map_err!())?;
        }
        txn.commit().map_err(map_err!())?;
        Ok(())
    }

    /// Run a blocking redb call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StorageError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StorageError::Backend(format!("blocking task failed: {e}")))?
    }
}

impl StorageAdapter for RedbAdapter {
    fn name(&self) -> &'static str {
        "redb"
    }

    fn get_item<'a>(&'a self, key: &'a str) -> AdapterFuture<'a, Option<String>> {
        let key = key.to_string();
        Box::pin(self.blocking(move |db| Self::read(db, &key)))
    }

    fn set_item<'a>(&'a self, key: &'a str, value: &'a str) -> AdapterFuture<'a, ()> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(self.blocking(move |db| Self::write(db, &key, &value)))
    }

    fn remove_item<'a>(&'a self, key: &'a str) -> AdapterFuture<'a, ()> {
        let key = key.to_string();
        Box::pin(self.blocking(move |db| Self::delete(db, &key)))
    }

    fn sync_storage(&self) -> Option<&dyn SyncStorage> {
        Some(self)
    }
}

impl SyncStorage for RedbAdapter {
    fn get_item_sync(&self, key: &str) -> Result<Option<String>, StorageError> {
        Self::read(&self.db, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_set_get_remove() {
        let adapter = RedbAdapter::open_in_memory().unwrap();
        assert_eq!(adapter.get_item("app_all").await.unwrap(), None);

        adapter.set_item("app_all", r#"{"a":1}"#).await.unwrap();
        assert_eq!(
            adapter.get_item("app_all").await.unwrap().as_deref(),
            Some(r#"{"a":1}"#)
        );
        assert_eq!(
            adapter.get_item_sync("app_all").unwrap().as_deref(),
            Some(r#"{"a":1}"#)
        );

        adapter.remove_item("app_all").await.unwrap();
        assert_eq!(adapter.get_item("app_all").await.unwrap(), None);
        adapter.remove_item("app_all").await.unwrap();
    }

    #[tokio::test]
    async fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");

        {
            let adapter = RedbAdapter::open(&path).unwrap();
            adapter.set_item("app_all", r#"{"theme":"dark"}"#).await.unwrap();
        }

        // Reopen the same database file.
        let adapter = RedbAdapter::open(&path).unwrap();
        assert_eq!(
            adapter.get_item_sync("app_all").unwrap().as_deref(),
            Some(r#"{"theme":"dark"}"#)
        );
    }
}
