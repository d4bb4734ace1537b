use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{AdapterFuture, StorageAdapter, SyncStorage};
use crate::error::StorageError;

/// Process-local adapter backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate with raw stored strings.
    pub fn with_items<I, K, V>(items: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            items: Mutex::new(
                items
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    /// Raw stored string for `key`.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.items().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    fn items(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StorageAdapter for MemoryAdapter {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get_item<'a>(&'a self, key: &'a str) -> AdapterFuture<'a, Option<String>> {
        let value = self.raw(key);
        Box::pin(async move { Ok(value) })
    }

    fn set_item<'a>(&'a self, key: &'a str, value: &'a str) -> AdapterFuture<'a, ()> {
        self.items().insert(key.to_string(), value.to_string());
        Box::pin(async { Ok(()) })
    }

    fn remove_item<'a>(&'a self, key: &'a str) -> AdapterFuture<'a, ()> {
        self.items().remove(key);
        Box::pin(async { Ok(()) })
    }

    fn sync_storage(&self) -> Option<&dyn SyncStorage> {
        Some(self)
    }
}

impl SyncStorage for MemoryAdapter {
    fn get_item_sync(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.raw(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_remove() {
        let adapter = MemoryAdapter::new();
        assert_eq!(adapter.get_item("k").await.unwrap(), None);

        adapter.set_item("k", "v1").await.unwrap();
        adapter.set_item("k", "v2").await.unwrap();
        assert_eq!(adapter.get_item("k").await.unwrap().as_deref(), Some("v2"));
        assert_eq!(adapter.get_item_sync("k").unwrap().as_deref(), Some("v2"));

        adapter.remove_item("k").await.unwrap();
        adapter.remove_item("k").await.unwrap();
        assert!(adapter.is_empty());
    }

    #[test]
    fn with_items_is_visible_synchronously() {
        let adapter = MemoryAdapter::with_items([("app_all", r#"{"a":1}"#)]);
        let sync = adapter.sync_storage().unwrap();
        assert_eq!(sync.get_item_sync("app_all").unwrap().as_deref(), Some(r#"{"a":1}"#));
        assert_eq!(adapter.len(), 1);
    }
}
