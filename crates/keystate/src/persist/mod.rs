//! Persistence coordinator: mirrors engine snapshots into a storage adapter.
//!
//! The whole filtered snapshot lives in one storage slot named
//! `"{key_prefix}_all"` as a JSON object. Saves are handed to a single
//! background writer task, which debounces them, skips writes whose content
//! matches the last successful write, and never lets two writes overlap.
//!
//! Failures never reach the engine: read problems fall back to the defaults
//! and are reported through `on_load_error`, write problems leave the live
//! state alone and are reported through `on_save_error`.

mod filter;
mod writer;

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::adapter::StorageAdapter;
use crate::bus::panic_message;
use crate::error::{StateError, StateResult, StorageError};
use crate::value::Snapshot;

pub use filter::{KeyFilter, KeyPredicate};

use writer::Command;

/// Default storage namespace.
pub const DEFAULT_KEY_PREFIX: &str = "keystate";

/// Called with the read error and the storage key that failed.
pub type LoadErrorCallback = Arc<dyn Fn(&StateError, &str) + Send + Sync>;

/// Called with the write error and the snapshot that was not written.
pub type SaveErrorCallback = Arc<dyn Fn(&StateError, &Snapshot) + Send + Sync>;

/// Boxed future returned by a custom save callback.
pub type SaveFuture = Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send>>;

/// Replacement for the default write: `(filtered snapshot, adapter, key_prefix)`.
pub type CustomSave =
    Arc<dyn Fn(Snapshot, Arc<dyn StorageAdapter>, String) -> SaveFuture + Send + Sync>;

// ── Configuration ──────────────────────────────────────────────────

/// Persistence settings for one coordinator.
#[derive(Clone)]
pub struct PersistConfig {
    pub adapter: Arc<dyn StorageAdapter>,
    /// Namespace of the storage slot.
    pub key_prefix: String,
    pub persist_keys: KeyFilter,
    /// Hydrate synchronously when the engine is built.
    pub load_on_init: bool,
    /// Let the engine schedule a save after every mutation.
    pub save_on_change: bool,
    /// Quiet period before a write. Zero writes as soon as possible.
    pub debounce: Duration,
    pub on_load_error: Option<LoadErrorCallback>,
    pub on_save_error: Option<SaveErrorCallback>,
    pub custom_save: Option<CustomSave>,
}

impl PersistConfig {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            adapter,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            persist_keys: KeyFilter::All,
            load_on_init: true,
            save_on_change: true,
            debounce: Duration::ZERO,
            on_load_error: None,
            on_save_error: None,
            custom_save: None,
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_persist_keys(mut self, filter: impl Into<KeyFilter>) -> Self {
        self.persist_keys = filter.into();
        self
    }

    pub fn with_load_on_init(mut self, load: bool) -> Self {
        self.load_on_init = load;
        self
    }

    pub fn with_save_on_change(mut self, save: bool) -> Self {
        self.save_on_change = save;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn on_load_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&StateError, &str) + Send + Sync + 'static,
    {
        self.on_load_error = Some(Arc::new(callback));
        self
    }

    pub fn on_save_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&StateError, &Snapshot) + Send + Sync + 'static,
    {
        self.on_save_error = Some(Arc::new(callback));
        self
    }

    pub fn with_custom_save<F>(mut self, save: F) -> Self
    where
        F: Fn(Snapshot, Arc<dyn StorageAdapter>, String) -> SaveFuture + Send + Sync + 'static,
    {
        self.custom_save = Some(Arc::new(save));
        self
    }

    /// The one storage slot holding the whole snapshot.
    pub fn storage_key(&self) -> String {
        format!("{}_all", self.key_prefix)
    }
}

impl fmt::Debug for PersistConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistConfig")
            .field("adapter", &self.adapter.name())
            .field("key_prefix", &self.key_prefix)
            .field("persist_keys", &self.persist_keys)
            .field("load_on_init", &self.load_on_init)
            .field("save_on_change", &self.save_on_change)
            .field("debounce", &self.debounce)
            .field("custom_save", &self.custom_save.is_some())
            .finish_non_exhaustive()
    }
}

// ── Coordinator ────────────────────────────────────────────────────

/// State shared between coordinator handles and the writer task.
struct Shared {
    config: PersistConfig,
    storage_key: String,
    /// Last successfully written (or hydrated) filtered snapshot.
    baseline: Mutex<Option<Snapshot>>,
    /// Set once hydration has applied, so it never applies twice.
    loaded: AtomicBool,
}

impl Shared {
    fn baseline(&self) -> MutexGuard<'_, Option<Snapshot>> {
        self.baseline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report_load_error(&self, reason: String) {
        let err = StateError::PersistenceRead {
            key: self.storage_key.clone(),
            reason,
        };
        warn!(key = %self.storage_key, error = %err, "hydration failed, keeping defaults");
        if let Some(callback) = &self.config.on_load_error {
            run_callback("on_load_error", &self.storage_key, || callback(&err, &self.storage_key));
        }
    }

    fn report_save_error(&self, err: &StateError, snapshot: &Snapshot) {
        if let Some(callback) = &self.config.on_save_error {
            run_callback("on_save_error", &self.storage_key, || callback(err, snapshot));
        }
    }

    /// Merge the raw stored payload over `current`.
    fn merge_stored(&self, current: &Snapshot, raw: Option<String>) -> Snapshot {
        let Some(raw) = raw else {
            debug!(key = %self.storage_key, "no stored state");
            self.loaded.store(true, Ordering::SeqCst);
            return current.clone();
        };

        match serde_json::from_str::<Snapshot>(&raw) {
            Ok(stored) => {
                let mut merged = current.clone();
                merged.extend(stored.iter().map(|(k, v)| (k.clone(), v.clone())));
                debug!(key = %self.storage_key, restored = stored.len(), "stored state merged");
                *self.baseline() = Some(stored);
                self.loaded.store(true, Ordering::SeqCst);
                merged
            }
            Err(e) => {
                // Re-reading would find the same payload, so this counts as loaded.
                self.loaded.store(true, Ordering::SeqCst);
                self.report_load_error(format!("malformed stored state: {e}"));
                current.clone()
            }
        }
    }
}

/// Invoke a user callback, logging a panic instead of letting it unwind into
/// the engine or the writer task.
fn run_callback(name: &str, key: &str, f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        let message = panic_message(payload.as_ref());
        error!(%key, callback = name, panic = %message, "persistence callback panicked");
    }
}

/// Handle to a persistence pipeline. Clones share the same writer.
#[derive(Clone)]
pub struct PersistenceCoordinator {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl PersistenceCoordinator {
    /// Create a coordinator whose writer runs on the current tokio runtime.
    pub fn new(config: PersistConfig) -> StateResult<Self> {
        let handle = Handle::try_current().map_err(|e| StateError::Runtime(e.to_string()))?;
        Ok(Self::with_handle(config, &handle))
    }

    /// Create a coordinator whose writer runs on `handle`.
    pub fn with_handle(config: PersistConfig, handle: &Handle) -> Self {
        let storage_key = config.storage_key();
        let shared = Arc::new(Shared {
            config,
            storage_key,
            baseline: Mutex::new(None),
            loaded: AtomicBool::new(false),
        });
        let (commands, rx) = mpsc::unbounded_channel();
        handle.spawn(writer::run(Arc::clone(&shared), rx));
        debug!(
            key = %shared.storage_key,
            adapter = shared.config.adapter.name(),
            debounce = ?shared.config.debounce,
            "persistence coordinator started"
        );
        Self { shared, commands }
    }

    pub fn config(&self) -> &PersistConfig {
        &self.shared.config
    }

    pub fn storage_key(&self) -> &str {
        &self.shared.storage_key
    }

    pub fn is_loaded(&self) -> bool {
        self.shared.loaded.load(Ordering::SeqCst)
    }

    /// Hydrate through the adapter's synchronous read path, if it has one.
    ///
    /// Stored values win over `current`; keys missing from storage keep
    /// their value from `current`. Any failure yields `current` unchanged.
    pub fn hydrate_sync(&self, current: &Snapshot) -> Snapshot {
        let Some(sync) = self.shared.config.adapter.sync_storage() else {
            debug!(adapter = self.shared.config.adapter.name(), "no synchronous read path");
            return current.clone();
        };
        match sync.get_item_sync(&self.shared.storage_key) {
            Ok(raw) => self.shared.merge_stored(current, raw),
            Err(e) => {
                self.shared.report_load_error(e.to_string());
                current.clone()
            }
        }
    }

    /// Hydrate through the asynchronous read path.
    ///
    /// Runs at most once per coordinator, and not at all once the synchronous
    /// path has seen the stored payload, valid or malformed. Only a failed
    /// synchronous read leaves it to run. Later calls return `current`
    /// unchanged.
    pub async fn hydrate_async(&self, current: &Snapshot) -> Snapshot {
        if self.shared.loaded.swap(true, Ordering::SeqCst) {
            debug!(key = %self.shared.storage_key, "already hydrated");
            return current.clone();
        }
        match self.shared.config.adapter.get_item(&self.shared.storage_key).await {
            Ok(raw) => self.shared.merge_stored(current, raw),
            Err(e) => {
                self.shared.report_load_error(e.to_string());
                current.clone()
            }
        }
    }

    /// Request a save of `snapshot`. Returns immediately.
    pub fn save(&self, snapshot: &Snapshot) {
        let filtered = self.shared.config.persist_keys.apply(snapshot);
        self.send(Command::Save(filtered));
    }

    /// Write any pending save now and wait until the writer is idle.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.send(Command::Flush(done)) {
            let _ = wait.await;
        }
    }

    /// Drop a pending debounced save. A write already in flight finishes.
    pub fn cancel_pending(&self) {
        self.send(Command::Cancel);
    }

    /// Delete the storage slot and forget the baseline.
    pub async fn purge(&self) {
        let (done, wait) = oneshot::channel();
        if self.send(Command::Purge(done)) {
            let _ = wait.await;
        }
    }

    fn send(&self, command: Command) -> bool {
        let sent = self.commands.send(command).is_ok();
        if !sent {
            warn!(key = %self.shared.storage_key, "persistence writer has stopped");
        }
        sent
    }
}

impl fmt::Debug for PersistenceCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceCoordinator")
            .field("storage_key", &self.shared.storage_key)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;
    use crate::value::StateValue;
    use serde_json::json;

    fn snapshot(pairs: &[(&str, serde_json::Value)]) -> Snapshot {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), StateValue::from(v.clone())))
            .collect()
    }

    #[test]
    fn storage_key_uses_prefix() {
        let config = PersistConfig::new(Arc::new(MemoryAdapter::new())).with_key_prefix("app");
        assert_eq!(config.storage_key(), "app_all");
    }

    #[test]
    fn construction_outside_a_runtime_fails() {
        let err = PersistenceCoordinator::new(PersistConfig::new(Arc::new(MemoryAdapter::new())))
            .unwrap_err();
        assert!(matches!(err, StateError::Runtime(_)));
    }

    #[tokio::test]
    async fn sync_hydration_merges_stored_over_defaults() {
        let adapter = Arc::new(MemoryAdapter::with_items([("app_all", r#"{"a":99}"#)]));
        let coordinator =
            PersistenceCoordinator::new(PersistConfig::new(adapter).with_key_prefix("app")).unwrap();

        let merged = coordinator.hydrate_sync(&snapshot(&[("a", json!(1)), ("b", json!(2))]));

        assert_eq!(merged, snapshot(&[("a", json!(99)), ("b", json!(2))]));
        assert!(coordinator.is_loaded());
    }

    #[tokio::test]
    async fn async_hydration_applies_only_once() {
        let adapter = Arc::new(MemoryAdapter::with_items([("app_all", r#"{"a":99}"#)]));
        let coordinator =
            PersistenceCoordinator::new(PersistConfig::new(adapter).with_key_prefix("app")).unwrap();
        let defaults = snapshot(&[("a", json!(1))]);

        let first = coordinator.hydrate_async(&defaults).await;
        let second = coordinator.hydrate_async(&defaults).await;

        assert_eq!(first, snapshot(&[("a", json!(99))]));
        assert_eq!(second, defaults);
    }

    #[tokio::test]
    async fn hydration_seeds_the_write_baseline() {
        let adapter = Arc::new(MemoryAdapter::with_items([("app_all", r#"{"a":1}"#)]));
        let coordinator = PersistenceCoordinator::new(
            PersistConfig::new(adapter.clone()).with_key_prefix("app"),
        )
        .unwrap();

        let merged = coordinator.hydrate_sync(&Snapshot::new());
        adapter.set_item("app_all", "sentinel").await.unwrap();
        coordinator.save(&merged);
        coordinator.flush().await;

        // Same content as hydrated, so the writer left the slot alone.
        assert_eq!(adapter.raw("app_all").as_deref(), Some("sentinel"));
    }

    #[tokio::test]
    async fn purge_removes_the_slot() {
        let adapter = Arc::new(MemoryAdapter::new());
        let coordinator =
            PersistenceCoordinator::new(PersistConfig::new(adapter.clone())).unwrap();

        coordinator.save(&snapshot(&[("a", json!(1))]));
        coordinator.flush().await;
        assert!(adapter.raw("keystate_all").is_some());

        coordinator.purge().await;
        assert!(adapter.raw("keystate_all").is_none());

        // Baseline was forgotten, so the same content is written again.
        coordinator.save(&snapshot(&[("a", json!(1))]));
        coordinator.flush().await;
        assert_eq!(adapter.raw("keystate_all").as_deref(), Some(r#"{"a":1}"#));
    }
}
