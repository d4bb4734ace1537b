//! Storage adapters: the capability the persistence coordinator writes to.
//!
//! An adapter exposes asynchronous get/set/remove by string key. Adapters
//! that can also answer reads synchronously advertise it through
//! [`StorageAdapter::sync_storage`], which lets the engine hydrate before the
//! first consumer read.
//!
//! Three adapters ship with the crate:
//!
//! - [`RedbAdapter`]: durable, one redb table in a single file.
//! - [`MemoryAdapter`]: process-local map (tests, ephemeral sessions).
//! - [`NoopAdapter`]: discards writes, reads nothing.
//!
//! [`detect_best_adapter`] picks the richest one that works here.

mod durable;
mod memory;
mod noop;

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::StorageError;

pub use durable::RedbAdapter;
pub use memory::MemoryAdapter;
pub use noop::NoopAdapter;

/// Boxed future returned by adapter operations.
pub type AdapterFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Asynchronous key/value backend.
pub trait StorageAdapter: Send + Sync + fmt::Debug {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Read the raw string stored under `key`.
    fn get_item<'a>(&'a self, key: &'a str) -> AdapterFuture<'a, Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    fn set_item<'a>(&'a self, key: &'a str, value: &'a str) -> AdapterFuture<'a, ()>;

    /// Delete `key`. Deleting a missing key succeeds.
    fn remove_item<'a>(&'a self, key: &'a str) -> AdapterFuture<'a, ()>;

    /// Synchronous read capability, if the backend has one.
    fn sync_storage(&self) -> Option<&dyn SyncStorage> {
        None
    }
}

/// Optional synchronous read path used for hydration at construction time.
pub trait SyncStorage: Send + Sync {
    fn get_item_sync(&self, key: &str) -> Result<Option<String>, StorageError>;
}

// ── Detection ──────────────────────────────────────────────────────

/// What the caller would like to use, in priority order.
#[derive(Debug, Clone, Default)]
pub struct AdapterPreference {
    /// Durable store location. `None` skips the durable candidate.
    pub path: Option<PathBuf>,
    /// Fall back to an in-memory map when no durable store is usable.
    pub memory_fallback: bool,
}

impl AdapterPreference {
    pub fn durable(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            memory_fallback: true,
        }
    }

    pub fn memory() -> Self {
        Self {
            path: None,
            memory_fallback: true,
        }
    }
}

/// Pick the richest adapter available: durable redb file, then in-memory
/// map (if allowed), then the no-op adapter.
///
/// Never fails. Rejected candidates are logged.
pub fn detect_best_adapter(preference: &AdapterPreference) -> Arc<dyn StorageAdapter> {
    if let Some(path) = &preference.path {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "cannot create store directory");
            }
        }
        match RedbAdapter::open(path) {
            Ok(adapter) => {
                info!(path = %path.display(), "using durable redb storage");
                return Arc::new(adapter);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "durable storage unavailable");
            }
        }
    }

    if preference.memory_fallback {
        info!("using in-memory storage");
        return Arc::new(MemoryAdapter::new());
    }

    info!("no storage available, persistence disabled");
    Arc::new(NoopAdapter)
}
