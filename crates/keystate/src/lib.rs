//! keystate: key-addressed state engine for reactive bindings.
//!
//! The engine keeps an authoritative `key → value` map in memory, notifies
//! per-key subscribers synchronously on every change, and can mirror its
//! contents into an asynchronous key/value backend.
//!
//! # Architecture
//!
//! - [`ChangeBus`] holds subscriptions and delivers change events.
//! - [`StateEngine`] owns the map and applies change suppression before
//!   anything is emitted or persisted.
//! - [`PersistenceCoordinator`] filters, debounces and de-duplicates writes
//!   through a single background writer task, and hydrates the engine from
//!   storage on startup.
//! - [`StorageAdapter`] is the capability the coordinator talks to. Pick one
//!   with [`detect_best_adapter`] or inject your own.
//!
//! All values are JSON values (`serde_json::Value`) behind a cheap shared
//! handle, so everything in the store is always serializable.

pub mod adapter;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod persist;
pub mod value;

pub use adapter::{
    detect_best_adapter, AdapterPreference, MemoryAdapter, NoopAdapter, RedbAdapter,
    StorageAdapter, SyncStorage,
};
pub use bus::{ChangeBus, Listener, Subscription};
pub use config::StoreConfig;
pub use engine::{EngineConfig, StateEngine};
pub use error::{StateError, StateResult, StorageError};
pub use persist::{KeyFilter, PersistConfig, PersistenceCoordinator};
pub use value::{Equality, Snapshot, StateValue};
