//! StateEngine: the authoritative key/value map.
//!
//! Every mutation runs to completion synchronously: the map is updated, change
//! events are emitted, and only then does the call return. A subscriber that
//! observes a change always sees the map already reflecting it.
//!
//! Writes that would not change the observable value are suppressed entirely
//! (no mutation, no event, no save). Which writes count as no-ops is decided
//! by an [`Equality`] strategy: per call, per key, or engine-wide.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bus::{ChangeBus, Subscription};
use crate::error::{StateError, StateResult};
use crate::persist::PersistenceCoordinator;
use crate::value::{Equality, Snapshot, StateValue};

// ── Configuration ──────────────────────────────────────────────────

/// Engine settings.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Log every mutation at `debug` level.
    pub debug: bool,
    /// Contents of the map before any consumer touches it.
    pub initial_state: Snapshot,
    /// Change-suppression strategy for keys without their own.
    pub default_equality: Equality,
    /// Per-key strategies.
    pub key_equality: HashMap<String, Equality>,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_initial_state<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<StateValue>,
    {
        self.initial_state
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_default_equality(mut self, equality: Equality) -> Self {
        self.default_equality = equality;
        self
    }

    pub fn with_key_equality(mut self, key: impl Into<String>, equality: Equality) -> Self {
        self.key_equality.insert(key.into(), equality);
        self
    }
}

// ── Engine ─────────────────────────────────────────────────────────

struct EngineState {
    values: Snapshot,
    /// Keys whose `initialize` call is in progress.
    initializing: HashSet<String>,
    key_equality: HashMap<String, Equality>,
    persistence: Option<PersistenceCoordinator>,
}

struct EngineInner {
    state: Mutex<EngineState>,
    bus: ChangeBus,
    debug: bool,
    default_equality: Equality,
}

/// Shared handle to one store. Clones see the same map and subscribers.
#[derive(Clone)]
pub struct StateEngine {
    inner: Arc<EngineInner>,
}

/// Removes a key from the initialization set when dropped, including during
/// unwinding.
struct InitGuard<'a> {
    engine: &'a StateEngine,
    key: String,
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        self.engine.state().initializing.remove(&self.key);
    }
}

impl StateEngine {
    /// Engine without persistence.
    pub fn new(config: EngineConfig) -> Self {
        Self::build(config, None)
    }

    /// Engine mirrored through `coordinator`.
    ///
    /// With `load_on_init`, stored state is merged over the initial state
    /// right away through the adapter's synchronous read path (if any).
    /// Call [`hydrate`](Self::hydrate) afterwards for the asynchronous path.
    pub fn with_persistence(config: EngineConfig, coordinator: PersistenceCoordinator) -> Self {
        Self::build(config, Some(coordinator))
    }

    fn build(config: EngineConfig, persistence: Option<PersistenceCoordinator>) -> Self {
        let EngineConfig {
            debug,
            initial_state,
            default_equality,
            key_equality,
        } = config;

        let values = match &persistence {
            Some(coordinator) if coordinator.config().load_on_init => {
                coordinator.hydrate_sync(&initial_state)
            }
            _ => initial_state,
        };
        debug!(
            keys = values.len(),
            persistent = persistence.is_some(),
            "state engine created"
        );

        Self {
            inner: Arc::new(EngineInner {
                state: Mutex::new(EngineState {
                    values,
                    initializing: HashSet::new(),
                    key_equality,
                    persistence,
                }),
                bus: ChangeBus::new(),
                debug,
                default_equality,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get(&self, key: &str) -> Option<StateValue> {
        self.state().values.get(key).cloned()
    }

    /// Decode the value under `key` into `T`.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> StateResult<Option<T>> {
        self.get(key).map(|v| v.deserialize()).transpose()
    }

    pub fn has(&self, key: &str) -> bool {
        self.state().values.contains_key(key)
    }

    /// Owned copy of the whole map.
    pub fn get_all(&self) -> Snapshot {
        self.state().values.clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state().values.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().values.is_empty()
    }

    // ── Initialization ─────────────────────────────────────────────

    /// Give `key` its first value.
    ///
    /// A key that already exists is left alone. Fails with
    /// `AlreadyInitializing` while another initialization of the same key is
    /// in progress, and with `MissingKeyNoInitial` when the key is absent and
    /// `initial` is `None`.
    pub fn initialize(&self, key: &str, initial: Option<StateValue>) -> StateResult<()> {
        let Some((_guard, initial)) = self.begin_initialize(key, initial)? else {
            return Ok(());
        };
        let committed = {
            let mut state = self.state();
            if state.values.contains_key(key) {
                false
            } else {
                state.values.insert(key.to_string(), initial.clone());
                true
            }
        };
        if committed {
            self.committed(key, &initial, None);
        }
        Ok(())
    }

    fn begin_initialize(
        &self,
        key: &str,
        initial: Option<StateValue>,
    ) -> StateResult<Option<(InitGuard<'_>, StateValue)>> {
        if key.is_empty() {
            return Err(StateError::InvalidKey);
        }
        let mut state = self.state();
        if state.values.contains_key(key) {
            return Ok(None);
        }
        if state.initializing.contains(key) {
            warn!(%key, "concurrent initialization rejected");
            return Err(StateError::AlreadyInitializing(key.to_string()));
        }
        let Some(initial) = initial else {
            return Err(StateError::MissingKeyNoInitial(key.to_string()));
        };
        state.initializing.insert(key.to_string());
        drop(state);

        let guard = InitGuard {
            engine: self,
            key: key.to_string(),
        };
        Ok(Some((guard, initial)))
    }

    /// Read `key`, initializing it with `default` first if it is absent.
    ///
    /// This is the entry point UI bindings use on mount.
    pub fn get_or_init(&self, key: &str, default: Option<StateValue>) -> StateResult<StateValue> {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        self.initialize(key, default)?;
        self.get(key)
            .ok_or_else(|| StateError::MissingKeyNoInitial(key.to_string()))
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Store `value` under `key`. Returns true when the store changed.
    pub fn set(&self, key: &str, value: impl Into<StateValue>) -> bool {
        let value = value.into();
        self.apply(key, |_| value.clone(), None)
    }

    /// Like [`set`](Self::set), with an explicit change-suppression strategy.
    pub fn set_with(&self, key: &str, value: impl Into<StateValue>, equality: &Equality) -> bool {
        let value = value.into();
        self.apply(key, |_| value.clone(), Some(equality))
    }

    /// Compute the next value from the current one.
    ///
    /// `updater` runs without any lock held. If another writer changes `key`
    /// before the result is committed, `updater` runs again on the newer
    /// value, the way `AtomicUsize::fetch_update` retries.
    pub fn update<F>(&self, key: &str, updater: F) -> bool
    where
        F: FnMut(Option<&StateValue>) -> StateValue,
    {
        self.apply(key, updater, None)
    }

    /// Serialize `value` and store it. Nothing is stored if serialization fails.
    pub fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StateResult<bool> {
        let value = StateValue::from_serialize(value)?;
        Ok(self.set(key, value))
    }

    /// Register the change-suppression strategy for one key.
    pub fn set_equality(&self, key: impl Into<String>, equality: Equality) {
        self.state().key_equality.insert(key.into(), equality);
    }

    fn apply<F>(&self, key: &str, mut next: F, equality: Option<&Equality>) -> bool
    where
        F: FnMut(Option<&StateValue>) -> StateValue,
    {
        if key.is_empty() {
            warn!("write to empty key ignored");
            return false;
        }

        loop {
            let (prev, key_equality) = {
                let state = self.state();
                (
                    state.values.get(key).cloned(),
                    state.key_equality.get(key).cloned(),
                )
            };

            // User code runs with no lock held.
            let candidate = next(prev.as_ref());
            if let Some(prev) = &prev {
                let equality = equality
                    .or(key_equality.as_ref())
                    .unwrap_or(&self.inner.default_equality);
                if equality.matches(prev, &candidate) {
                    return false;
                }
            }

            {
                let mut state = self.state();
                if !same_slot(state.values.get(key), prev.as_ref()) {
                    continue;
                }
                state.values.insert(key.to_string(), candidate.clone());
            }
            self.committed(key, &candidate, prev.as_ref());
            return true;
        }
    }

    /// Log, emit and persist a committed single-key change.
    fn committed(&self, key: &str, next: &StateValue, prev: Option<&StateValue>) {
        if self.inner.debug {
            debug!(%key, value = %next, "state set");
        }
        self.inner.bus.emit(key, Some(next), prev);
        self.persist_after_change();
    }

    /// Delete `key`. Returns the removed value.
    pub fn remove(&self, key: &str) -> Option<StateValue> {
        let prev = self.state().values.remove(key)?;
        if self.inner.debug {
            debug!(%key, "state removed");
        }
        self.inner.bus.emit(key, None, Some(&prev));
        self.persist_after_change();
        Some(prev)
    }

    /// Apply several assignments as one logical update.
    ///
    /// Each key follows the same suppression rule as `set`. Changed keys are
    /// written in one step, each emits one event, and the batch schedules at
    /// most one save. Returns how many keys changed.
    pub fn batch_update<I, K, V>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<StateValue>,
    {
        let entries: Snapshot = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.apply_batch(entries, None, true)
    }

    fn apply_batch(&self, entries: Snapshot, equality: Option<&Equality>, persist: bool) -> usize {
        let entries: Vec<(String, StateValue)> = entries
            .into_iter()
            .filter(|(key, _)| {
                if key.is_empty() {
                    warn!("batch write to empty key ignored");
                }
                !key.is_empty()
            })
            .collect();

        let changes = loop {
            let current: Vec<(&str, Option<StateValue>, Option<Equality>, &StateValue)> = {
                let state = self.state();
                entries
                    .iter()
                    .map(|(key, next)| {
                        let prev = state.values.get(key).cloned();
                        let key_equality = state.key_equality.get(key).cloned();
                        (key.as_str(), prev, key_equality, next)
                    })
                    .collect()
            };

            let changes: Vec<(&str, Option<StateValue>, StateValue)> = current
                .into_iter()
                .filter(|(_, prev, key_equality, next)| match prev {
                    Some(prev) => !equality
                        .or(key_equality.as_ref())
                        .unwrap_or(&self.inner.default_equality)
                        .matches(prev, next),
                    None => true,
                })
                .map(|(key, prev, _, next)| (key, prev, next.clone()))
                .collect();

            if changes.is_empty() {
                return 0;
            }

            let mut state = self.state();
            let stale = changes
                .iter()
                .any(|(key, prev, _)| !same_slot(state.values.get(*key), prev.as_ref()));
            if stale {
                continue;
            }
            for (key, _, next) in &changes {
                state.values.insert(key.to_string(), next.clone());
            }
            break changes;
        };

        if self.inner.debug {
            debug!(changed = changes.len(), "batch applied");
        }
        for (key, prev, next) in &changes {
            self.inner.bus.emit(key, Some(next), prev.as_ref());
        }
        if persist {
            self.persist_after_change();
        }
        changes.len()
    }

    /// Remove every key. Each previous key emits one removal event.
    pub fn clear(&self) {
        let previous = std::mem::take(&mut self.state().values);
        if self.inner.debug {
            debug!(cleared = previous.len(), "state cleared");
        }
        for (key, prev) in &previous {
            self.inner.bus.emit(key, None, Some(prev));
        }
        self.persist_after_change();
    }

    // ── Subscriptions ──────────────────────────────────────────────

    /// Listen for changes to `key`, called with `(next, prev, key)`.
    pub fn subscribe<F>(&self, key: &str, listener: F) -> Subscription
    where
        F: Fn(Option<&StateValue>, Option<&StateValue>, &str) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(key, listener)
    }

    /// Listen for changes to every key that exists right now.
    ///
    /// Keys created after this call are not covered.
    pub fn subscribe_to_all<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Option<&StateValue>, Option<&StateValue>, &str) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe_many(self.keys(), listener)
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.inner.bus
    }

    // ── Persistence ────────────────────────────────────────────────

    pub fn coordinator(&self) -> Option<PersistenceCoordinator> {
        self.state().persistence.clone()
    }

    fn persist_after_change(&self) {
        let (coordinator, snapshot) = {
            let state = self.state();
            match &state.persistence {
                Some(c) if c.config().save_on_change => (c.clone(), state.values.clone()),
                _ => return,
            }
        };
        coordinator.save(&snapshot);
    }

    /// Schedule a save of the current map, whatever `save_on_change` says.
    pub fn save(&self) {
        let (coordinator, snapshot) = {
            let state = self.state();
            match &state.persistence {
                Some(c) => (c.clone(), state.values.clone()),
                None => return,
            }
        };
        coordinator.save(&snapshot);
    }

    /// Wait until pending saves have been written.
    pub async fn flush(&self) {
        if let Some(coordinator) = self.coordinator() {
            coordinator.flush().await;
        }
    }

    /// Merge stored state over the current map through the asynchronous
    /// read path. Keys whose value changes emit events; nothing is saved.
    /// Returns how many keys changed.
    pub async fn hydrate(&self) -> usize {
        let Some(coordinator) = self.coordinator() else {
            return 0;
        };
        let current = self.get_all();
        let merged = coordinator.hydrate_async(&current).await;
        let restored: Snapshot = merged
            .into_iter()
            .filter(|(key, value)| current.get(key) != Some(value))
            .collect();
        let changed = self.apply_batch(restored, Some(&Equality::Deep), false);
        if changed > 0 {
            info!(changed, key = %coordinator.storage_key(), "state hydrated");
        }
        changed
    }

    /// Release every subscription, clear the map, and drop any pending save.
    ///
    /// A write already in flight still completes. Using the engine afterwards
    /// is the caller's problem.
    pub fn dispose(&self) {
        self.inner.bus.clear();
        let coordinator = {
            let mut state = self.state();
            state.values.clear();
            state.initializing.clear();
            state.persistence.take()
        };
        if let Some(coordinator) = coordinator {
            coordinator.cancel_pending();
        }
        debug!("state engine disposed");
    }
}

/// True when the slot still holds the value a writer based its change on.
fn same_slot(current: Option<&StateValue>, seen: Option<&StateValue>) -> bool {
    match (current, seen) {
        (Some(current), Some(seen)) => current.ptr_eq(seen),
        (None, None) => true,
        _ => false,
    }
}

impl Default for StateEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl fmt::Debug for StateEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("StateEngine")
            .field("keys", &state.values.len())
            .field("persistent", &state.persistence.is_some())
            .finish_non_exhaustive()
    }
}
