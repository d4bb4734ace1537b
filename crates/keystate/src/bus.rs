//! ChangeBus: per-key publish/subscribe registry.
//!
//! Delivery is synchronous. An emit works on the list of subscribers present
//! when it started: subscribers added while it runs are not called for that
//! emit, and subscribers removed while it runs still are. No lock is held
//! while callbacks run, so a callback may subscribe, unsubscribe, or write to
//! the engine.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, error};

use crate::error::StateError;
use crate::value::StateValue;

/// Change callback, invoked with `(next, prev, key)`.
///
/// `next` is `None` when the key was removed.
pub type Listener = Arc<dyn Fn(Option<&StateValue>, Option<&StateValue>, &str) + Send + Sync>;

type SubscriberId = u64;

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<String, Vec<(SubscriberId, Listener)>>>,
}

impl BusInner {
    fn subscribers(&self) -> MutexGuard<'_, HashMap<String, Vec<(SubscriberId, Listener)>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, key: &str, id: SubscriberId) {
        let mut subscribers = self.subscribers();
        if let Some(list) = subscribers.get_mut(key) {
            list.retain(|(existing, _)| *existing != id);
            if list.is_empty() {
                subscribers.remove(key);
            }
        }
    }
}

/// Per-key subscriber registry.
#[derive(Clone, Default)]
pub struct ChangeBus {
    inner: Arc<BusInner>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `key`.
    pub fn subscribe<F>(&self, key: &str, listener: F) -> Subscription
    where
        F: Fn(Option<&StateValue>, Option<&StateValue>, &str) + Send + Sync + 'static,
    {
        self.subscribe_many([key], listener)
    }

    /// Register one listener for several keys behind a single handle.
    pub fn subscribe_many<I, K, F>(&self, keys: I, listener: F) -> Subscription
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
        F: Fn(Option<&StateValue>, Option<&StateValue>, &str) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let mut entries = Vec::new();
        {
            let mut subscribers = self.inner.subscribers();
            for key in keys {
                let key = key.as_ref().to_string();
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                subscribers
                    .entry(key.clone())
                    .or_default()
                    .push((id, Arc::clone(&listener)));
                entries.push((key, id));
            }
        }
        debug!(keys = entries.len(), "subscription registered");
        Subscription {
            bus: Arc::downgrade(&self.inner),
            entries: Mutex::new(entries),
        }
    }

    /// Deliver a change for `key` to every current subscriber.
    ///
    /// A panicking subscriber is logged and skipped; delivery continues and
    /// the panic never reaches the caller.
    pub fn emit(&self, key: &str, next: Option<&StateValue>, prev: Option<&StateValue>) {
        let listeners: Vec<Listener> = {
            let subscribers = self.inner.subscribers();
            match subscribers.get(key) {
                Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
                None => return,
            }
        };

        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(next, prev, key)));
            if let Err(payload) = outcome {
                let err = StateError::SubscriberCallback {
                    key: key.to_string(),
                    message: panic_message(payload.as_ref()),
                };
                error!(%key, error = %err, "subscriber callback failed");
            }
        }
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner.subscribers().get(key).map_or(0, Vec::len)
    }

    /// Keys with at least one subscriber, sorted.
    pub fn subscribed_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.subscribers().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop every registration. Outstanding handles become no-ops.
    pub fn clear(&self) {
        let mut subscribers = self.inner.subscribers();
        let released: usize = subscribers.values().map(Vec::len).sum();
        subscribers.clear();
        debug!(released, "all subscriptions released");
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle for one `subscribe` call.
///
/// Unsubscribing is idempotent and only removes this handle's registrations.
/// Dropping the handle unsubscribes.
#[must_use = "dropping a Subscription unsubscribes it immediately"]
pub struct Subscription {
    bus: Weak<BusInner>,
    entries: Mutex<Vec<(String, SubscriberId)>>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        let entries = std::mem::take(&mut *self.entries.lock().unwrap_or_else(PoisonError::into_inner));
        if entries.is_empty() {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            for (key, id) in &entries {
                bus.remove(key, *id);
            }
        }
    }

    /// Keys this handle is still registered for.
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(Option<&StateValue>, Option<&StateValue>, &str) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move |_: Option<&StateValue>, _: Option<&StateValue>, _: &str| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn emit_reaches_every_subscriber_of_the_key() {
        let bus = ChangeBus::new();
        let (a_count, a) = counter();
        let (b_count, b) = counter();
        let (other_count, other) = counter();
        let _a = bus.subscribe("k", a);
        let _b = bus.subscribe("k", b);
        let _o = bus.subscribe("other", other);

        bus.emit("k", Some(&StateValue::from(1i64)), None);

        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);
        assert_eq!(other_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_receives_next_prev_and_key() {
        let bus = ChangeBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _sub = bus.subscribe("k", move |next, prev, key| {
            s.lock().unwrap().push((next.cloned(), prev.cloned(), key.to_string()));
        });

        let old = StateValue::from("old");
        let new = StateValue::from("new");
        bus.emit("k", Some(&new), Some(&old));
        bus.emit("k", None, Some(&new));

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (Some(new.clone()), Some(old), "k".to_string()));
        assert_eq!(seen[1], (None, Some(new), "k".to_string()));
    }

    #[test]
    fn unsubscribe_removes_only_its_own_registration() {
        let bus = ChangeBus::new();
        let (a_count, a) = counter();
        let (b_count, b) = counter();
        let sub_a = bus.subscribe("k", a);
        let _sub_b = bus.subscribe("k", b);

        sub_a.unsubscribe();
        sub_a.unsubscribe();
        bus.emit("k", Some(&StateValue::from(1i64)), None);

        assert_eq!(a_count.load(Ordering::SeqCst), 0);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count("k"), 1);
    }

    #[test]
    fn dropping_the_handle_unsubscribes() {
        let bus = ChangeBus::new();
        let (count, listener) = counter();
        {
            let _sub = bus.subscribe("k", listener);
            assert_eq!(bus.subscriber_count("k"), 1);
        }
        bus.emit("k", None, None);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(bus.subscribed_keys().is_empty());
    }

    #[test]
    fn panicking_subscriber_does_not_stop_delivery() {
        let bus = ChangeBus::new();
        let _bad = bus.subscribe("k", |_, _, _| panic!("listener exploded"));
        let (count, good) = counter();
        let _good = bus.subscribe("k", good);

        bus.emit("k", Some(&StateValue::from(true)), None);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribers_added_during_emit_wait_for_the_next_one() {
        let bus = ChangeBus::new();
        let (late_count, late) = counter();
        let late = Arc::new(late);
        let held = Arc::new(Mutex::new(Vec::new()));

        let bus_for_cb = bus.clone();
        let held_for_cb = Arc::clone(&held);
        let _sub = bus.subscribe("k", move |_, _, _| {
            let late = Arc::clone(&late);
            let sub = bus_for_cb.subscribe("k", move |n, p, k| late(n, p, k));
            held_for_cb.lock().unwrap().push(sub);
        });

        bus.emit("k", None, None);
        assert_eq!(late_count.load(Ordering::SeqCst), 0);

        bus.emit("k", None, None);
        assert_eq!(late_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribe_many_shares_one_handle() {
        let bus = ChangeBus::new();
        let (count, listener) = counter();
        let sub = bus.subscribe_many(["a", "b"], listener);
        assert_eq!(bus.subscribed_keys(), vec!["a".to_string(), "b".to_string()]);

        bus.emit("a", None, None);
        bus.emit("b", None, None);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        sub.unsubscribe();
        assert!(sub.keys().is_empty());
        assert!(bus.subscribed_keys().is_empty());
    }

    #[test]
    fn clear_turns_handles_into_no_ops() {
        let bus = ChangeBus::new();
        let (count, listener) = counter();
        let sub = bus.subscribe("k", listener);

        bus.clear();
        bus.emit("k", None, None);
        sub.unsubscribe();

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscriber_count("k"), 0);
    }
}
