//! Key selection for persistence.

use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;

use crate::value::{Snapshot, StateValue};

/// Predicate deciding whether `(key, value)` is persisted.
pub type KeyPredicate = Arc<dyn Fn(&str, &StateValue) -> bool + Send + Sync>;

/// Which keys of a snapshot reach storage.
#[derive(Clone, Default)]
pub enum KeyFilter {
    /// Every key.
    #[default]
    All,
    /// No key; persistence is effectively off.
    Nothing,
    /// Only the listed keys.
    Keys(HashSet<String>),
    /// Keys starting with a prefix, e.g. `"persist."`.
    Prefix(String),
    /// Arbitrary predicate. A predicate that panics excludes the key.
    Predicate(KeyPredicate),
}

impl KeyFilter {
    pub fn keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self::Keys(keys.into_iter().map(Into::into).collect())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&str, &StateValue) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    pub fn includes(&self, key: &str, value: &StateValue) -> bool {
        match self {
            Self::All => true,
            Self::Nothing => false,
            Self::Keys(keys) => keys.contains(key),
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
            Self::Predicate(predicate) => {
                match catch_unwind(AssertUnwindSafe(|| predicate(key, value))) {
                    Ok(included) => included,
                    Err(_) => {
                        warn!(%key, "persist predicate panicked, key not persisted");
                        false
                    }
                }
            }
        }
    }

    /// Copy of `snapshot` restricted to the selected keys.
    pub fn apply(&self, snapshot: &Snapshot) -> Snapshot {
        match self {
            Self::All => snapshot.clone(),
            Self::Nothing => Snapshot::new(),
            Self::Keys(keys) => keys
                .iter()
                .filter_map(|k| snapshot.get_key_value(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            _ => snapshot
                .iter()
                .filter(|(k, v)| self.includes(k, v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

impl From<bool> for KeyFilter {
    fn from(persist_all: bool) -> Self {
        if persist_all {
            Self::All
        } else {
            Self::Nothing
        }
    }
}

impl fmt::Debug for KeyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("All"),
            Self::Nothing => f.write_str("Nothing"),
            Self::Keys(keys) => f.debug_tuple("Keys").field(keys).finish(),
            Self::Prefix(prefix) => f.debug_tuple("Prefix").field(prefix).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}
