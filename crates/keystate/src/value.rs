//! Stored values, snapshots, and change-suppression strategies.
//!
//! Every slot holds a [`StateValue`]: a shared handle to a JSON value. Cloning
//! a handle keeps its identity, which is what [`Equality::Reference`] compares.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{StateError, StateResult};

/// Full key → value mapping at one instant.
pub type Snapshot = BTreeMap<String, StateValue>;

/// Immutable, cheaply clonable handle to a stored JSON value.
#[derive(Clone)]
pub struct StateValue(Arc<Value>);

impl StateValue {
    pub fn new(value: Value) -> Self {
        Self(Arc::new(value))
    }

    /// Convert any serializable value into a stored value.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> StateResult<Self> {
        serde_json::to_value(value)
            .map(Self::new)
            .map_err(|e| StateError::Serialize(e.to_string()))
    }

    /// Decode the stored JSON into a typed value.
    pub fn deserialize<T: DeserializeOwned>(&self) -> StateResult<T> {
        T::deserialize(self.as_value()).map_err(|e| StateError::Deserialize(e.to_string()))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// True when both handles point at the same allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn into_value(self) -> Value {
        Arc::try_unwrap(self.0).unwrap_or_else(|shared| (*shared).clone())
    }
}

impl Deref for StateValue {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.0
    }
}

impl PartialEq for StateValue {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0 == other.0
    }
}

impl fmt::Debug for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl Serialize for StateValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StateValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::new)
    }
}

impl From<Value> for StateValue {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        Self::new(Value::from(value))
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        Self::new(Value::from(value))
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        Self::new(Value::from(value))
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        Self::new(Value::from(value))
    }
}

impl From<u64> for StateValue {
    fn from(value: u64) -> Self {
        Self::new(Value::from(value))
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        Self::new(Value::from(value))
    }
}

// ── Equality ───────────────────────────────────────────────────────

/// Caller-supplied comparator: returns true when `next` should be treated as
/// identical to `current`.
pub type Comparator = Arc<dyn Fn(&StateValue, &StateValue) -> bool + Send + Sync>;

/// Strategy deciding whether a write is a no-op.
///
/// - `Reference`: same handle, or equal scalars (null, bool, number, string).
/// - `Shallow`: `Reference`, or containers of the same kind whose direct
///   children are equal scalars. Nested containers never compare equal,
///   since two separately built trees never share identity.
/// - `Deep`: full structural JSON equality.
/// - `Custom`: any comparator.
#[derive(Clone, Default)]
pub enum Equality {
    #[default]
    Reference,
    Shallow,
    Deep,
    Custom(Comparator),
}

impl Equality {
    pub fn custom<F>(compare: F) -> Self
    where
        F: Fn(&StateValue, &StateValue) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(compare))
    }

    /// Returns true when writing `next` over `current` changes nothing.
    pub fn matches(&self, current: &StateValue, next: &StateValue) -> bool {
        match self {
            Self::Reference => current.ptr_eq(next) || scalar_eq(current, next),
            Self::Shallow => current.ptr_eq(next) || shallow_eq(current, next),
            Self::Deep => current == next,
            Self::Custom(compare) => compare(current, next),
        }
    }
}

impl fmt::Debug for Equality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference => f.write_str("Reference"),
            Self::Shallow => f.write_str("Shallow"),
            Self::Deep => f.write_str("Deep"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl FromStr for Equality {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reference" | "ref" => Ok(Self::Reference),
            "shallow" => Ok(Self::Shallow),
            "deep" => Ok(Self::Deep),
            other => Err(StateError::Config(format!(
                "unknown equality `{other}` (expected reference, shallow or deep)"
            ))),
        }
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

fn scalar_eq(a: &Value, b: &Value) -> bool {
    is_scalar(a) && is_scalar(b) && a == b
}

fn shallow_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| scalar_eq(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| scalar_eq(x, y)))
        }
        _ => scalar_eq(a, b),
    }
}
