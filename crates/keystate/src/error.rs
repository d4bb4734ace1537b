//! Error types for the keystate engine and its persistence layer.

use thiserror::Error;

/// Result type alias for engine operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors surfaced by the engine, the coordinator, and configuration loading.
///
/// Only `AlreadyInitializing`, `MissingKeyNoInitial` and `InvalidKey` are ever
/// returned from engine mutators. The persistence variants are delivered to
/// the coordinator's error callbacks instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("key `{0}` is already being initialized")]
    AlreadyInitializing(String),

    #[error("key `{0}` has no value and no initial value was supplied")]
    MissingKeyNoInitial(String),

    #[error("keys must be non-empty strings")]
    InvalidKey,

    #[error("failed to read persisted state from `{key}`: {reason}")]
    PersistenceRead { key: String, reason: String },

    #[error("failed to write persisted state to `{key}`: {reason}")]
    PersistenceWrite { key: String, reason: String },

    #[error("subscriber for `{key}` panicked: {message}")]
    SubscriberCallback { key: String, message: String },

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("no async runtime available: {0}")]
    Runtime(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Errors reported by a [`StorageAdapter`](crate::StorageAdapter).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_key() {
        let err = StateError::AlreadyInitializing("theme".to_string());
        assert_eq!(err.to_string(), "key `theme` is already being initialized");

        let err = StateError::PersistenceRead {
            key: "app_all".to_string(),
            reason: "expected value at line 1 column 1".to_string(),
        };
        assert!(err.to_string().contains("app_all"));
    }

    #[test]
    fn storage_error_display() {
        let err = StorageError::Backend("disk full".to_string());
        assert_eq!(format!("{err}"), "storage backend error: disk full");
    }
}
