//! keystate.toml configuration parser.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapter::{AdapterPreference, StorageAdapter};
use crate::engine::EngineConfig;
use crate::error::{StateError, StateResult};
use crate::persist::{KeyFilter, PersistConfig, DEFAULT_KEY_PREFIX};
use crate::value::{Equality, StateValue};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub engine: EngineSection,
    pub persistence: Option<PersistenceSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub debug: bool,
    /// `reference`, `shallow` or `deep`.
    pub equality: Option<String>,
    pub key_equality: HashMap<String, String>,
    pub initial_state: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSection {
    pub path: Option<PathBuf>,
    pub memory_fallback: bool,
    pub key_prefix: String,
    pub persist_keys: PersistKeys,
    pub load_on_init: bool,
    pub save_on_change: bool,
    pub debounce_ms: u64,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            path: None,
            memory_fallback: true,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            persist_keys: PersistKeys::default(),
            load_on_init: true,
            save_on_change: true,
            debounce_ms: 0,
        }
    }
}

/// `persist_keys = true | false | ["a", "b"] | { prefix = "persist." }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PersistKeys {
    Flag(bool),
    Keys(Vec<String>),
    Prefix { prefix: String },
}

impl Default for PersistKeys {
    fn default() -> Self {
        Self::Flag(true)
    }
}

impl From<&PersistKeys> for KeyFilter {
    fn from(keys: &PersistKeys) -> Self {
        match keys {
            PersistKeys::Flag(all) => KeyFilter::from(*all),
            PersistKeys::Keys(keys) => KeyFilter::keys(keys.iter().cloned()),
            PersistKeys::Prefix { prefix } => KeyFilter::prefix(prefix.clone()),
        }
    }
}

impl StoreConfig {
    pub fn from_file(path: &Path) -> StateResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StateError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> StateResult<Self> {
        toml::from_str(content).map_err(|e| StateError::Config(e.to_string()))
    }

    /// Engine settings, with equality names resolved.
    pub fn engine_config(&self) -> StateResult<EngineConfig> {
        let engine = &self.engine;
        let mut config = EngineConfig::new()
            .with_debug(engine.debug)
            .with_initial_state(
                engine
                    .initial_state
                    .iter()
                    .map(|(k, v)| (k.clone(), StateValue::from(v.clone()))),
            );
        if let Some(name) = &engine.equality {
            config = config.with_default_equality(name.parse::<Equality>()?);
        }
        for (key, name) in &engine.key_equality {
            config = config.with_key_equality(key.clone(), name.parse::<Equality>()?);
        }
        Ok(config)
    }

    /// Where to look for storage. `None` when persistence is not configured.
    pub fn adapter_preference(&self) -> Option<AdapterPreference> {
        self.persistence.as_ref().map(|p| AdapterPreference {
            path: p.path.clone(),
            memory_fallback: p.memory_fallback,
        })
    }

    /// Persistence settings over `adapter`. Missing section means defaults.
    pub fn persist_config(&self, adapter: Arc<dyn StorageAdapter>) -> PersistConfig {
        let section = self.persistence.clone().unwrap_or_default();
        PersistConfig::new(adapter)
            .with_key_prefix(section.key_prefix)
            .with_persist_keys(KeyFilter::from(&section.persist_keys))
            .with_load_on_init(section.load_on_init)
            .with_save_on_change(section.save_on_change)
            .with_debounce(Duration::from_millis(section.debounce_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::NoopAdapter;
    use serde_json::json;

    const FULL: &str = r#"
[engine]
debug = true
equality = "shallow"

[engine.key_equality]
profile = "deep"

[engine.initial_state]
theme = "light"
count = 0

[persistence]
path = "state/app.redb"
memory_fallback = false
key_prefix = "app"
persist_keys = ["theme"]
load_on_init = false
debounce_ms = 250
"#;

    #[test]
    fn parse_full_file() {
        let config = StoreConfig::from_toml_str(FULL).unwrap();
        assert!(config.engine.debug);
        assert_eq!(config.engine.initial_state["theme"], json!("light"));

        let persistence = config.persistence.as_ref().unwrap();
        assert_eq!(persistence.path.as_deref(), Some(Path::new("state/app.redb")));
        assert!(!persistence.memory_fallback);
        assert!(persistence.save_on_change);
        assert_eq!(persistence.persist_keys, PersistKeys::Keys(vec!["theme".to_string()]));
    }

    #[test]
    fn engine_config_resolves_equality() {
        let engine = StoreConfig::from_toml_str(FULL).unwrap().engine_config().unwrap();
        assert!(engine.debug);
        assert!(matches!(engine.default_equality, Equality::Shallow));
        assert!(matches!(engine.key_equality["profile"], Equality::Deep));
        assert_eq!(engine.initial_state["count"], StateValue::from(0i64));
    }

    #[test]
    fn persist_config_from_section() {
        let config = StoreConfig::from_toml_str(FULL).unwrap();
        let persist = config.persist_config(Arc::new(NoopAdapter));
        assert_eq!(persist.storage_key(), "app_all");
        assert!(!persist.load_on_init);
        assert_eq!(persist.debounce, Duration::from_millis(250));
        assert!(matches!(persist.persist_keys, KeyFilter::Keys(_)));

        let pref = config.adapter_preference().unwrap();
        assert!(!pref.memory_fallback);
    }

    #[test]
    fn persist_keys_forms() {
        let parse = |line: &str| {
            let text = format!("[persistence]\npersist_keys = {line}\n");
            StoreConfig::from_toml_str(&text)
                .unwrap()
                .persistence
                .unwrap()
                .persist_keys
        };
        assert_eq!(parse("true"), PersistKeys::Flag(true));
        assert_eq!(parse("false"), PersistKeys::Flag(false));
        assert_eq!(parse(r#"["a", "b"]"#), PersistKeys::Keys(vec!["a".into(), "b".into()]));
        assert_eq!(
            parse(r#"{ prefix = "persist." }"#),
            PersistKeys::Prefix {
                prefix: "persist.".into()
            }
        );
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = StoreConfig::from_toml_str("").unwrap();
        assert!(config.persistence.is_none());
        assert!(config.adapter_preference().is_none());

        let persist = config.persist_config(Arc::new(NoopAdapter));
        assert_eq!(persist.storage_key(), "keystate_all");
        assert!(persist.load_on_init);
        assert!(persist.debounce.is_zero());
    }

    #[test]
    fn unknown_equality_is_a_config_error() {
        let config = StoreConfig::from_toml_str("[engine]\nequality = \"fuzzy\"\n").unwrap();
        assert!(matches!(config.engine_config(), Err(StateError::Config(_))));
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        assert!(matches!(
            StoreConfig::from_toml_str("[engine\n"),
            Err(StateError::Config(_))
        ));
    }
}
