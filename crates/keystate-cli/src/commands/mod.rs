pub mod store;

use std::path::PathBuf;

use keystate::{detect_best_adapter, PersistenceCoordinator, StateEngine, StoreConfig};
use tracing::{debug, warn};

/// Store file used when neither `--store` nor the config names one.
pub const DEFAULT_STORE: &str = "keystate.redb";

/// Global command-line options.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub store: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub prefix: Option<String>,
}

/// Build a hydrated engine over the configured store.
pub async fn open(options: &StoreOptions) -> anyhow::Result<StateEngine> {
    let mut config = match &options.config {
        Some(path) => StoreConfig::from_file(path)?,
        None => StoreConfig::default(),
    };

    let section = config.persistence.get_or_insert_with(Default::default);
    if let Some(store) = &options.store {
        section.path = Some(store.clone());
    }
    if section.path.is_none() {
        section.path = Some(PathBuf::from(DEFAULT_STORE));
    }
    if let Some(prefix) = &options.prefix {
        section.key_prefix = prefix.clone();
    }
    // The CLI always reads what is stored before touching it.
    section.load_on_init = true;

    let preference = config.adapter_preference().unwrap_or_default();
    let adapter = detect_best_adapter(&preference);
    if adapter.name() != "redb" {
        warn!(adapter = adapter.name(), "store file unusable, changes will not be kept");
    }

    let coordinator = PersistenceCoordinator::new(config.persist_config(adapter))?;
    let engine = StateEngine::with_persistence(config.engine_config()?, coordinator);
    let restored = engine.hydrate().await;
    debug!(keys = engine.len(), restored, "store opened");
    Ok(engine)
}
