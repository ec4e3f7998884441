use std::sync::Arc;

use crate::config::{CoreConfig, StorageBackend};
use crate::coordinator::Coordinator;
use crate::error::ApplyError;
use crate::feed::ChangeFeed;
use crate::registry::FlagRegistry;
use crate::store::memory::MemoryStore;
use crate::store::sled_store::SledStore;
use crate::store::DurableStore;
use crate::Flagship;

/// Configures and assembles a [`Flagship`] core.
///
/// # Examples
/// ```no_run
/// # async fn build() -> Result<(), flagship_core::ApplyError> {
/// // Defaults: sled storage under ./data
/// let core = flagship_core::Flagship::builder().build().await?;
///
/// // In-memory, for tests and single-process setups
/// let core = flagship_core::Flagship::builder().in_memory().build().await?;
///
/// // From a config file with FLAGSHIP_* environment overrides
/// let core = flagship_core::Flagship::builder()
///     .config_file("flagship.toml")
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct FlagshipBuilder {
    config: CoreConfig,
    store: Option<Arc<dyn DurableStore>>,
}

pub(crate) fn create_builder() -> FlagshipBuilder {
    FlagshipBuilder {
        config: CoreConfig::default(),
        store: None,
    }
}

impl FlagshipBuilder {
    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Loads the config from a TOML file (falling back to defaults) and
    /// applies `FLAGSHIP_*` environment variable overrides on top.
    pub fn config_file(mut self, path: &str) -> Self {
        let mut config = CoreConfig::load(path);
        config.apply_env_overrides();
        self.config = config;
        self
    }

    /// Shorthand for the in-memory storage backend.
    pub fn in_memory(mut self) -> Self {
        self.config.storage = StorageBackend::Memory;
        self
    }

    /// Supplies a custom durable backend instead of the configured one.
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Assembles the core and warm-loads the registry from durable
    /// storage, so reads are served from memory from the first call.
    pub async fn build(self) -> Result<Flagship, ApplyError> {
        let config = self.config;
        let store: Arc<dyn DurableStore> = match self.store {
            Some(store) => store,
            None => match config.storage {
                StorageBackend::Memory => Arc::new(MemoryStore::new()),
                StorageBackend::Sled => Arc::new(SledStore::open(&config.data_dir)?),
            },
        };

        let registry = Arc::new(FlagRegistry::new());
        let feed = Arc::new(ChangeFeed::new(config.feed_retention));
        let coordinator = Coordinator::new(
            Arc::clone(&registry),
            Arc::clone(&feed),
            store,
            &config,
        );

        let core = Flagship {
            registry,
            feed,
            coordinator,
        };
        core.coordinator.resync().await?;
        Ok(core)
    }
}
