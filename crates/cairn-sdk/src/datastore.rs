use std::path::Path;
use std::sync::Arc;

use cairn_orm::{FlushSummary, Handle, Manager, ManagerConfig, Metamodel};
use cairn_store::{InMemoryNodeStore, NodeStore};
use cairn_types::{Key, Value};
use tracing::info;

use crate::config::DataStoreConfig;
use crate::error::SdkResult;

/// A metamodel bound to a node store through one [`Manager`].
///
/// Convenience methods forward to the manager; use
/// [`manager_mut`](Self::manager_mut) for the rest of its API.
pub struct DataStore {
    manager: Manager,
}

impl DataStore {
    pub fn new(metamodel: Arc<Metamodel>, store: Arc<dyn NodeStore>, config: ManagerConfig) -> Self {
        info!(
            entity_types = metamodel.len(),
            cascade_updates = config.cascade_updates,
            "data store opened"
        );
        Self {
            manager: Manager::with_config(metamodel, store, config),
        }
    }

    /// Backed by a fresh [`InMemoryNodeStore`], default settings.
    pub fn in_memory(metamodel: Arc<Metamodel>) -> Self {
        Self::new(
            metamodel,
            Arc::new(InMemoryNodeStore::new()),
            ManagerConfig::default(),
        )
    }

    pub fn from_config(
        metamodel: Arc<Metamodel>,
        store: Arc<dyn NodeStore>,
        config: &DataStoreConfig,
    ) -> Self {
        Self::new(metamodel, store, config.manager.clone())
    }

    /// Open with settings read from a TOML file.
    pub fn open(
        metamodel: Arc<Metamodel>,
        store: Arc<dyn NodeStore>,
        config_path: impl AsRef<Path>,
    ) -> SdkResult<Self> {
        let config = DataStoreConfig::load(config_path)?;
        Ok(Self::from_config(metamodel, store, &config))
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut Manager {
        &mut self.manager
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        self.manager.store()
    }

    pub fn metamodel(&self) -> &Arc<Metamodel> {
        self.manager.metamodel()
    }

    pub fn persist<T: Send + Sync + 'static>(&mut self, value: T) -> SdkResult<Handle<T>> {
        Ok(self.manager.persist(value)?)
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self, handle: &Handle<T>) -> SdkResult<()> {
        Ok(self.manager.remove(handle)?)
    }

    pub async fn flush(&mut self) -> SdkResult<FlushSummary> {
        Ok(self.manager.flush().await?)
    }

    pub async fn find<T: Send + Sync + 'static>(&mut self, key: &Key) -> SdkResult<Handle<T>> {
        Ok(self.manager.find(key).await?)
    }

    pub fn find_by<T: Send + Sync + 'static>(
        &self,
        attribute: &str,
        value: &Value,
    ) -> SdkResult<Option<Handle<T>>> {
        Ok(self.manager.find_by(attribute, value)?)
    }

    pub fn key<T: Send + Sync + 'static>(&self, handle: &Handle<T>) -> Option<Key> {
        self.manager.key(handle)
    }
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("manager", &self.manager)
            .finish()
    }
}
