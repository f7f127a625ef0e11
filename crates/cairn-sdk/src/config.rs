use std::path::Path;

use cairn_orm::ManagerConfig;
use serde::{Deserialize, Serialize};

use crate::error::{SdkError, SdkResult};

/// File-level configuration of a [`DataStore`](crate::DataStore).
///
/// ```toml
/// [manager]
/// cascade_updates = true
/// delete_removed_nodes = false
/// max_association_depth = 64
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataStoreConfig {
    pub manager: ManagerConfig,
}

impl DataStoreConfig {
    pub fn from_toml_str(text: &str) -> SdkResult<Self> {
        toml::from_str(text).map_err(|e| SdkError::Config(e.to_string()))
    }

    /// Read a TOML file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> SdkResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> SdkResult<String> {
        toml::to_string(self).map_err(|e| SdkError::Config(e.to_string()))
    }
}
