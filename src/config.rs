use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DataKeepError, DataKeepResult};

/// Storage provider backing a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// In-memory reference provider; data is lost on drop.
    #[default]
    Memory,
    /// Durable sled-backed provider rooted at the configured storage path.
    Sled,
}

/// Settings for a [`crate::service::DataService`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path where the sled provider stores its data.
    pub storage_path: PathBuf,
    /// Provider hosting the system database and used as the default for
    /// new databases.
    #[serde(default)]
    pub provider: ProviderKind,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("data"),
            provider: ProviderKind::Memory,
        }
    }
}

impl StoreConfig {
    pub fn new(storage_path: PathBuf) -> Self {
        Self {
            storage_path,
            ..Default::default()
        }
    }

    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = provider;
        self
    }

    /// Loads settings from a TOML file.
    pub fn from_file(path: &Path) -> DataKeepResult<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| DataKeepError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }
}
