//! Configuration for opening a store.

use common::StorageConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for opening a [`KvStore`](crate::KvStore).
///
/// # Example
///
/// ```toml
/// [storage]
/// type = "Sqlite"
/// path = "/var/lib/sqlkv/data.db"
/// busy_timeout = "2s"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Config {
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::InvalidInput(format!("invalid config: {}", e)))
    }
}
