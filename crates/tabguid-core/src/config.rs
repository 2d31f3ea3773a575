//! Configuration management.
//!
//! ```toml
//! storage_key = "TabRegistry"
//! removal_grace_ms = 500
//! sync_indices_after_insert = true
//!
//! [store]
//! backend = "sqlite"
//! path = "/home/me/.local/share/tabguid/tabguid.db"
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Default key of the persisted snapshot blob.
pub const DEFAULT_STORAGE_KEY: &str = "TabRegistry";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::ValidationError(format!(
                "unknown log format: {other}"
            ))),
        }
    }
}

/// Snapshot store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    JsonFile,
    Sqlite,
}

/// Where snapshots are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Directory for `json_file`, database file for `sqlite`.
    pub path: Option<PathBuf>,
}

/// Top-level registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Key of the single persisted snapshot blob.
    pub storage_key: String,
    /// Delay before a closed tab is moved to `removed`. Host shutdown closes
    /// every tab at once; waiting lets shutdown win that race.
    pub removal_grace_ms: u64,
    /// After minting, re-read true indices from the host.
    pub sync_indices_after_insert: bool,
    pub store: StoreConfig,
    pub logging: LogConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            removal_grace_ms: 500,
            sync_indices_after_insert: true,
            store: StoreConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load `path` if given, else the default location if it exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::load(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage_key.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage_key must not be empty".to_string(),
            ));
        }
        if self.store.backend != StoreBackend::Memory && self.store.path.is_none() {
            return Err(ConfigError::ValidationError(format!(
                "store.path is required for the {:?} backend",
                self.store.backend
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn removal_grace(&self) -> Duration {
        Duration::from_millis(self.removal_grace_ms)
    }
}

/// `$XDG_CONFIG_HOME/tabguid/tabguid.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("tabguid").join("tabguid.toml"))
}
