//! Configuration
//!
//! Settings consumed when the cache, the storage backend and the write-back
//! store are constructed. Defaults match a single-node deployment; a YAML file
//! and command line flags can override them.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Write-Back Configuration
// =============================================================================

/// Timing and threshold settings of the write-back engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WriteBackConfig {
    /// Seconds a cached value and its metadata live without being rewritten
    #[serde(alias = "timeout")]
    pub timeout_secs: u64,
    /// Seconds of quiet after the last write before pending actions are flushed
    #[serde(alias = "timeForWrite")]
    pub time_for_write_secs: u64,
    /// Pending actions that force an immediate flush
    pub num_actions_for_write: u64,
}

impl Default for WriteBackConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            time_for_write_secs: 600,
            num_actions_for_write: 10,
        }
    }
}

impl WriteBackConfig {
    /// TTL of cached values and metadata
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// TTL of reminder counters
    pub fn time_for_write(&self) -> Duration {
        Duration::from_secs(self.time_for_write_secs)
    }

    /// Check the settings are usable
    ///
    /// The value TTL must outlive the reminder TTL, otherwise a reminder can
    /// expire after the state it should flush was already evicted.
    pub fn validate(&self) -> Result<()> {
        if self.num_actions_for_write == 0 {
            return Err(Error::Configuration(
                "numActionsForWrite must be at least 1".to_string(),
            ));
        }
        if self.time_for_write_secs == 0 {
            return Err(Error::Configuration(
                "timeForWrite must be at least 1 second".to_string(),
            ));
        }
        if self.timeout_secs <= self.time_for_write_secs {
            return Err(Error::Configuration(format!(
                "timeout ({}s) must exceed timeForWrite ({}s)",
                self.timeout_secs, self.time_for_write_secs
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Cache Configuration
// =============================================================================

/// Which key-value cache backs the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Redis,
    Memory,
}

impl std::fmt::Display for CacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheBackend::Redis => write!(f, "redis"),
            CacheBackend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for CacheBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "redis" => Ok(CacheBackend::Redis),
            "memory" => Ok(CacheBackend::Memory),
            other => Err(Error::Configuration(format!("Unknown cache backend: {}", other))),
        }
    }
}

/// Connection settings of the key-value cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Backend type
    pub backend: CacheBackend,
    /// Redis connection URL
    pub url: String,
    /// Redis logical database, overriding the one selected by `url`
    pub db: Option<i64>,
    /// How often the in-memory cache sweeps for expired keys
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Redis,
            url: "redis://127.0.0.1:6379/".to_string(),
            db: None,
            sweep_interval_ms: 1000,
        }
    }
}

impl CacheConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

// =============================================================================
// Storage Configuration
// =============================================================================

/// Which durable backend flushed state is saved to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Memory,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::File => write!(f, "file"),
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "file" | "local" => Ok(StorageBackend::File),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(Error::Configuration(format!("Unknown storage backend: {}", other))),
        }
    }
}

/// Settings of the persistent storage backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    /// Backend type
    pub backend: StorageBackend,
    /// Root directory for the file backend
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            root: PathBuf::from("./data"),
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Complete settings of a write-back store process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Write-back timing
    #[serde(alias = "redis")]
    pub write_back: WriteBackConfig,
    /// Key-value cache connection
    pub cache: CacheConfig,
    /// Persistent storage backend
    pub storage: StorageConfig,
}

impl Settings {
    /// Parse settings from a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(yaml)?;
        settings.write_back.validate()?;
        Ok(settings)
    }

    /// Load settings from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Configuration(format!(
                "Cannot read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_yaml(&contents)
    }
}
