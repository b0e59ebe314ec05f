//! Engine configuration via `ember.toml`
//!
//! A default `ember.toml` is written next to the store on first open. Every
//! section is optional; missing fields take their defaults. Values are
//! validated eagerly when the file is read.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use ember_concurrency::{TaskManagerConfig, DEFAULT_CHUNK_SIZE, DEFAULT_REMOVE_AFTER};
use ember_core::{Error, Result};
use ember_storage::NonceSource;

/// Config file name placed in the store directory.
pub const CONFIG_FILE_NAME: &str = "ember.toml";

/// Default compaction strategy name.
pub const DEFAULT_STRATEGY: &str = "fireproof";

/// Default CAR log length that triggers compaction.
pub const DEFAULT_AUTO_COMPACT: usize = 100;

/// `[write_queue]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteQueueConfig {
    /// Batches per write cycle
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

/// `[tasks]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Failures tolerated before a remote event is dropped
    #[serde(default = "default_remove_after")]
    pub remove_after: usize,
    /// Pause after a failed drain, in milliseconds
    #[serde(default = "default_retry_timeout_ms")]
    pub retry_timeout_ms: u64,
}

fn default_remove_after() -> usize {
    DEFAULT_REMOVE_AFTER
}

fn default_retry_timeout_ms() -> u64 {
    50
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            remove_after: default_remove_after(),
            retry_timeout_ms: default_retry_timeout_ms(),
        }
    }
}

impl TasksConfig {
    /// Task manager settings for this section.
    pub fn task_manager(&self) -> TaskManagerConfig {
        TaskManagerConfig {
            remove_after: self.remove_after,
            retry_timeout: Duration::from_millis(self.retry_timeout_ms),
        }
    }
}

/// `[compaction]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Strategy name looked up in the registry
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Compact once the CAR log grows past this length; 0 disables
    #[serde(default = "default_auto_compact")]
    pub auto_compact: usize,
}

fn default_strategy() -> String {
    DEFAULT_STRATEGY.to_string()
}

fn default_auto_compact() -> usize {
    DEFAULT_AUTO_COMPACT
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            auto_compact: default_auto_compact(),
        }
    }
}

/// `[encryption]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Encrypt every block written to a gateway
    #[serde(default)]
    pub enabled: bool,
    /// `"convergent"` (default) or `"random"`
    #[serde(default = "default_nonce")]
    pub nonce: String,
}

fn default_nonce() -> String {
    "convergent".to_string()
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            nonce: default_nonce(),
        }
    }
}

impl EncryptionConfig {
    /// Parse the nonce string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not `"convergent"` or `"random"`.
    pub fn nonce_source(&self) -> Result<NonceSource> {
        match self.nonce.as_str() {
            "convergent" => Ok(NonceSource::Convergent),
            "random" => Ok(NonceSource::Random),
            other => Err(Error::ConfigError(format!(
                "Invalid nonce source '{}' in ember.toml. Expected \"convergent\" or \"random\".",
                other
            ))),
        }
    }
}

/// `[store]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store name; also names the key set in the key bag
    #[serde(default = "default_name")]
    pub name: String,
}

fn default_name() -> String {
    "ember".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
        }
    }
}

/// Engine configuration loaded from `ember.toml`.
///
/// # Example
///
/// ```toml
/// [write_queue]
/// chunk_size = 32
///
/// [compaction]
/// strategy = "fireproof"
/// auto_compact = 100
///
/// [encryption]
/// enabled = true
/// nonce = "convergent"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Write queue tuning
    #[serde(default)]
    pub write_queue: WriteQueueConfig,
    /// Remote event task manager tuning
    #[serde(default)]
    pub tasks: TasksConfig,
    /// Compaction strategy and trigger
    #[serde(default)]
    pub compaction: CompactionConfig,
    /// Block encryption
    #[serde(default)]
    pub encryption: EncryptionConfig,
    /// Store identity
    #[serde(default)]
    pub store: StoreConfig,
}

impl EngineConfig {
    /// Check every field.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` for an unknown nonce source, a zero
    /// chunk size, an empty strategy, or an empty store name.
    pub fn validate(&self) -> Result<()> {
        self.encryption.nonce_source()?;
        if self.write_queue.chunk_size == 0 {
            return Err(Error::ConfigError(
                "write_queue.chunk_size must be at least 1".to_string(),
            ));
        }
        if self.compaction.strategy.trim().is_empty() {
            return Err(Error::ConfigError(
                "compaction.strategy must not be empty".to_string(),
            ));
        }
        if self.store.name.trim().is_empty() {
            return Err(Error::ConfigError("store.name must not be empty".to_string()));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Ember engine configuration

[store]
# Store name; also names the encryption key set
name = "ember"

[write_queue]
# Queued batches handed to one write cycle (default: 32)
chunk_size = 32

[tasks]
# Failed attempts before a remote event is dropped (default: 3)
remove_after = 3
# Pause after a failed remote event, in milliseconds (default: 50)
retry_timeout_ms = 50

[compaction]
# "fireproof" (default), "full" or "no-op"
strategy = "fireproof"
# Compact once this many CARs are logged; 0 disables (default: 100)
auto_compact = 100

[encryption]
# Encrypt blocks before they reach a gateway (default: false)
enabled = false
# "convergent" = identical blocks keep identical CIDs across peers
# "random"     = fresh nonce per block
nonce = "convergent"
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: EngineConfig = toml::from_str(&content).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::ConfigError(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
