//! Node configuration
//!
//! Every section has a default, so a config file only needs the fields it
//! changes. Stored as pretty-printed JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NimbusConfig {
    pub storage: StorageConfig,
    pub fabric: FabricConfig,
    pub ledger: LedgerConfig,
    pub sync: SyncConfig,
}

/// Where feeds are persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Store root. `None` keeps everything in memory.
    pub root: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: Some(PathBuf::from("nimbus-data")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Address to accept connections on when announcing.
    pub listen_addr: String,
    /// Addresses dialed when discovering (`host:port`).
    pub bootstrap: Vec<String>,
    /// How long a connection may take to complete its handshake.
    pub handshake_timeout_ms: u64,
    /// Largest frame accepted from or sent to a peer.
    pub max_frame_bytes: usize,
    /// Buffered fabric events per subscriber before it lags.
    pub event_capacity: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            bootstrap: Vec::new(),
            handshake_timeout_ms: 5_000,
            max_frame_bytes: 4 * 1024 * 1024,
            event_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Hold merges of remote writers while any input is still syncing.
    ///
    /// With this on, ledgers that learn each writer's head before its
    /// entries produce identical output regardless of arrival order.
    /// Local appends are never held.
    pub require_caught_up: bool,
    /// How long a writer may stay syncing before it stops holding the
    /// others back. 0 waits forever.
    pub stall_timeout_ms: u64,
    /// Buffered ledger events per subscriber before it lags.
    pub event_capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            require_caught_up: true,
            stall_timeout_ms: 30_000,
            event_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Most entries served in reply to one request.
    pub max_batch: u64,
    /// Start mirroring writers that peers announce.
    pub auto_register: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_batch: 256,
            auto_register: true,
        }
    }
}

impl NimbusConfig {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
        let config: Self =
            serde_json::from_slice(&data).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise use defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fabric.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("fabric.max_frame_bytes must be positive".into()));
        }
        if self.fabric.event_capacity == 0 || self.ledger.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be positive".into()));
        }
        if self.sync.max_batch == 0 {
            return Err(ConfigError::Invalid("sync.max_batch must be positive".into()));
        }
        Ok(())
    }
}
