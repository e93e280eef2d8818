//! Configuration system for scenecast.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SCENECAST_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/scenecast/config.toml
//!   3. ~/.config/scenecast/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire::{DEFAULT_MAX_PACKET_SIZE, DEFAULT_MAX_UPDATE_SIZE, MIN_PACKET_CAPACITY};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenecastConfig {
    pub identity: IdentityConfig,
    pub transport: TransportConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// This process's peer id, 64 hex chars. Empty = derived at startup.
    pub peer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Capacity of scene update packets.
    pub max_packet_size: usize,
    /// Size requested for each resource stream packet.
    pub resource_packet_size: usize,
    /// Largest scene update a receiver reassembles before dropping it.
    pub max_update_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound for resident + scheduled bytes while loading from disk.
    pub load_budget_bytes: u64,
    /// Resource files indexed at startup.
    pub resource_files: Vec<PathBuf>,
    /// zstd level used when writing resource files. 0 = store uncompressed.
    pub compression_level: i32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            resource_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_update_size: DEFAULT_MAX_UPDATE_SIZE,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            load_budget_bytes: 256 * 1024 * 1024, // 256 MiB
            resource_files: Vec::new(),
            compression_level: 3,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("scenecast")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("packet size {0} is below the minimum of {MIN_PACKET_CAPACITY}")]
    PacketSizeTooSmall(usize),
    #[error("peer id must be 64 hex characters, got {0:?}")]
    BadPeerId(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ScenecastConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            ScenecastConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SCENECAST_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&ScenecastConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the transport layer cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for size in [
            self.transport.max_packet_size,
            self.transport.resource_packet_size,
        ] {
            if size < MIN_PACKET_CAPACITY {
                return Err(ConfigError::PacketSizeTooSmall(size));
            }
        }
        if !self.identity.peer_id.is_empty() && self.peer_id_bytes().is_none() {
            return Err(ConfigError::BadPeerId(self.identity.peer_id.clone()));
        }
        Ok(())
    }

    /// Configured peer id, if one is set and well-formed.
    pub fn peer_id_bytes(&self) -> Option<[u8; 32]> {
        let bytes = hex::decode(&self.identity.peer_id).ok()?;
        bytes.try_into().ok()
    }

    /// Apply SCENECAST_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SCENECAST_IDENTITY__PEER_ID") {
            self.identity.peer_id = v;
        }
        if let Ok(v) = std::env::var("SCENECAST_TRANSPORT__MAX_PACKET_SIZE") {
            if let Ok(n) = v.parse() {
                self.transport.max_packet_size = n;
            }
        }
        if let Ok(v) = std::env::var("SCENECAST_TRANSPORT__RESOURCE_PACKET_SIZE") {
            if let Ok(n) = v.parse() {
                self.transport.resource_packet_size = n;
            }
        }
        if let Ok(v) = std::env::var("SCENECAST_TRANSPORT__MAX_UPDATE_SIZE") {
            if let Ok(n) = v.parse() {
                self.transport.max_update_size = n;
            }
        }
        if let Ok(v) = std::env::var("SCENECAST_CACHE__LOAD_BUDGET_BYTES") {
            if let Ok(n) = v.parse() {
                self.cache.load_budget_bytes = n;
            }
        }
    }
}
