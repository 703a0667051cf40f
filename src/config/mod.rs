//! Node configuration
//!
//! Loaded from JSON or TOML; every field has a default so partial files work.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::network::message::MAX_INVENTORY_COUNT;
use crate::network::Network;

/// Synchronization tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds before an unanswered getdata is re-requested or given up
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Period of the timeout/request/prune tick in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Largest inv or getdata we process or send
    #[serde(default = "default_max_inventory_count")]
    pub max_inventory_count: usize,

    /// Largest locator we send
    #[serde(default = "default_max_block_hash_count")]
    pub max_block_hash_count: usize,

    /// Missing entries that failed more often than this are purged
    #[serde(default = "default_max_failed_download_count")]
    pub max_failed_download_count: u32,

    /// Minimum seconds between download attempts for one entry
    #[serde(default = "default_download_retry_secs")]
    pub download_retry_secs: u64,

    #[serde(default = "default_max_blocks_in_flight_per_peer")]
    pub max_blocks_in_flight_per_peer: usize,

    /// Entries considered per request pass
    #[serde(default = "default_max_incomplete_batch")]
    pub max_incomplete_batch: usize,
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_max_inventory_count() -> usize {
    MAX_INVENTORY_COUNT as usize - 1
}

fn default_max_block_hash_count() -> usize {
    500
}

fn default_max_failed_download_count() -> u32 {
    10
}

fn default_download_retry_secs() -> u64 {
    5
}

fn default_max_blocks_in_flight_per_peer() -> usize {
    16
}

fn default_max_incomplete_batch() -> usize {
    128
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            tick_interval_ms: default_tick_interval_ms(),
            max_inventory_count: default_max_inventory_count(),
            max_block_hash_count: default_max_block_hash_count(),
            max_failed_download_count: default_max_failed_download_count(),
            download_retry_secs: default_download_retry_secs(),
            max_blocks_in_flight_per_peer: default_max_blocks_in_flight_per_peer(),
            max_incomplete_batch: default_max_incomplete_batch(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("request_timeout_secs must be greater than 0"));
        }
        if self.tick_interval_ms == 0 {
            return Err(anyhow!("tick_interval_ms must be greater than 0"));
        }
        if self.max_inventory_count == 0 || self.max_inventory_count as u64 >= MAX_INVENTORY_COUNT {
            return Err(anyhow!(
                "max_inventory_count must be between 1 and {}, got {}",
                MAX_INVENTORY_COUNT - 1,
                self.max_inventory_count
            ));
        }
        if self.max_block_hash_count == 0 || self.max_block_hash_count > 500 {
            return Err(anyhow!(
                "max_block_hash_count must be between 1 and 500, got {}",
                self.max_block_hash_count
            ));
        }
        if self.max_blocks_in_flight_per_peer == 0 {
            return Err(anyhow!("max_blocks_in_flight_per_peer must be greater than 0"));
        }
        if self.max_incomplete_batch == 0 {
            return Err(anyhow!("max_incomplete_batch must be greater than 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// EnvFilter directive, e.g. "info" or "bitseg_node::node=debug"
    #[serde(default)]
    pub filter: Option<String>,

    /// Emit JSON lines (needs the `json-logging` feature)
    #[serde(default)]
    pub json_format: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub network: Network,

    /// Overrides the network's magic, for private test networks
    #[serde(default)]
    pub custom_magic: Option<[u8; 4]>,

    #[serde(default)]
    pub sync: SyncConfig,

    /// Peers to connect to at startup
    #[serde(default)]
    pub connect: Vec<SocketAddr>,

    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl NodeConfig {
    /// Load configuration from JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to JSON file
    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load by extension: `.toml` is TOML, anything else JSON
    pub fn from_file(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_file(path),
            _ => Self::from_json_file(path),
        }
    }

    /// Magic bytes framing every message on this network
    pub fn magic(&self) -> [u8; 4] {
        self.custom_magic.unwrap_or_else(|| self.network.magic())
    }

    pub fn validate(&self) -> Result<()> {
        self.sync.validate()?;
        if let Some(magic) = self.custom_magic {
            if magic == [0u8; 4] {
                return Err(anyhow!("custom_magic must not be all zero"));
            }
        }
        Ok(())
    }
}
