//! Configuration module for rowflow
//!
//! This module handles engine configuration:
//! - Channel sizing for newly wired pipelines
//! - The port range used for clustered execution
//! - Logging filter, log directory and log-registry bounds
//! - Remote execution servers known to this process (see [`remote`])
//!
//! # Config Location
//!
//! The config file is TOML, stored in the platform-appropriate location:
//! - **Linux**: `~/.config/dev.rowflow.engine/rowflow.toml`
//! - **macOS**: `~/Library/Application Support/dev.rowflow.engine/rowflow.toml`
//! - **Windows**: `%APPDATA%\dev.rowflow.engine\rowflow.toml`
//!
//! The binary lets `ROWFLOW_CONFIG` point somewhere else.
//!
//! # Example
//!
//! ```toml
//! [channel]
//! default_capacity = 10000
//!
//! [cluster]
//! port_range_start = 40000
//! port_range_size = 1000
//!
//! [logging]
//! filter = "info,rowflow=debug"
//! registry_max_size = 5000
//!
//! [[remote_servers]]
//! name = "slave-1"
//! hostname = "etl-01.local"
//! port = 8080
//! ```

pub mod remote;

pub use remote::{RemoteServer, RemoteServerConfig};

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Application identifier for config directories
pub const APP_ID: &str = "dev.rowflow.engine";

/// Config filename
pub const CONFIG_FILE: &str = "rowflow.toml";

/// Environment variable overriding the config path
pub const CONFIG_ENV_VAR: &str = "ROWFLOW_CONFIG";

/// Default row capacity of a channel between two step copies
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Default first port handed out for clustered hops
pub const DEFAULT_PORT_RANGE_START: u16 = 40_000;

/// Default number of ports available per host
pub const DEFAULT_PORT_RANGE_SIZE: u16 = 1_000;

/// Default bound on live log channels (0 = unbounded)
pub const DEFAULT_REGISTRY_MAX_SIZE: usize = 5_000;

// ==================== Config Location ====================

/// Get the config directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Get the default config file path
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join(CONFIG_FILE))
}

/// Config path from `ROWFLOW_CONFIG`, falling back to the default location
pub fn config_path_from_env() -> Option<PathBuf> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(path) if !path.is_empty() => Some(PathBuf::from(path)),
        _ => default_config_path(),
    }
}

// ==================== Sections ====================

/// Channel settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Rows buffered per channel before the producer blocks
    #[serde(default = "default_channel_capacity")]
    pub default_capacity: usize,
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            default_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Clustered execution settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    #[serde(default = "default_port_range_size")]
    pub port_range_size: u16,
}

fn default_port_range_start() -> u16 {
    DEFAULT_PORT_RANGE_START
}

fn default_port_range_size() -> u16 {
    DEFAULT_PORT_RANGE_SIZE
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            port_range_start: DEFAULT_PORT_RANGE_START,
            port_range_size: DEFAULT_PORT_RANGE_SIZE,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Bound on live log channels (0 = unbounded)
    #[serde(default = "default_registry_max_size")]
    pub registry_max_size: usize,

    /// Directory for daily-rolling log files; stderr only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_registry_max_size() -> usize {
    DEFAULT_REGISTRY_MAX_SIZE
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            registry_max_size: DEFAULT_REGISTRY_MAX_SIZE,
            log_dir: None,
        }
    }
}

// ==================== Engine Config ====================

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub channel: ChannelConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub remote_servers: Vec<RemoteServerConfig>,
}

impl EngineConfig {
    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            EngineError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, returning defaults if it is missing or invalid
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Self::default();
        }
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the config as TOML, creating parent directories as needed
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            EngineError::Config(format!("Failed to write {}: {}", path.display(), e))
        })
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.channel.default_capacity == 0 {
            return Err(EngineError::Config(
                "channel.default_capacity must be at least 1".to_string(),
            ));
        }
        if self.cluster.port_range_size == 0 {
            return Err(EngineError::Config(
                "cluster.port_range_size must be at least 1".to_string(),
            ));
        }
        let last_port = u32::from(self.cluster.port_range_start) + u32::from(self.cluster.port_range_size) - 1;
        if last_port > u32::from(u16::MAX) {
            return Err(EngineError::Config(format!(
                "cluster port range {}+{} exceeds {}",
                self.cluster.port_range_start,
                self.cluster.port_range_size,
                u16::MAX
            )));
        }

        let mut names = HashSet::new();
        for server in &self.remote_servers {
            if server.name.is_empty() {
                return Err(EngineError::Config("remote server without a name".to_string()));
            }
            if !names.insert(server.name.as_str()) {
                return Err(EngineError::Config(format!(
                    "remote server '{}' is listed twice",
                    server.name
                )));
            }
        }
        Ok(())
    }

    /// Find a configured remote server by name
    pub fn remote_server(&self, name: &str) -> Option<&RemoteServerConfig> {
        self.remote_servers.iter().find(|s| s.name == name)
    }
}
