//! Client configuration at `~/.espterm/config.toml`.
//!
//! Provides the default device, connect timeout, and log sizing.
//! CLI flags always override config file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use espterm_client::SessionConfig;
use espterm_core::log::{DEFAULT_CAPACITY, DEFAULT_TRIM_BLOCK};
use espterm_core::{Endpoint, LogStore};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Default connection settings.
    #[serde(default)]
    pub default: DefaultConfig,

    /// Log buffer sizing.
    #[serde(default)]
    pub log: LogConfig,
}

/// Default connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultConfig {
    /// Default device host (empty = none).
    #[serde(default)]
    pub host: String,

    /// Default device port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// TCP connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// `[log]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_trim_block")]
    pub trim_block: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            trim_block: default_trim_block(),
        }
    }
}

// Telnet port, what the device firmware listens on.
fn default_port() -> u16 {
    23
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_trim_block() -> usize {
    DEFAULT_TRIM_BLOCK
}

impl Config {
    /// `~/.espterm/config.toml`.
    pub fn default_path() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_default();
        home.join(".espterm").join("config.toml")
    }

    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Session tunables, with an optional timeout override in milliseconds.
    pub fn session_config(&self, timeout_ms: Option<u64>) -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(
                timeout_ms.unwrap_or(self.default.connect_timeout_ms),
            ),
            ..SessionConfig::default()
        }
    }

    pub fn log_store(&self) -> LogStore {
        LogStore::new(self.log.capacity, self.log.trim_block)
    }

    /// Resolve the device to talk to.
    ///
    /// `target` wins over the configured host; a port inside `target` wins
    /// over `port`, which wins over the configured port.
    pub fn resolve_endpoint(&self, target: Option<&str>, port: Option<u16>) -> Result<Endpoint> {
        let target = match target {
            Some(t) => t,
            None if !self.default.host.is_empty() => self.default.host.as_str(),
            None => anyhow::bail!("no host given and no default host configured"),
        };
        let endpoint = Endpoint::parse(target, port.unwrap_or(self.default.port))
            .with_context(|| format!("invalid target '{target}'"))?;
        Ok(endpoint)
    }
}
