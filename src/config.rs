//! Configuration module for the tree watcher.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `TREEWATCH_` and use double
//! underscores to separate nested levels:
//! - `TREEWATCH_WATCH__BLOCK_DURATION_MS=250` sets `watch.block_duration_ms`
//! - `TREEWATCH_LOGGING__DEFAULT=debug` sets `logging.default`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::watcher::{
    BlockDuration, DEFAULT_READ_BUFFER_SIZE, EventMask, WatchError, WatchOptions, WatchResult,
};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "TREEWATCH_";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// What to watch and how
    #[serde(default)]
    pub watch: WatchConfig,

    /// Log levels
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WatchConfig {
    /// Directory trees to watch
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    /// Symbolic event names to observe, e.g. `IN_CREATE` or `IN_ALL_EVENTS`
    #[serde(default = "default_mask")]
    pub mask: Vec<String>,

    /// Longest time one poll may block, in milliseconds
    #[serde(default = "default_block_duration_ms")]
    pub block_duration_ms: u64,

    /// Bytes requested per kernel read
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Level for everything not listed in `modules`
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-target level overrides
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_mask() -> Vec<String> {
    vec!["IN_ALL_EVENTS".to_string()]
}
fn default_block_duration_ms() -> u64 {
    1000
}
fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            watch: WatchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            mask: default_mask(),
            block_duration_ms: default_block_duration_ms(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load configuration from defaults and environment overrides.
    pub fn load() -> WatchResult<Self> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(WatchError::from)
    }

    /// Load configuration from a specific file, then environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> WatchResult<Self> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(WatchError::from)
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> WatchResult<()> {
        let path = path.as_ref();
        let config_error = |reason: String| WatchError::ConfigError { reason };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| config_error(format!("cannot create {}: {e}", parent.display())))?;
        }

        let toml_string =
            toml::to_string_pretty(self).map_err(|e| config_error(format!("cannot serialize: {e}")))?;
        std::fs::write(path, toml_string)
            .map_err(|e| config_error(format!("cannot write {}: {e}", path.display())))?;

        Ok(())
    }

    /// Turn the `[watch]` section into watcher options.
    pub fn watch_options(&self) -> WatchResult<WatchOptions> {
        Ok(WatchOptions {
            mask: EventMask::from_symbols(&self.watch.mask)?,
            block_duration: BlockDuration::Fixed(Duration::from_millis(self.watch.block_duration_ms)),
            read_buffer_size: self.watch.read_buffer_size,
        })
    }
}
