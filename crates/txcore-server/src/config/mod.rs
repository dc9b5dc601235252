//! Server configuration.
//!
//! This module provides configuration management for the txcored daemon.
//! The transaction core's own sections live under `[core]`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use txcore_common::config::CoreConfig;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Data directory for persistent state.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// WAL directory (defaults to data_dir/wal).
    #[serde(default)]
    pub wal_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Seconds between status summaries in the log. Zero disables them.
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,

    /// Transaction core configuration.
    #[serde(default)]
    pub core: CoreConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_status_interval() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            wal_dir: None,
            log_level: default_log_level(),
            status_interval_secs: default_status_interval(),
            core: CoreConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Creates a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Saves configuration to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Converts configuration to TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Returns the effective WAL directory.
    pub fn effective_wal_dir(&self) -> PathBuf {
        self.wal_dir
            .clone()
            .or_else(|| self.data_dir.as_ref().map(|d| d.join("wal")))
            .unwrap_or_else(|| self.core.wal.dir.clone())
    }

    /// Returns the core configuration with the WAL directory resolved.
    pub fn core_config(&self) -> CoreConfig {
        let mut core = self.core.clone();
        core.wal.dir = self.effective_wal_dir();
        core
    }

    /// Returns the status logging interval, if enabled.
    pub fn status_interval(&self) -> Option<Duration> {
        (self.status_interval_secs > 0).then(|| Duration::from_secs(self.status_interval_secs))
    }

    /// Checks the configuration for invalid values.
    pub fn validate(&self) -> Result<()> {
        self.core_config()
            .validate()
            .context("invalid core configuration")
    }

    /// Creates a builder for configuration.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}

/// Builder for server configuration.
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the data directory.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = Some(dir.into());
        self
    }

    /// Sets the WAL directory.
    pub fn wal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.wal_dir = Some(dir.into());
        self
    }

    /// Sets the log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    /// Sets the status logging interval in seconds.
    pub fn status_interval_secs(mut self, secs: u64) -> Self {
        self.config.status_interval_secs = secs;
        self
    }

    /// Replaces the core configuration.
    pub fn core(mut self, core: CoreConfig) -> Self {
        self.config.core = core;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}
