//! Daemon configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with `DAQ_LOGGER_`, nested keys separated by `__`)
//!
//! # Example
//! ```no_run
//! use daq_run_logger::config::DaemonConfig;
//!
//! let config = DaemonConfig::load_from("config/daemon.toml")?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), daq_run_logger::error::LoggerError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, LoggerError};

/// Top-level daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Worker and polling settings
    #[serde(default)]
    pub daemon: DaemonSettings,
    /// Run source settings
    #[serde(default)]
    pub source: SourceConfig,
    /// Logger definitions
    #[serde(default)]
    pub loggers: Vec<LoggerDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Worker pool and polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Interval between run source polls
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Time each worker gets to drain its queue on shutdown
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Per-logger queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Run source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// JSON Lines run log written by the DAQ
    #[serde(default = "default_source_path")]
    pub path: PathBuf,
}

/// Logger definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerDefinition {
    /// Unique logger identifier
    pub id: String,
    /// Logger type (e.g., "stdout", "shell", "ecl")
    pub r#type: String,
    /// Whether this logger is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Logger-specific configuration (dynamic)
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

// Default value functions
fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_queue_capacity() -> usize {
    64
}

fn default_source_path() -> PathBuf {
    PathBuf::from("runs.jsonl")
}

fn default_enabled() -> bool {
    true
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: default_source_path(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a specific file path, with environment overrides
    ///
    /// Example: `DAQ_LOGGER_APPLICATION__LOG_LEVEL=debug`
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LoggerError::Configuration(format!(
                "Configuration file '{}' not found",
                path.display()
            )));
        }
        Ok(Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("DAQ_LOGGER_").split("__"))
            .extract()?)
    }

    /// Parse configuration from a TOML string (no environment overrides)
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Ok(Figment::new().merge(Toml::string(toml)).extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(LoggerError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(LoggerError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.daemon.queue_capacity == 0 {
            return Err(LoggerError::Configuration(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.daemon.poll_interval.is_zero() {
            return Err(LoggerError::Configuration(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for logger in &self.loggers {
            if logger.id.trim().is_empty() {
                return Err(LoggerError::Configuration(format!(
                    "Logger of type '{}' has an empty id",
                    logger.r#type
                )));
            }
            if !ids.insert(&logger.id) {
                return Err(LoggerError::Configuration(format!(
                    "Duplicate logger ID: {}",
                    logger.id
                )));
            }
        }

        Ok(())
    }

    /// Get all enabled loggers
    pub fn enabled_loggers(&self) -> Vec<&LoggerDefinition> {
        self.loggers.iter().filter(|l| l.enabled).collect()
    }
}
