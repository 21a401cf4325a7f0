//! The `RunLogger` abstraction shared by every destination.
//!
//! A logger forwards run records to one external platform. Loggers are built by
//! factory functions from their `[loggers.config]` table (see [`crate::daemon`]) and
//! then owned by exactly one worker task, so `log_run` takes `&mut self` and
//! implementations may keep caches and rate-limit state without locking.

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::{AppResult, LoggerError};
use crate::run_info::RunInfo;

/// A destination for DAQ run records.
#[async_trait]
pub trait RunLogger: Send {
    /// Identifier used in log output and error messages.
    fn name(&self) -> &str;

    /// Whether this logger wants the record at all. Rejected records are skipped by
    /// the worker without calling [`RunLogger::log_run`].
    fn filter_run(&self, _info: &RunInfo) -> bool {
        true
    }

    /// Forward one record to the destination.
    async fn log_run(&mut self, info: &RunInfo) -> AppResult<()>;
}

/// Deserialize a logger's settings table, attributing failures to the logger id.
pub fn parse_settings<T: DeserializeOwned>(id: &str, value: &toml::Value) -> AppResult<T> {
    value.clone().try_into().map_err(|e: toml::de::Error| {
        LoggerError::Configuration(format!("Invalid settings for logger '{id}': {e}"))
    })
}

/// Prints every record to stdout.
pub struct StdoutRunLogger {
    id: String,
}

impl StdoutRunLogger {
    /// Logger named `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Factory for `type = "stdout"`; takes no settings.
    pub fn from_config(id: &str, _settings: &toml::Value) -> AppResult<Box<dyn RunLogger>> {
        Ok(Box::new(Self::new(id)))
    }
}

#[async_trait]
impl RunLogger for StdoutRunLogger {
    fn name(&self) -> &str {
        &self.id
    }

    async fn log_run(&mut self, info: &RunInfo) -> AppResult<()> {
        println!("{info:?}");
        Ok(())
    }
}
