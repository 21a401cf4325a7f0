//! Custom error types for the application.
//!
//! This module defines the primary error type, `LoggerError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur, from configuration problems to
//! failed requests against a remote logbook.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type errors
//!   in the TOML configuration or environment overrides.
//! - **`Configuration`**: Semantic errors in the configuration that pass parsing but are
//!   logically incorrect (duplicate logger ids, unknown forwarded attributes, ...).
//! - **`Io`**: Wraps `std::io::Error`, covering file access and spawning shell commands.
//! - **`Http`** / **`Auth`**: Transport and credential failures against remote services.
//! - **`Logger`**: A destination accepted the request but reported a failure.
//! - **`WorkerStopped`**: A record was submitted to a worker whose task has already ended.
//!
//! By using `#[from]`, `LoggerError` can be created from the underlying error types,
//! so the `?` operator works throughout the crate.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, LoggerError>;

/// Every error the crate reports.
#[derive(Error, Debug)]
pub enum LoggerError {
    /// The configuration file or environment could not be parsed
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The configuration parsed but is not usable
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File access or process spawning failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A request failed or returned an error status
    #[error("HTTP error: {0}")]
    Http(String),

    /// Credentials could not be loaded or exchanged
    #[error("Authentication error: {0}")]
    Auth(String),

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Logbook XML could not be written or parsed
    #[error("XML error: {0}")]
    Xml(String),

    /// A destination reported a failure
    #[error("Logger '{logger}' failed: {message}")]
    Logger {
        /// Logger id
        logger: String,
        /// What went wrong
        message: String,
    },

    /// A record was submitted to a worker that has stopped
    #[error("Worker for logger '{0}' has stopped")]
    WorkerStopped(String),

    /// One or more workers failed to stop cleanly
    #[error("Shutdown failed with {} error(s)", .0.len())]
    ShutdownFailed(Vec<LoggerError>),
}

impl LoggerError {
    /// Shorthand for a failure reported by a named logger.
    pub fn logger(logger: impl Into<String>, message: impl Into<String>) -> Self {
        LoggerError::Logger {
            logger: logger.into(),
            message: message.into(),
        }
    }
}

impl From<figment::Error> for LoggerError {
    fn from(err: figment::Error) -> Self {
        LoggerError::Config(Box::new(err))
    }
}

impl From<reqwest::Error> for LoggerError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => LoggerError::Http(format!("{status}: {err}")),
            None => LoggerError::Http(err.to_string()),
        }
    }
}

impl From<quick_xml::Error> for LoggerError {
    fn from(err: quick_xml::Error) -> Self {
        LoggerError::Xml(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for LoggerError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        LoggerError::Auth(err.to_string())
    }
}
