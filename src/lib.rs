//! # DAQ Run Logger
//!
//! This crate forwards DAQ run records (run number, start/end time, configuration,
//! components, comments) to external bookkeeping platforms: shell commands, a JSON
//! HTTP endpoint, a Google Sheets spreadsheet and the Fermilab electronic logbook
//! (ECL). The library holds every logger and the daemon; `main.rs` is a thin CLI on top.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based loading and validation of the daemon's TOML
//!   configuration. See `config::DaemonConfig`.
//! - **`daemon`**: `LoggerDaemon`, the factory registry that builds loggers from
//!   configuration, fans records out to them and shuts them down.
//! - **`error`**: The crate-wide `LoggerError` enum and `AppResult` alias.
//! - **`logger`**: The `RunLogger` trait every destination implements, plus the
//!   trivial stdout logger.
//! - **`loggers`**: Concrete destinations (shell, HTTP JSON, Google Sheets, ECL).
//! - **`run_info`**: The `RunInfo` record and attribute lookup.
//! - **`source`**: Where the daemon learns about runs (a JSON Lines run log).
//! - **`tracing_init`**: Subscriber setup for structured logging.
//! - **`worker`**: One tokio task and bounded queue per logger.

pub mod config;
pub mod daemon;
pub mod error;
pub mod logger;
pub mod loggers;
pub mod run_info;
pub mod source;
pub mod tracing_init;
pub mod worker;

pub use daemon::LoggerDaemon;
pub use error::{AppResult, LoggerError};
pub use logger::RunLogger;
pub use run_info::RunInfo;
