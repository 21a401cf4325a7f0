//! CLI Entry Point for daq-logger
//!
//! Provides command-line interface for:
//! - Running the logger daemon against the DAQ run log
//! - Posting a single run record by hand (backfilling or testing a destination)
//! - Checking a configuration file without starting anything
//!
//! # Usage
//!
//! Start daemon:
//! ```bash
//! daq-logger daemon --config config/daemon.toml
//! ```
//!
//! Post one run:
//! ```bash
//! daq-logger post --config config/daemon.toml --run-number 17215 \
//!     --configuration physics --start-time "2024-03-14 09:00:00"
//! ```

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use daq_run_logger::config::DaemonConfig;
use daq_run_logger::source::JsonLinesRunSource;
use daq_run_logger::{tracing_init, LoggerDaemon, RunInfo};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long a cancelled logger gets to finish the record in progress
const FORCED_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "daq-logger")]
#[command(about = "Forward DAQ run records to external logbooks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the logger daemon until interrupted
    Daemon {
        /// Path to the daemon configuration file
        #[arg(long, default_value = "config/daemon.toml")]
        config: PathBuf,
    },

    /// Send one run record to every configured logger
    Post {
        /// Path to the daemon configuration file
        #[arg(long, default_value = "config/daemon.toml")]
        config: PathBuf,

        #[arg(long)]
        run_number: u64,

        /// DAQ configuration name
        #[arg(long)]
        configuration: String,

        /// Start time, e.g. "2024-03-14 09:00:00" (defaults to now)
        #[arg(long, value_parser = parse_timestamp)]
        start_time: Option<NaiveDateTime>,

        /// End time; omit for a run still in progress
        #[arg(long, value_parser = parse_timestamp)]
        end_time: Option<NaiveDateTime>,

        /// Participating component (repeatable)
        #[arg(long = "component")]
        components: Vec<String>,

        #[arg(long)]
        comments: Option<String>,
    },

    /// Load and validate a configuration file, then list its loggers
    CheckConfig {
        /// Path to the daemon configuration file
        #[arg(long, default_value = "config/daemon.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon { config } => run_daemon(&config).await,
        Commands::Post {
            config,
            run_number,
            configuration,
            start_time,
            end_time,
            components,
            comments,
        } => {
            let start_time = start_time.unwrap_or_else(|| chrono::Local::now().naive_local());
            let mut info = RunInfo::new(run_number, start_time, configuration)
                .with_components(components);
            info.end_time = end_time;
            info.comments = comments;
            post_run(&config, info).await
        }
        Commands::CheckConfig { config } => check_config(&config),
    }
}

fn load_config(path: &Path) -> Result<DaemonConfig> {
    let config = DaemonConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config.validate()?;
    tracing_init::init_from_config(&config)?;
    Ok(config)
}

async fn run_daemon(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    tracing::info!(
        name = %config.application.name,
        source = %config.source.path.display(),
        "Starting logger daemon"
    );

    let mut daemon = LoggerDaemon::with_builtin_loggers(config.daemon.queue_capacity);
    daemon.load_from_config(&config.loggers)?;

    let mut source = JsonLinesRunSource::new(&config.source.path);
    daemon
        .run(&mut source, config.daemon.poll_interval, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
            }
        })
        .await;

    tracing::info!("Draining logger queues, press ctrl-c again to discard them");
    let drained = tokio::select! {
        result = daemon.shutdown_all(config.daemon.shutdown_timeout) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    match drained {
        Some(result) => result?,
        None => {
            daemon.cancel_all();
            daemon.shutdown_all(FORCED_SHUTDOWN_TIMEOUT).await?;
        }
    }
    tracing::info!("Logger daemon stopped");
    Ok(())
}

async fn post_run(config_path: &Path, info: RunInfo) -> Result<()> {
    let config = load_config(config_path)?;

    let mut daemon = LoggerDaemon::with_builtin_loggers(config.daemon.queue_capacity);
    daemon.load_from_config(&config.loggers)?;

    let accepted = daemon.dispatch(&info).await;
    daemon.shutdown_all(config.daemon.shutdown_timeout).await?;

    for stats in daemon.stats() {
        println!(
            "{:<20} processed={} skipped={} failed={}",
            stats.id, stats.counts.processed, stats.counts.skipped, stats.counts.failed
        );
    }
    println!("Run {} queued to {accepted} logger(s)", info.run_number);
    Ok(())
}

fn check_config(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;

    println!("Configuration OK: {}", config.application.name);
    println!("  Run source: {}", config.source.path.display());
    println!(
        "  Poll interval: {:?}, queue capacity: {}",
        config.daemon.poll_interval, config.daemon.queue_capacity
    );
    for logger in &config.loggers {
        let state = if logger.enabled { "enabled" } else { "disabled" };
        println!("  - {} ({}) [{state}]", logger.id, logger.r#type);
    }
    Ok(())
}

fn parse_timestamp(value: &str) -> Result<NaiveDateTime, String> {
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%m/%d/%Y %H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .ok_or_else(|| format!("invalid timestamp '{value}', expected YYYY-MM-DD HH:MM:SS"))
}
