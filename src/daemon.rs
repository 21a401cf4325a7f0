//! Logger daemon - fans run records out to every configured logger
//!
//! ## Responsibilities
//!
//! 1. **Configuration**: Reads `[[loggers]]` from TOML and uses a factory registry to
//!    build each logger from its type name
//! 2. **Lifecycle**: Spawns one [`LoggerWorker`] task per logger and orchestrates
//!    graceful shutdown
//! 3. **Data Flow**: Polls a [`RunSource`] and hands every new or changed record to
//!    all workers
//!
//! A failing logger never affects the others: errors are logged by its worker and
//! the daemon keeps dispatching.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::config::LoggerDefinition;
use crate::error::{AppResult, LoggerError};
use crate::logger::{RunLogger, StdoutRunLogger};
use crate::loggers::ecl::{EclClient, EclRunLogger};
use crate::loggers::google_sheets::{GoogleSheetsRunLogger, SheetsClient};
use crate::loggers::{HttpJsonRunLogger, ShellRunLogger};
use crate::run_info::RunInfo;
use crate::source::RunSource;
use crate::worker::{LoggerWorker, WorkerCounts, WorkerHandle};

/// Factory function signature for creating loggers from configuration
///
/// Takes the logger ID and its `[loggers.config]` table, returns a boxed trait object.
pub type LoggerFactory = fn(&str, &toml::Value) -> AppResult<Box<dyn RunLogger>>;

/// Per-logger snapshot returned by [`LoggerDaemon::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggerStats {
    /// Logger id from configuration
    pub id: String,
    /// Processed, skipped and failed records so far
    pub counts: WorkerCounts,
    /// Records waiting in the queue
    pub pending: usize,
    /// Whether the worker task is still alive
    pub running: bool,
}

/// Orchestrates logger workers.
pub struct LoggerDaemon {
    /// Registry mapping logger type names to factory functions
    ///
    /// Example: "ecl" -> EclRunLogger::from_config
    factories: HashMap<String, LoggerFactory>,

    /// Active workers in configuration order
    workers: Vec<WorkerHandle>,

    queue_capacity: usize,
}

impl LoggerDaemon {
    /// Create a daemon with an empty factory registry
    ///
    /// Call `register_factory()` to add logger types before loading from config.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            factories: HashMap::new(),
            workers: Vec::new(),
            queue_capacity,
        }
    }

    /// Create a daemon with every built-in logger type registered
    pub fn with_builtin_loggers(queue_capacity: usize) -> Self {
        let mut daemon = Self::new(queue_capacity);
        daemon.register_factory("stdout", StdoutRunLogger::from_config);
        daemon.register_factory("shell", ShellRunLogger::from_config);
        daemon.register_factory("http_json", HttpJsonRunLogger::from_config);
        daemon.register_factory(
            "google_sheets",
            GoogleSheetsRunLogger::<SheetsClient>::from_config,
        );
        daemon.register_factory("ecl", EclRunLogger::<EclClient>::from_config);
        daemon
    }

    /// Register a factory function for a logger type
    ///
    /// # Example
    ///
    /// ```ignore
    /// daemon.register_factory("stdout", StdoutRunLogger::from_config);
    /// ```
    pub fn register_factory(&mut self, type_name: impl Into<String>, factory: LoggerFactory) {
        self.factories.insert(type_name.into(), factory);
    }

    /// Load loggers from configuration
    ///
    /// Disabled definitions are skipped. Stops at the first definition that fails.
    ///
    /// # Configuration Format
    ///
    /// ```toml
    /// [[loggers]]
    /// id = "echo"
    /// type = "shell"
    /// [loggers.config]
    /// command = "echo"
    /// forward_attrs = ["run_number"]
    /// ```
    pub fn load_from_config(&mut self, definitions: &[LoggerDefinition]) -> AppResult<()> {
        for definition in definitions {
            if !definition.enabled {
                tracing::info!(logger_id = %definition.id, "Logger disabled, skipping");
                continue;
            }
            self.spawn_logger(definition)?;
        }
        Ok(())
    }

    fn spawn_logger(&mut self, definition: &LoggerDefinition) -> AppResult<()> {
        let id = definition.id.as_str();
        if self.workers.iter().any(|w| w.id() == id) {
            return Err(LoggerError::logger(id, "duplicate logger id"));
        }

        let factory = self.factories.get(&definition.r#type).ok_or_else(|| {
            LoggerError::logger(id, format!("unknown logger type '{}'", definition.r#type))
        })?;

        let logger = factory(id, &definition.config).map_err(|e| {
            LoggerError::logger(
                id,
                format!("failed to create '{}' logger: {e}", definition.r#type),
            )
        })?;

        tracing::info!(logger_id = id, logger_type = %definition.r#type, "Logger loaded");
        self.workers
            .push(LoggerWorker::spawn(id, logger, self.queue_capacity));
        Ok(())
    }

    /// Add an already constructed logger
    pub fn add_logger(&mut self, id: impl Into<String>, logger: Box<dyn RunLogger>) -> AppResult<()> {
        let id = id.into();
        if self.workers.iter().any(|w| w.id() == id) {
            return Err(LoggerError::logger(id, "duplicate logger id"));
        }
        self.workers
            .push(LoggerWorker::spawn(id, logger, self.queue_capacity));
        Ok(())
    }

    /// Submit a record to every worker
    ///
    /// Returns how many workers accepted it. Waits while a worker's queue is full.
    pub async fn dispatch(&self, info: &RunInfo) -> usize {
        let mut accepted = 0;
        for worker in &self.workers {
            match worker.submit(info.clone()).await {
                Ok(()) => accepted += 1,
                Err(e) => {
                    tracing::warn!(
                        logger_id = worker.id(),
                        run_number = info.run_number,
                        error = %e,
                        "Could not queue run"
                    );
                }
            }
        }
        tracing::debug!(run_number = info.run_number, accepted, "Run dispatched");
        accepted
    }

    async fn dispatch_all(&self, records: &[RunInfo]) {
        for info in records {
            self.dispatch(info).await;
        }
    }

    /// IDs of all loaded loggers
    pub fn list_loggers(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.id().to_string()).collect()
    }

    /// Counters and queue depth for every worker
    pub fn stats(&self) -> Vec<LoggerStats> {
        self.workers
            .iter()
            .map(|w| LoggerStats {
                id: w.id().to_string(),
                counts: w.counts(),
                pending: w.pending(),
                running: w.is_running(),
            })
            .collect()
    }

    /// Poll `source` every `poll_interval` and dispatch what it yields until
    /// `shutdown` resolves
    ///
    /// Source errors are logged and polling continues. Workers are left running;
    /// call [`LoggerDaemon::shutdown_all`] afterwards.
    pub async fn run<S, F>(&self, source: &mut S, poll_interval: Duration, shutdown: F)
    where
        S: RunSource + ?Sized,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            loggers = self.workers.len(),
            poll_interval_ms = poll_interval.as_millis() as u64,
            "Daemon started"
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    let records = match source.poll().await {
                        Ok(records) => records,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to poll run source");
                            continue;
                        }
                    };
                    // A full queue must not hold off shutdown
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => {
                            tracing::info!(
                                undispatched = records.len(),
                                "Shutdown requested while dispatching"
                            );
                            break;
                        }
                        _ = self.dispatch_all(&records) => {}
                    }
                }
            }
        }
    }

    /// Tell every worker to exit after its current record, discarding queued records
    pub fn cancel_all(&mut self) {
        tracing::warn!(loggers = self.workers.len(), "Cancelling loggers");
        for worker in &mut self.workers {
            worker.cancel();
        }
    }

    /// Gracefully stop every worker, giving each up to `timeout` to drain
    ///
    /// All workers are stopped even if some fail; failures are collected into
    /// [`LoggerError::ShutdownFailed`].
    pub async fn shutdown_all(&mut self, timeout: Duration) -> AppResult<()> {
        tracing::info!(loggers = self.workers.len(), "Shutting down loggers");

        let mut errors = Vec::new();
        for worker in &mut self.workers {
            if let Err(e) = worker.stop(timeout).await {
                tracing::error!(logger_id = worker.id(), error = %e, "Logger shutdown failed");
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(LoggerError::ShutdownFailed(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    struct CountingLogger {
        id: String,
        seen: Arc<Mutex<Vec<(String, u64)>>>,
    }

    #[async_trait]
    impl RunLogger for CountingLogger {
        fn name(&self) -> &str {
            &self.id
        }

        async fn log_run(&mut self, info: &RunInfo) -> AppResult<()> {
            self.seen
                .lock()
                .unwrap()
                .push((self.id.clone(), info.run_number));
            Ok(())
        }
    }

    fn definition(id: &str, type_name: &str, enabled: bool) -> LoggerDefinition {
        LoggerDefinition {
            id: id.to_string(),
            r#type: type_name.to_string(),
            enabled,
            config: toml::Value::Table(toml::map::Map::new()),
        }
    }

    fn run(n: u64) -> RunInfo {
        let start = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        RunInfo::new(n, start, "test")
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let mut daemon = LoggerDaemon::with_builtin_loggers(4);
        let err = daemon
            .load_from_config(&[definition("mystery", "carrier_pigeon", true)])
            .unwrap_err();
        assert!(matches!(err, LoggerError::Logger { ref logger, .. } if logger == "mystery"));
        assert!(err.to_string().contains("carrier_pigeon"));
    }

    #[tokio::test]
    async fn test_disabled_loggers_not_spawned() {
        let mut daemon = LoggerDaemon::with_builtin_loggers(4);
        daemon
            .load_from_config(&[
                definition("console", "stdout", true),
                definition("quiet", "stdout", false),
            ])
            .unwrap();
        assert_eq!(daemon.list_loggers(), vec!["console".to_string()]);
        daemon.shutdown_all(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let mut daemon = LoggerDaemon::with_builtin_loggers(4);
        let err = daemon
            .load_from_config(&[
                definition("console", "stdout", true),
                definition("console", "stdout", true),
            ])
            .unwrap_err();
        assert!(err.to_string().contains("duplicate logger id"));
        daemon.shutdown_all(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_factory_failure_carries_id() {
        let mut daemon = LoggerDaemon::with_builtin_loggers(4);
        // shell logger requires a command
        let err = daemon
            .load_from_config(&[definition("broken", "shell", true)])
            .unwrap_err();
        assert!(matches!(err, LoggerError::Logger { ref logger, .. } if logger == "broken"));
    }

    #[tokio::test]
    async fn test_dispatch_reaches_all_loggers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut daemon = LoggerDaemon::new(8);
        for id in ["a", "b", "c"] {
            daemon
                .add_logger(
                    id,
                    Box::new(CountingLogger {
                        id: id.to_string(),
                        seen: seen.clone(),
                    }),
                )
                .unwrap();
        }

        assert_eq!(daemon.dispatch(&run(7)).await, 3);
        assert_eq!(daemon.dispatch(&run(8)).await, 3);
        daemon.shutdown_all(Duration::from_secs(5)).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 6);
        for id in ["a", "b", "c"] {
            let runs: Vec<u64> = seen.iter().filter(|(l, _)| l == id).map(|(_, n)| *n).collect();
            assert_eq!(runs, vec![7, 8]);
        }

        let stats = daemon.stats();
        assert!(stats.iter().all(|s| s.counts.processed == 2 && !s.running));
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_accepts_nothing() {
        let mut daemon = LoggerDaemon::with_builtin_loggers(4);
        daemon
            .load_from_config(&[definition("console", "stdout", true)])
            .unwrap();
        daemon.shutdown_all(Duration::from_secs(1)).await.unwrap();
        assert_eq!(daemon.dispatch(&run(1)).await, 0);
    }

    /// Sleeps through every record; flags when it is dropped.
    #[derive(Default)]
    struct StuckLogger {
        dropped: Arc<AtomicBool>,
    }

    impl Drop for StuckLogger {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RunLogger for StuckLogger {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn log_run(&mut self, _info: &RunInfo) -> AppResult<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_dispatch_to_full_queue() {
        let mut daemon = LoggerDaemon::new(1);
        daemon.add_logger("stuck", Box::<StuckLogger>::default()).unwrap();

        let mut source = ScriptedSource {
            batches: vec![Ok((1..=5).map(run).collect())],
        };

        let returned = tokio::time::timeout(
            Duration::from_secs(3),
            daemon.run(
                &mut source,
                Duration::from_millis(10),
                tokio::time::sleep(Duration::from_millis(100)),
            ),
        )
        .await;
        assert!(returned.is_ok(), "run ignored shutdown while a queue was full");

        daemon.cancel_all();
        daemon.shutdown_all(Duration::from_millis(50)).await.unwrap_err();
    }

    #[tokio::test]
    async fn test_shutdown_all_resumes_after_interrupted_stop() {
        let dropped = Arc::new(AtomicBool::new(false));
        let mut daemon = LoggerDaemon::new(4);
        daemon
            .add_logger(
                "stuck",
                Box::new(StuckLogger {
                    dropped: dropped.clone(),
                }),
            )
            .unwrap();
        daemon.dispatch(&run(1)).await;
        daemon.dispatch(&run(2)).await;

        // Graceful stop abandoned part way, as a second ctrl-c does
        let interrupted =
            tokio::time::timeout(Duration::from_millis(50), daemon.shutdown_all(Duration::from_secs(30))).await;
        assert!(interrupted.is_err());

        daemon.cancel_all();
        let started = std::time::Instant::now();
        let _ = daemon.shutdown_all(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(daemon.stats().iter().all(|s| !s.running));
        assert!(dropped.load(Ordering::SeqCst), "stuck logger task was left running");
    }

    struct ScriptedSource {
        batches: Vec<AppResult<Vec<RunInfo>>>,
    }

    #[async_trait]
    impl RunSource for ScriptedSource {
        async fn poll(&mut self) -> AppResult<Vec<RunInfo>> {
            if self.batches.is_empty() {
                Ok(Vec::new())
            } else {
                self.batches.remove(0)
            }
        }
    }

    #[tokio::test]
    async fn test_run_survives_source_errors_and_stops_on_shutdown() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut daemon = LoggerDaemon::new(8);
        daemon
            .add_logger(
                "a",
                Box::new(CountingLogger {
                    id: "a".to_string(),
                    seen: seen.clone(),
                }),
            )
            .unwrap();

        let mut source = ScriptedSource {
            batches: vec![
                Ok(vec![run(1)]),
                Err(LoggerError::Http("source offline".to_string())),
                Ok(vec![run(2), run(3)]),
            ],
        };

        daemon
            .run(
                &mut source,
                Duration::from_millis(10),
                tokio::time::sleep(Duration::from_millis(200)),
            )
            .await;
        daemon.shutdown_all(Duration::from_secs(5)).await.unwrap();

        let runs: Vec<u64> = seen.lock().unwrap().iter().map(|(_, n)| *n).collect();
        assert_eq!(runs, vec![1, 2, 3]);
    }
}
