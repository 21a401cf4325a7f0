//! Per-logger worker tasks.
//!
//! Every logger is owned by exactly one task that consumes a bounded queue of run
//! records. Records are handled one at a time in submission order, so a logger never
//! sees two records concurrently and a slow destination only delays its own queue.
//!
//! ## Shutdown
//!
//! - [`WorkerHandle::stop`] closes the queue and waits for the records already queued
//!   to drain, aborting the task if the timeout expires.
//! - [`WorkerHandle::cancel`] signals the task to exit after the record in progress,
//!   discarding anything still queued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{AppResult, LoggerError};
use crate::logger::RunLogger;
use crate::run_info::RunInfo;

/// Live counters shared between a worker task and its handle.
#[derive(Debug, Default)]
struct WorkerStats {
    processed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of a worker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerCounts {
    /// Records the logger accepted
    pub processed: u64,
    /// Records rejected by `filter_run`
    pub skipped: u64,
    /// Records whose `log_run` returned an error
    pub failed: u64,
}

/// Runtime handle for a spawned logger worker.
///
/// Owns the queue sender, the shutdown channel and the task handle; the logger itself
/// lives inside the task.
pub struct WorkerHandle {
    id: String,
    queue_tx: Option<mpsc::Sender<RunInfo>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

/// Spawns logger tasks.
pub struct LoggerWorker;

impl LoggerWorker {
    /// Move `logger` into a new task fed by a queue of `capacity` records.
    pub fn spawn(id: impl Into<String>, logger: Box<dyn RunLogger>, capacity: usize) -> WorkerHandle {
        let id = id.into();
        let (queue_tx, queue_rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let stats = Arc::new(WorkerStats::default());

        let task_handle = tokio::spawn(Self::run(
            id.clone(),
            logger,
            queue_rx,
            shutdown_rx,
            stats.clone(),
        ));

        tracing::debug!(logger_id = %id, capacity, "Spawned logger worker");

        WorkerHandle {
            id,
            queue_tx: Some(queue_tx),
            shutdown_tx: Some(shutdown_tx),
            task_handle: Some(task_handle),
            stats,
        }
    }

    async fn run(
        id: String,
        mut logger: Box<dyn RunLogger>,
        mut queue_rx: mpsc::Receiver<RunInfo>,
        mut shutdown_rx: oneshot::Receiver<()>,
        stats: Arc<WorkerStats>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => {
                    tracing::debug!(logger_id = %id, "Worker received shutdown signal");
                    break;
                }
                next = queue_rx.recv() => {
                    let Some(info) = next else {
                        tracing::debug!(logger_id = %id, "Worker queue closed and drained");
                        break;
                    };
                    Self::handle(&id, logger.as_mut(), &info, &stats).await;
                }
            }
        }
    }

    async fn handle(id: &str, logger: &mut dyn RunLogger, info: &RunInfo, stats: &WorkerStats) {
        if !logger.filter_run(info) {
            stats.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(logger_id = id, run_number = info.run_number, "Run filtered by logger");
            return;
        }

        match logger.log_run(info).await {
            Ok(()) => {
                stats.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    logger_id = id,
                    run_number = info.run_number,
                    error = %e,
                    "Logger failed to log run"
                );
            }
        }
    }
}

impl WorkerHandle {
    /// Id of the logger this worker owns.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a record, waiting for space if the queue is full.
    pub async fn submit(&self, info: RunInfo) -> AppResult<()> {
        let sender = self
            .queue_tx
            .as_ref()
            .ok_or_else(|| LoggerError::WorkerStopped(self.id.clone()))?;
        sender
            .send(info)
            .await
            .map_err(|_| LoggerError::WorkerStopped(self.id.clone()))
    }

    /// Records queued but not yet picked up by the task.
    pub fn pending(&self) -> usize {
        self.queue_tx
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity())
    }

    /// Snapshot of the worker's counters.
    pub fn counts(&self) -> WorkerCounts {
        WorkerCounts {
            processed: self.stats.processed.load(Ordering::Relaxed),
            skipped: self.stats.skipped.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }

    /// Whether the task has not finished yet.
    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Ask the task to exit after the record in progress. Queued records are dropped.
    pub fn cancel(&mut self) {
        self.queue_tx = None;
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }

    /// Close the queue and wait up to `timeout` for the queued records to drain.
    ///
    /// Calling `stop` again after it returned is a no-op. If the returned future is
    /// dropped early the task keeps its handle, so a later `stop` still waits for it.
    pub async fn stop(&mut self, timeout: Duration) -> AppResult<()> {
        self.queue_tx = None;
        let Some(task_handle) = self.task_handle.as_mut() else {
            return Ok(());
        };

        let waited = tokio::time::timeout(timeout, &mut *task_handle).await;
        let result = match waited {
            Ok(Ok(())) => {
                tracing::info!(logger_id = %self.id, "Logger worker stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(logger_id = %self.id, error = %e, "Logger worker task panicked");
                Err(LoggerError::logger(&self.id, format!("worker task failed: {e}")))
            }
            Err(_) => {
                tracing::warn!(
                    logger_id = %self.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Logger worker did not drain in time, aborting"
                );
                task_handle.abort();
                // Wait for the cancelled task so the logger is dropped before returning
                let _ = task_handle.await;
                Err(LoggerError::logger(
                    &self.id,
                    format!("did not drain within {timeout:?}"),
                ))
            }
        };
        self.task_handle = None;
        self.shutdown_tx = None;
        result
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}
