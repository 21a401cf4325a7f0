//! Where the daemon learns about runs.
//!
//! The DAQ appends one JSON [`RunInfo`] per line to a run log: a record when a run
//! starts and another once it ends. [`JsonLinesRunSource`] remembers how far into the
//! file it has read and only parses lines appended since the previous poll.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::AppResult;
use crate::run_info::RunInfo;

/// A stream of new or updated run records.
#[async_trait]
pub trait RunSource: Send {
    /// Records that are new or changed since the previous call.
    async fn poll(&mut self) -> AppResult<Vec<RunInfo>>;
}

/// Run log in JSON Lines format.
///
/// A trailing line without a newline is left for the next poll, so a record the DAQ is
/// still writing is never parsed half-written. If the file shrinks (rotated or
/// truncated) it is read again from the start.
pub struct JsonLinesRunSource {
    path: PathBuf,
    /// Bytes of the file already consumed
    offset: u64,
    /// Lines already consumed, for warnings
    line: usize,
    /// Last record yielded for every run that has not ended yet
    in_progress: HashMap<u64, RunInfo>,
}

impl JsonLinesRunSource {
    /// Source reading the run log at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            line: 0,
            in_progress: HashMap::new(),
        }
    }

    /// Path of the run log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs seen starting but not yet ending.
    pub fn in_progress(&self) -> usize {
        self.in_progress.len()
    }

    async fn read_new_bytes(&mut self) -> AppResult<Vec<u8>> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::trace!(path = %self.path.display(), "Run log does not exist yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        if len < self.offset {
            tracing::warn!(
                path = %self.path.display(),
                len,
                offset = self.offset,
                "Run log shrank, reading it again from the start"
            );
            self.offset = 0;
            self.line = 0;
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        // Keep an unterminated last line for the next poll
        let complete = buf.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
        buf.truncate(complete);
        self.offset += complete as u64;
        Ok(buf)
    }
}

#[async_trait]
impl RunSource for JsonLinesRunSource {
    async fn poll(&mut self) -> AppResult<Vec<RunInfo>> {
        let bytes = self.read_new_bytes().await?;
        let contents = String::from_utf8_lossy(&bytes);

        let mut changed = Vec::new();
        for line in contents.lines() {
            self.line += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let info: RunInfo = match serde_json::from_str(line) {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        line = self.line,
                        error = %e,
                        "Skipping malformed run record"
                    );
                    continue;
                }
            };

            if self.in_progress.get(&info.run_number) == Some(&info) {
                continue;
            }
            if info.is_complete() {
                self.in_progress.remove(&info.run_number);
            } else {
                self.in_progress.insert(info.run_number, info.clone());
            }
            changed.push(info);
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tracing_test::traced_test;

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        write!(file, "{text}").unwrap();
    }

    fn append_line(path: &Path, line: &str) {
        append(path, &format!("{line}\n"));
    }

    const RUN_1_START: &str =
        r#"{"run_number": 1, "start_time": "2024-03-14T09:00:00", "configuration": "physics"}"#;
    const RUN_1_END: &str = r#"{"run_number": 1, "start_time": "2024-03-14T09:00:00", "configuration": "physics", "end_time": "2024-03-14T10:00:00"}"#;

    fn summary(records: &[RunInfo]) -> Vec<(u64, bool)> {
        records.iter().map(|r| (r.run_number, r.is_complete())).collect()
    }

    #[tokio::test]
    async fn test_missing_file_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = JsonLinesRunSource::new(dir.path().join("runs.jsonl"));
        assert!(source.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_only_new_or_changed_records_are_yielded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let mut source = JsonLinesRunSource::new(&path);

        append_line(&path, RUN_1_START);
        assert_eq!(summary(&source.poll().await.unwrap()), vec![(1, false)]);

        // Nothing changed
        assert!(source.poll().await.unwrap().is_empty());

        append_line(&path, RUN_1_END);
        append_line(&path, r#"{"run_number": 2, "start_time": "2024-03-14T10:05:00", "configuration": "physics"}"#);
        assert_eq!(summary(&source.poll().await.unwrap()), vec![(1, true), (2, false)]);
    }

    #[tokio::test]
    async fn test_ended_run_is_not_yielded_again() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        append_line(&path, RUN_1_START);
        append_line(&path, RUN_1_END);

        let mut source = JsonLinesRunSource::new(&path);
        assert_eq!(summary(&source.poll().await.unwrap()), vec![(1, false), (1, true)]);
        for _ in 0..3 {
            assert!(source.poll().await.unwrap().is_empty());
        }
        assert_eq!(source.in_progress(), 0);
    }

    #[tokio::test]
    async fn test_repeated_and_updated_in_progress_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let mut source = JsonLinesRunSource::new(&path);

        // The same record twice in one batch is yielded once
        append_line(&path, RUN_1_START);
        append_line(&path, RUN_1_START);
        assert_eq!(summary(&source.poll().await.unwrap()), vec![(1, false)]);

        // A rewritten in-progress record with new content is yielded
        append_line(
            &path,
            r#"{"run_number": 1, "start_time": "2024-03-14T09:00:00", "configuration": "physics", "comments": "beam off"}"#,
        );
        let records = source.poll().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].comments.as_deref(), Some("beam off"));
        assert_eq!(source.in_progress(), 1);
    }

    #[tokio::test]
    async fn test_partial_line_waits_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let mut source = JsonLinesRunSource::new(&path);

        let (head, tail) = RUN_1_START.split_at(20);
        append(&path, head);
        assert!(source.poll().await.unwrap().is_empty());

        append(&path, &format!("{tail}\n"));
        assert_eq!(summary(&source.poll().await.unwrap()), vec![(1, false)]);
    }

    #[tokio::test]
    async fn test_truncated_file_is_read_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        append_line(&path, RUN_1_START);
        append_line(&path, RUN_1_END);

        let mut source = JsonLinesRunSource::new(&path);
        assert_eq!(source.poll().await.unwrap().len(), 2);

        std::fs::write(
            &path,
            "{\"run_number\": 2, \"start_time\": \"2024-03-14T11:00:00\", \"configuration\": \"physics\"}\n",
        )
        .unwrap();
        assert_eq!(summary(&source.poll().await.unwrap()), vec![(2, false)]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        append_line(&path, "not json");
        append_line(&path, "");
        append_line(&path, r#"{"run_number": 3, "configuration": "missing start"}"#);
        append_line(&path, r#"{"run_number": 4, "start_time": "2024-03-14T09:00:00", "configuration": "ok"}"#);

        let mut source = JsonLinesRunSource::new(&path);
        let records = source.poll().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].run_number, 4);
        assert!(logs_contain("Skipping malformed run record"));
    }
}
