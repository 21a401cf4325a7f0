//! Integration tests: configuration file -> daemon -> loggers, with graceful shutdown.

#![cfg(unix)]

use daq_run_logger::config::DaemonConfig;
use daq_run_logger::source::JsonLinesRunSource;
use daq_run_logger::{LoggerDaemon, LoggerError};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// Config with a stdout logger and a shell logger that `touch`es the path carried in
/// each record's metadata, so the test can observe which runs were logged.
fn write_config(dir: &Path, extra: &str) -> std::path::PathBuf {
    let config = format!(
        r#"
        [application]
        name = "Integration Test"
        log_level = "debug"

        [daemon]
        poll_interval = "20ms"
        shutdown_timeout = "5s"
        queue_capacity = 4

        [source]
        path = "{source}"

        [[loggers]]
        id = "console"
        type = "stdout"

        [[loggers]]
        id = "marker"
        type = "shell"
        [loggers.config]
        command = "touch"
        forward_attrs = ["metadata"]

        {extra}
        "#,
        source = dir.join("runs.jsonl").display(),
    );
    let path = dir.join("daemon.toml");
    std::fs::write(&path, config).unwrap();
    path
}

fn append_run(path: &Path, run_number: u64, marker: &Path, ended: bool) {
    let end = if ended {
        r#", "end_time": "2024-03-14T10:00:00""#
    } else {
        ""
    };
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    writeln!(
        file,
        r#"{{"run_number": {run_number}, "start_time": "2024-03-14T09:00:00", "configuration": "physics", "metadata": "{}"{end}}}"#,
        marker.display()
    )
    .unwrap();
}

#[tokio::test]
async fn test_daemon_forwards_runs_from_source_and_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(dir.path(), "");
    let config = DaemonConfig::load_from(&config_path).unwrap();
    config.validate().unwrap();

    let mut daemon = LoggerDaemon::with_builtin_loggers(config.daemon.queue_capacity);
    daemon.load_from_config(&config.loggers).unwrap();
    assert_eq!(daemon.list_loggers(), vec!["console", "marker"]);

    let runs = config.source.path.clone();
    let marker_1 = dir.path().join("run-1");
    let marker_2 = dir.path().join("run-2");
    append_run(&runs, 1, &marker_1, false);
    append_run(&runs, 2, &marker_2, true);

    let mut source = JsonLinesRunSource::new(&runs);
    daemon
        .run(
            &mut source,
            config.daemon.poll_interval,
            tokio::time::sleep(Duration::from_millis(300)),
        )
        .await;

    let started = std::time::Instant::now();
    daemon
        .shutdown_all(config.daemon.shutdown_timeout)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(6));

    assert!(marker_1.exists());
    assert!(marker_2.exists());

    for stats in daemon.stats() {
        assert_eq!(stats.counts.processed, 2, "logger {}", stats.id);
        assert_eq!(stats.counts.failed, 0, "logger {}", stats.id);
        assert!(!stats.running);
    }
}

#[tokio::test]
async fn test_failing_logger_does_not_block_others() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(
        dir.path(),
        r#"
        [[loggers]]
        id = "always-fails"
        type = "shell"
        [loggers.config]
        command = "false"
        "#,
    );
    let config = DaemonConfig::load_from(&config_path).unwrap();

    let mut daemon = LoggerDaemon::with_builtin_loggers(config.daemon.queue_capacity);
    daemon.load_from_config(&config.loggers).unwrap();

    let marker = dir.path().join("run-7");
    let info: daq_run_logger::RunInfo = serde_json::from_str(&format!(
        r#"{{"run_number": 7, "start_time": "2024-03-14T09:00:00", "configuration": "physics", "metadata": "{}"}}"#,
        marker.display()
    ))
    .unwrap();

    assert_eq!(daemon.dispatch(&info).await, 3);
    daemon.shutdown_all(Duration::from_secs(5)).await.unwrap();

    assert!(marker.exists());
    let failed: Vec<_> = daemon
        .stats()
        .into_iter()
        .filter(|s| s.counts.failed > 0)
        .map(|s| s.id)
        .collect();
    assert_eq!(failed, vec!["always-fails"]);
}

#[tokio::test]
async fn test_unknown_logger_type_aborts_startup() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(
        dir.path(),
        r#"
        [[loggers]]
        id = "fax"
        type = "fax_machine"
        "#,
    );
    let config = DaemonConfig::load_from(&config_path).unwrap();

    let mut daemon = LoggerDaemon::with_builtin_loggers(config.daemon.queue_capacity);
    let err = daemon.load_from_config(&config.loggers).unwrap_err();
    assert!(matches!(err, LoggerError::Logger { ref logger, .. } if logger == "fax"));

    // Loggers spawned before the failure still shut down cleanly
    daemon.shutdown_all(Duration::from_secs(1)).await.unwrap();
}

#[test]
fn test_sample_config_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/daemon.toml");
    let config = DaemonConfig::load_from(path).unwrap();
    config.validate().unwrap();
    let enabled: Vec<_> = config.enabled_loggers().iter().map(|l| l.id.clone()).collect();
    assert_eq!(enabled, vec!["console"]);
}
