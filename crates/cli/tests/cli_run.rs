#![cfg(unix)]

use std::path::Path;
use std::process::Output;

use serde_json::Value;
use tempfile::TempDir;

/// Writes `sluice.toml` into `dir` with the given body
fn write_config(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("sluice.toml");
    std::fs::write(&path, body).unwrap();
    path
}

/// Creates a source directory with the named files
fn source_dir(dir: &Path, files: &[(&str, usize)]) -> std::path::PathBuf {
    let root = dir.join("input");
    std::fs::create_dir_all(&root).unwrap();
    for (name, bytes) in files {
        std::fs::write(root.join(name), vec![b'a'; *bytes]).unwrap();
    }
    root
}

async fn run_sluice(config_path: &Path) -> Output {
    tokio::process::Command::new(env!("CARGO_BIN_EXE_sluice"))
        .env("SLUICE_CONFIG", config_path)
        .env("RUST_LOG", "error") // Quiet logs during tests
        .kill_on_drop(true)
        .output()
        .await
        .expect("Failed to run sluice")
}

fn snapshot(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout should be the final snapshot")
}

#[tokio::test]
async fn test_processes_matching_files() {
    let dir = TempDir::new().unwrap();
    let root = source_dir(
        dir.path(),
        &[("a.txt", 3), ("b.txt", 4), ("c.TXT", 5), ("cover.jpg", 6)],
    );
    let config = write_config(
        dir.path(),
        &format!(
            r#"
[engine]
max_concurrency = 2

[source]
root = '{}'
extensions = ["txt"]

[processor]
program = "cat"
"#,
            root.display()
        ),
    );

    let output = run_sluice(&config).await;
    assert_eq!(output.status.code(), Some(0));

    let snapshot = snapshot(&output);
    assert_eq!(snapshot["total"], 3);
    assert_eq!(snapshot["completed"], 3);
    assert_eq!(snapshot["failed"], 0);
    assert_eq!(snapshot["pending"], 0);
    assert_eq!(snapshot["success_rate"], 100.0);
}

#[tokio::test]
async fn test_sqlite_cache_skips_second_run() {
    let dir = TempDir::new().unwrap();
    let root = source_dir(dir.path(), &[("a.wav", 1), ("b.wav", 1), ("c.wav", 1)]);
    let log = dir.path().join("invocations.log");
    let config = write_config(
        dir.path(),
        &format!(
            r#"
[engine]
backend = "process_pool"
max_concurrency = 3

[cache]
backend = "sqlite"
path = '{}'

[source]
root = '{}'

[processor]
program = "sh"
args = ["-c", 'echo run >> {}; cat "$1"', "sh", "{{input}}"]
"#,
            dir.path().join("cache.db").display(),
            root.display(),
            log.display()
        ),
    );

    for _ in 0..2 {
        let output = run_sluice(&config).await;
        assert_eq!(output.status.code(), Some(0));
        assert_eq!(snapshot(&output)["completed"], 3);
    }

    let invocations = std::fs::read_to_string(&log).unwrap();
    assert_eq!(invocations.lines().count(), 3);
}

#[tokio::test]
async fn test_fail_on_error_exit_code() {
    let dir = TempDir::new().unwrap();
    let root = source_dir(dir.path(), &[("good.txt", 1), ("bad.txt", 1)]);
    let config = write_config(
        dir.path(),
        &format!(
            r#"
[engine]
backend = "thread_pool"

[source]
root = '{}'

[processor]
program = "sh"
args = ["-c", 'case "$1" in *bad*) exit 3;; esac', "sh", "{{input}}"]

[output]
fail_on_error = true
"#,
            root.display()
        ),
    );

    let output = run_sluice(&config).await;
    assert_eq!(output.status.code(), Some(2));

    let snapshot = snapshot(&output);
    assert_eq!(snapshot["completed"], 1);
    assert_eq!(snapshot["failed"], 1);
    let sample = snapshot["error_samples"][0].as_str().unwrap();
    assert!(sample.contains("bad.txt"));
}

#[tokio::test]
async fn test_oversized_files_skipped_and_metrics_written() {
    let dir = TempDir::new().unwrap();
    let root = source_dir(dir.path(), &[("small.bin", 8), ("large.bin", 4096)]);
    let metrics = dir.path().join("metrics.prom");
    let config = write_config(
        dir.path(),
        &format!(
            r#"
[engine]
max_job_size_bytes = 1024
per_job_timeout_secs = 10

[source]
root = '{}'

[processor]
program = "true"

[output]
metrics_path = '{}'
"#,
            root.display(),
            metrics.display()
        ),
    );

    let output = run_sluice(&config).await;
    assert_eq!(output.status.code(), Some(0));

    let snapshot = snapshot(&output);
    assert_eq!(snapshot["completed"], 1);
    assert_eq!(snapshot["skipped"], 1);

    let exposition = std::fs::read_to_string(&metrics).unwrap();
    assert!(exposition.contains("sluice_jobs_total"));
}

#[tokio::test]
async fn test_missing_config_is_fatal() {
    let dir = TempDir::new().unwrap();
    let output = run_sluice(&dir.path().join("absent.toml")).await;
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
}

#[tokio::test]
async fn test_invalid_concurrency_is_fatal() {
    let dir = TempDir::new().unwrap();
    let root = source_dir(dir.path(), &[("a.txt", 1)]);
    let config = write_config(
        dir.path(),
        &format!(
            r#"
[engine]
max_concurrency = 0

[source]
root = '{}'

[processor]
program = "cat"
"#,
            root.display()
        ),
    );

    let output = run_sluice(&config).await;
    assert_eq!(output.status.code(), Some(1));
}
