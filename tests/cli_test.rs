// End-to-end tests of the scriptserve binary: invoke spawns a worker on
// demand, later invocations reuse it, and stop shuts it down.
// Run with: cargo test --test cli_test

mod common;

use std::path::Path;
use std::process::{Command, Output};
use std::time::{Duration, Instant};

use common::binary_path;
use tempfile::TempDir;

fn scriptserve(config_dir: &Path, args: &[&str]) -> Output {
    Command::new(binary_path())
        .args(args)
        .env("SCRIPTSERVE_CONFIG_DIR", config_dir)
        .env_remove("SCRIPTSERVE_PIPE_NAME")
        .output()
        .expect("Failed to run scriptserve")
}

fn wait_until_gone(path: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !path.exists() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

/// Cold invoke spawns the worker, warm invoke reuses it, stop ends it.
#[test]
fn test_invoke_spawns_and_reuses_worker() {
    let temp_dir = TempDir::new().unwrap();
    let socket = temp_dir.path().join("cli.sock");
    let socket_arg = socket.to_str().unwrap();
    let config_dir = temp_dir.path().join("config");
    let exe_dir = binary_path().parent().unwrap().to_path_buf();
    let exe_dir_arg = exe_dir.to_str().unwrap();

    let output = scriptserve(
        &config_dir,
        &["invoke", "emit(1) emit({x = 'y'}) return 'done'", "--socket", socket_arg, "--exe-dir", exe_dir_arg],
    );
    assert!(
        output.status.success(),
        "invoke failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().collect::<Vec<_>>(), vec!["1", r#"{"x":"y"}"#, r#""done""#]);
    assert!(socket.exists(), "worker should still be listening");

    let output = scriptserve(&config_dir, &["status", "--socket", socket_arg]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("running"));

    // Script errors go to stderr; the run itself still succeeds.
    let output = scriptserve(&config_dir, &["invoke", "error('nope')", "--socket", socket_arg]);
    assert!(output.status.success());
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("nope"));

    let output = scriptserve(&config_dir, &["stop", "--socket", socket_arg]);
    assert!(
        output.status.success(),
        "stop failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(wait_until_gone(&socket, Duration::from_secs(5)), "socket not removed");

    let output = scriptserve(&config_dir, &["status", "--socket", socket_arg]);
    assert!(!output.status.success());
}

/// A missing worker binary is a connect failure with a non-zero exit.
#[test]
fn test_invoke_with_missing_worker_binary_fails() {
    let temp_dir = TempDir::new().unwrap();
    let socket = temp_dir.path().join("none.sock");
    let empty_dir = temp_dir.path().join("bin");
    std::fs::create_dir_all(&empty_dir).unwrap();

    let output = scriptserve(
        &temp_dir.path().join("config"),
        &[
            "invoke",
            "return 1",
            "--socket",
            socket.to_str().unwrap(),
            "--exe-dir",
            empty_dir.to_str().unwrap(),
        ],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to spawn"));
}

/// The config command prints the effective configuration as JSON.
#[test]
fn test_config_command_prints_json() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(temp_dir.path().join("config.json"), r#"{"default_depth": 7}"#).unwrap();

    let output = scriptserve(temp_dir.path(), &["config"]);
    assert!(output.status.success());
    let config: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(config["default_depth"], 7);
}
