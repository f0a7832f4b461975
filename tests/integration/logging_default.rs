//! Integration tests for CLI logging defaults.
//!
//! Short commands stay quiet unless --verbose is given; verbose output can be
//! routed to a file or to stderr without polluting command output on stdout.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn stagehand(test_dir: &TempDir, workspace: &Path, args: &[&str]) -> Output {
    let config_home = test_dir.path().join("config");
    let home = test_dir.path().join("home");
    fs::create_dir_all(&config_home).unwrap();
    fs::create_dir_all(&home).unwrap();

    Command::new(env!("CARGO_BIN_EXE_stagehand"))
        .env("XDG_CONFIG_HOME", config_home.as_os_str())
        .env("HOME", home.as_os_str())
        .env_remove("STAGEHAND_LOG")
        .env_remove("STAGEHAND_LOG_FORMAT")
        .env_remove("STAGEHAND_LOG_OUTPUT")
        .env_remove("STAGEHAND_ENV")
        .arg("--workspace")
        .arg(workspace)
        .args(args)
        .output()
        .unwrap()
}

#[test]
fn test_short_commands_do_not_log_by_default() {
    let temp_dir = TempDir::new().unwrap();
    let workspace = temp_dir.path().join("ws");
    fs::create_dir_all(&workspace).unwrap();

    let output = stagehand(&temp_dir, &workspace, &["config", "--validate"]);
    assert!(
        output.status.success(),
        "stagehand config should succeed: stderr={:?}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), "Configuration is valid");
    assert!(output.stderr.is_empty());
}

#[test]
fn test_verbose_logging_writes_to_file() {
    let temp_dir = TempDir::new().unwrap();
    let workspace = temp_dir.path().join("ws");
    fs::create_dir_all(&workspace).unwrap();
    let log_path = temp_dir.path().join("logs").join("stagehand.log");

    let output = stagehand(
        &temp_dir,
        &workspace,
        &[
            "--verbose",
            "--log-output",
            "file",
            "--log-file",
            log_path.to_str().unwrap(),
            "config",
        ],
    );
    assert!(
        output.status.success(),
        "stagehand --verbose config should succeed: stderr={:?}",
        String::from_utf8_lossy(&output.stderr)
    );

    let content = fs::read_to_string(&log_path).unwrap();
    assert!(
        content.contains("Stagehand CLI starting"),
        "log file should contain a startup message; got: {}",
        content.lines().next().unwrap_or("")
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("Stagehand CLI starting"));
    assert!(stdout.contains("[pipeline]"));
}

#[test]
fn test_verbose_json_logging_to_stderr() {
    let temp_dir = TempDir::new().unwrap();
    let workspace = temp_dir.path().join("ws");
    fs::create_dir_all(&workspace).unwrap();

    let output = stagehand(
        &temp_dir,
        &workspace,
        &["--verbose", "--log-output", "stderr", "--log-format", "json", "config"],
    );
    assert!(output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    let first = stderr.lines().next().expect("verbose mode should emit logs to stderr");
    let record: serde_json::Value = serde_json::from_str(first).unwrap();
    assert_eq!(record["level"], "INFO");
}

#[test]
fn test_failed_command_exits_non_zero_with_message() {
    let temp_dir = TempDir::new().unwrap();
    let workspace = temp_dir.path().join("ws");
    fs::create_dir_all(&workspace).unwrap();

    let output = stagehand(&temp_dir, &workspace, &["runs"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no checkpoint store"), "stderr={}", stderr);
}
