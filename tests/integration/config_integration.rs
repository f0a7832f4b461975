//! Integration tests for Configuration System

use std::fs;

use stagehand::config::{global_config_path, ConfigLoader, ValidationError, WorkerConfig};
use tempfile::TempDir;

use crate::integration::test_utils::with_isolated_env;

fn write_workspace_file(workspace: &std::path::Path, name: &str, body: &str) {
    let dir = workspace.join("config");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(name), body).unwrap();
}

#[test]
fn test_sources_merge_in_precedence_order() {
    let test_dir = TempDir::new().unwrap();
    let workspace = test_dir.path().join("ws");
    fs::create_dir_all(&workspace).unwrap();

    let config = with_isolated_env(&test_dir, &[("STAGEHAND__RETRY__MAX_RETRIES", "7")], || {
        let global = global_config_path().unwrap();
        fs::create_dir_all(global.parent().unwrap()).unwrap();
        fs::write(
            &global,
            r#"
[session]
url = "wss://global.example/ws"
worker_id = "global-worker"

[retry]
max_retries = 2
"#,
        )
        .unwrap();
        write_workspace_file(
            &workspace,
            "config.toml",
            r#"
[session]
worker_id = "workspace-worker"

[pipeline]
stages = ["draft", "review", "publish"]
"#,
        );
        write_workspace_file(
            &workspace,
            "development.toml",
            "[http]\nlisten = \"127.0.0.1:9100\"\n",
        );

        ConfigLoader::load(&workspace).unwrap()
    });

    assert_eq!(config.session.url, "wss://global.example/ws");
    assert_eq!(config.session.worker_id, "workspace-worker");
    assert_eq!(config.pipeline.stages, vec!["draft", "review", "publish"]);
    assert_eq!(config.http.listen, "127.0.0.1:9100");
    assert_eq!(config.retry.max_retries, 7);
    assert_eq!(config.retry.delay_schedule_secs, vec![60, 120, 240, 480, 960]);
    assert_eq!(config.workspace_root.as_deref(), Some(workspace.as_path()));
    assert!(config.validate().is_ok());
}

#[test]
fn test_environment_selects_workspace_overlay() {
    let test_dir = TempDir::new().unwrap();
    let workspace = test_dir.path().join("ws");
    write_workspace_file(&workspace, "production.toml", "[monitor]\npoll_interval_secs = 30\n");
    write_workspace_file(&workspace, "development.toml", "[monitor]\npoll_interval_secs = 1\n");

    let config = with_isolated_env(&test_dir, &[("STAGEHAND_ENV", "production")], || {
        ConfigLoader::load(&workspace).unwrap()
    });
    assert_eq!(config.monitor.poll_interval_secs, 30);
}

#[test]
fn test_list_overrides_from_environment() {
    let test_dir = TempDir::new().unwrap();
    let workspace = test_dir.path().join("ws");
    fs::create_dir_all(&workspace).unwrap();

    let config = with_isolated_env(
        &test_dir,
        &[("STAGEHAND__PIPELINE__STAGES", "fetch,transform,load")],
        || ConfigLoader::load(&workspace).unwrap(),
    );
    assert_eq!(config.pipeline.stages, vec!["fetch", "transform", "load"]);
}

#[test]
fn test_invalid_file_values_are_all_reported() {
    let test_dir = TempDir::new().unwrap();
    let path = test_dir.path().join("worker.toml");
    fs::write(
        &path,
        r#"
[session]
url = "http://not-a-websocket"
max_consecutive_failures = 0

[monitor]
poll_interval_secs = 0
"#,
    )
    .unwrap();

    let config: WorkerConfig =
        with_isolated_env(&test_dir, &[], || ConfigLoader::load_from_file(&path).unwrap());
    let errors = config.validate().unwrap_err();
    assert_eq!(errors.len(), 3);
    assert!(errors.iter().any(|e| matches!(e, ValidationError::Monitor(_))));
    assert_eq!(
        errors
            .iter()
            .filter(|e| matches!(e, ValidationError::Session(_)))
            .count(),
        2
    );
}

#[test]
fn test_malformed_file_is_a_config_error() {
    let test_dir = TempDir::new().unwrap();
    let path = test_dir.path().join("broken.toml");
    fs::write(&path, "[retry]\nmax_retries = \"many\"\n").unwrap();

    let err = with_isolated_env(&test_dir, &[], || ConfigLoader::load_from_file(&path)).unwrap_err();
    assert!(err.to_string().contains("Configuration error"));
}
