//! Integration tests for following runs while a worker holds the checkpoint store

use std::sync::Arc;
use std::time::Duration;

use stagehand::checkpoint::{CheckpointEngine, CheckpointStore, SledCheckpointStore, StageUpdate};
use stagehand::error::StorageError;
use stagehand::health::{GeneratorStatus, HealthMonitor};
use stagehand::http::{self, HttpState};
use stagehand::monitor::{ProgressMonitor, WorkerRunSource, WorkspaceRunSource};
use stagehand::session::SharedSessionState;
use stagehand::telemetry::WorkerMetrics;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

fn stages() -> Vec<String> {
    vec!["A".to_string(), "B".to_string(), "C".to_string()]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_monitor_follows_run_written_by_live_worker() {
    let dir = TempDir::new().unwrap();
    let checkpoint_dir = dir.path().join("checkpoints");
    let store: Arc<dyn CheckpointStore> =
        Arc::new(SledCheckpointStore::open(&checkpoint_dir).unwrap());
    let engine = CheckpointEngine::new(store.clone(), stages());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = HttpState {
        health: Arc::new(HealthMonitor::new(
            SharedSessionState::new(),
            Arc::new(GeneratorStatus::new()),
            Duration::from_secs(60),
        )),
        metrics: WorkerMetrics::default(),
        checkpoints: store.clone(),
    };
    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(http::serve_on(listener, state, async {
        let _ = stopped.await;
    }));

    let mut run = engine.create("todo", "a todo app").unwrap();
    engine
        .update_stage(&mut run, "A", StageUpdate::completed().with_cost_delta(0.25))
        .unwrap();
    engine
        .update_stage(&mut run, "B", StageUpdate::in_progress())
        .unwrap();
    assert!(matches!(
        SledCheckpointStore::open(&checkpoint_dir),
        Err(StorageError::Locked(_))
    ));

    let source = WorkspaceRunSource::new(
        &checkpoint_dir,
        WorkerRunSource::new(format!("http://{}", addr)).unwrap(),
    );
    let monitor = ProgressMonitor::new(Arc::new(source), Duration::from_millis(50));
    assert_eq!(monitor.all_runs().await.unwrap().len(), 1);

    let run_id = run.run_id.clone();
    let mut snapshots = Vec::new();
    let last = monitor
        .watch_run(&run_id, |snapshot| {
            snapshots.push(snapshot.clone());
            if snapshots.len() == 1 {
                for stage in ["B", "C"] {
                    engine
                        .update_stage(&mut run, stage, StageUpdate::completed().with_cost_delta(0.5))
                        .unwrap();
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].current_stage.as_deref(), Some("B"));
    assert!(snapshots[0].current_elapsed_secs.is_some());
    assert_eq!(snapshots[0].completed_stages, 1);
    assert!(!last.resumable);
    assert!((last.total_cost - 1.25).abs() < 1e-9);

    stop.send(()).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_idle_store_is_read_directly_and_released() {
    let dir = TempDir::new().unwrap();
    let checkpoint_dir = dir.path().join("checkpoints");
    {
        let store = SledCheckpointStore::open(&checkpoint_dir).unwrap();
        let engine = CheckpointEngine::new(Arc::new(store), stages());
        engine.create("todo", "req").unwrap();
    }

    let source = WorkspaceRunSource::new(
        &checkpoint_dir,
        WorkerRunSource::new("http://127.0.0.1:9").unwrap(),
    );
    let monitor = ProgressMonitor::new(Arc::new(source), Duration::from_millis(50));
    let runs = monitor.poll_once().await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].target_name, "todo");

    // A worker starting after the poll still gets the store.
    let worker_store =
        SledCheckpointStore::open_waiting(&checkpoint_dir, Duration::from_secs(5)).unwrap();
    assert_eq!(worker_store.list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_held_store_with_no_worker_reports_unreachable() {
    let dir = TempDir::new().unwrap();
    let checkpoint_dir = dir.path().join("checkpoints");
    let _held = SledCheckpointStore::open(&checkpoint_dir).unwrap();

    let source = WorkspaceRunSource::new(
        &checkpoint_dir,
        WorkerRunSource::new("http://127.0.0.1:9").unwrap(),
    );
    let monitor = ProgressMonitor::new(Arc::new(source), Duration::from_millis(50));
    let err = monitor.snapshot("run-1").await.unwrap_err();
    assert!(matches!(err, StorageError::Remote(_)), "unexpected {err}");
}
