//! Integration tests for crash recovery and resume through the sled store

use std::sync::Arc;
use std::time::Duration;

use stagehand::checkpoint::{
    CheckpointEngine, CheckpointStore, SledCheckpointStore, StageStatus, StageUpdate,
};
use stagehand::error::PipelineError;
use stagehand::pipeline::{CancelToken, PipelineDriver};
use stagehand::retry::{RetryExecutor, RetryPolicy};
use stagehand::telemetry::WorkerMetrics;
use tempfile::TempDir;

use crate::integration::test_utils::ScriptedRunner;

fn stages() -> Vec<String> {
    vec!["A".to_string(), "B".to_string(), "C".to_string()]
}

fn engine_at(dir: &TempDir) -> CheckpointEngine {
    let store = SledCheckpointStore::open(dir.path().join("checkpoints")).unwrap();
    CheckpointEngine::new(Arc::new(store), stages())
}

#[test]
fn test_crash_leaves_in_progress_stage_and_exact_cost() {
    let dir = TempDir::new().unwrap();
    let run_id = {
        let engine = engine_at(&dir);
        let mut run = engine.create("r1", "build a todo app").unwrap();
        engine
            .update_stage(&mut run, "A", StageUpdate::in_progress())
            .unwrap();
        engine
            .update_stage(&mut run, "A", StageUpdate::completed().with_cost_delta(0.25))
            .unwrap();
        engine
            .update_stage(&mut run, "B", StageUpdate::in_progress())
            .unwrap();
        // Engine and store are dropped without any shutdown step.
        run.run_id.clone()
    };

    let engine = engine_at(&dir);
    let recovered = engine.find_latest("r1").unwrap().unwrap();
    assert_eq!(recovered.run_id, run_id);
    assert_eq!(recovered.stage("A").unwrap().status, StageStatus::Completed);
    assert_eq!(recovered.stage("B").unwrap().status, StageStatus::InProgress);
    assert_eq!(recovered.stage("C").unwrap().status, StageStatus::NotStarted);
    assert_eq!(recovered.total_cost(), 0.25);
    assert!(recovered.can_resume());
    assert_eq!(engine.get_next_stage(&recovered), Some("B"));
}

#[test]
fn test_update_stage_is_idempotent_apart_from_timestamp() {
    let dir = TempDir::new().unwrap();
    let engine = engine_at(&dir);
    let mut run = engine.create("r1", "req").unwrap();
    let update = StageUpdate::completed().with_cost(0.5);

    engine.update_stage(&mut run, "A", update.clone()).unwrap();
    let mut first = engine.load(&run.run_id).unwrap();
    engine.update_stage(&mut run, "A", update).unwrap();
    let second = engine.load(&run.run_id).unwrap();

    assert!(second.updated_at >= first.updated_at);
    first.updated_at = second.updated_at;
    assert_eq!(first, second);
    assert_eq!(second.total_cost(), 0.5);
}

#[test]
fn test_unknown_stage_is_rejected_without_writing() {
    let dir = TempDir::new().unwrap();
    let engine = engine_at(&dir);
    let mut run = engine.create("r1", "req").unwrap();
    let before = engine.load(&run.run_id).unwrap();

    let err = engine
        .update_stage(&mut run, "Z", StageUpdate::completed().with_cost_delta(9.0))
        .unwrap_err();
    assert!(matches!(err, PipelineError::UnknownStage { .. }));
    assert_eq!(engine.load(&run.run_id).unwrap(), before);
    assert_eq!(run.total_cost(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_restarted_worker_resumes_interrupted_stage() {
    let dir = TempDir::new().unwrap();
    {
        let engine = engine_at(&dir);
        let mut run = engine.create("r1", "req").unwrap();
        engine
            .update_stage(&mut run, "A", StageUpdate::completed().with_cost_delta(0.25))
            .unwrap();
        engine
            .update_stage(&mut run, "B", StageUpdate::in_progress())
            .unwrap();
    }

    let runner = Arc::new(ScriptedRunner::with_cost(0.5));
    let driver = PipelineDriver::new(
        engine_at(&dir),
        runner.clone(),
        RetryExecutor::new(RetryPolicy::new(1, vec![Duration::from_secs(1)])),
        WorkerMetrics::default(),
    );
    let finished = driver
        .run_or_resume("r1", "ignored on resume", &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(runner.calls(), vec!["B", "C"]);
    assert_eq!(finished.original_request, "req");
    assert!(!finished.can_resume());
    assert!((finished.total_cost() - 1.25).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_failed_stage_waits_for_explicit_resume() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::with_cost(0.1));
    runner.push("B", Err(PipelineError::AuthFailed("bad key".to_string())));
    let engine = engine_at(&dir);
    let store = engine.store().clone();
    let driver = PipelineDriver::new(
        engine,
        runner.clone(),
        RetryExecutor::new(RetryPolicy::new(3, vec![Duration::from_secs(1)])),
        WorkerMetrics::default(),
    );

    let err = driver
        .run_or_resume("r1", "req", &CancelToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::AuthFailed(_)));
    // Fatal errors are not retried.
    assert_eq!(runner.calls(), vec!["A", "B"]);

    let persisted = store.list().unwrap().remove(0);
    let failed = persisted.stage("B").unwrap();
    assert_eq!(failed.status, StageStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("bad key"));
    assert_eq!(persisted.stage("A").unwrap().status, StageStatus::Completed);

    let resumed = driver
        .resume(&persisted.run_id, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(runner.calls(), vec!["A", "B", "B", "C"]);
    assert_eq!(resumed.stage("A").unwrap().cost, 0.1);
    assert!((resumed.total_cost() - 0.3).abs() < 1e-9);
}
