//! Integration tests for the worker session driving generation jobs

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use stagehand::checkpoint::{CheckpointEngine, SledCheckpointStore};
use stagehand::error::{PipelineError, SessionError};
use stagehand::health::{GeneratorProbe, GeneratorStatus, HealthStatus};
use stagehand::pipeline::{GenerationDispatcher, PipelineDriver, ProgressSink};
use stagehand::retry::{RetryExecutor, RetryPolicy};
use stagehand::session::{
    ChannelPeer, ChannelTransport, ConnectionState, DisconnectReason, OutboundMessage,
    SessionSettings, SharedSessionState, WorkerSession,
};
use stagehand::telemetry::WorkerMetrics;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::integration::test_utils::ScriptedRunner;

struct Harness {
    _dir: TempDir,
    session: Arc<WorkerSession>,
    transport: ChannelTransport,
    accepted: UnboundedReceiver<ChannelPeer>,
    runner: Arc<ScriptedRunner>,
    generator: Arc<GeneratorStatus>,
    task: JoinHandle<Result<(), SessionError>>,
}

fn start(max_failures: u32, runner: ScriptedRunner) -> Harness {
    let dir = TempDir::new().unwrap();
    let (transport, accepted) = ChannelTransport::new();
    let metrics = WorkerMetrics::default();
    let session = Arc::new(WorkerSession::new(
        SessionSettings {
            url: "mem://orchestrator".to_string(),
            worker_id: "worker-it".to_string(),
            max_consecutive_failures: max_failures,
            reconnect_schedule: vec![Duration::from_secs(1), Duration::from_secs(5)],
            heartbeat_interval: Duration::from_secs(30),
            outbound_queue: 64,
        },
        Arc::new(transport.clone()),
        SharedSessionState::new(),
        metrics.clone(),
    ));

    let sink: Arc<dyn ProgressSink> = Arc::new(session.handle());
    let store = SledCheckpointStore::open(dir.path()).unwrap();
    let engine = CheckpointEngine::new(
        Arc::new(store),
        vec!["plan".to_string(), "build".to_string()],
    );
    let runner = Arc::new(runner);
    let driver = PipelineDriver::new(
        engine,
        runner.clone(),
        RetryExecutor::new(RetryPolicy::new(2, vec![Duration::from_secs(60)])),
        metrics,
    )
    .with_sink(sink.clone());
    let generator = Arc::new(GeneratorStatus::new());
    let dispatcher = Arc::new(GenerationDispatcher::new(
        Arc::new(driver),
        generator.clone(),
        sink,
    ));

    let task = {
        let session = session.clone();
        tokio::spawn(async move { session.run(dispatcher).await })
    };
    Harness {
        _dir: dir,
        session,
        transport,
        accepted,
        runner,
        generator,
        task,
    }
}

/// Read frames until one with `kind` arrives, skipping heartbeat acks and logs.
async fn next_of_kind(peer: &mut ChannelPeer, kind: &str) -> Value {
    loop {
        let frame = peer.recv().await.expect("connection closed");
        let value: Value = serde_json::from_str(&frame).unwrap();
        if value["type"] == kind {
            return value;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_command_runs_pipeline_and_reports_completion() {
    let mut h = start(3, ScriptedRunner::with_cost(0.25));
    let mut peer = h.accepted.recv().await.unwrap();
    assert!(h.generator.initialized());

    peer.send_text(
        &json!({
            "type": "command",
            "action": "generate",
            "target_name": "todo",
            "request": "a todo app"
        })
        .to_string(),
    );

    let progress = next_of_kind(&mut peer, "progress").await;
    assert_eq!(progress["stage"], "plan");
    assert_eq!(progress["percent"], 0.0);

    let completed = next_of_kind(&mut peer, "completed").await;
    assert_eq!(completed["total_cost"], 0.5);
    assert_eq!(completed["outputs"]["build.artifact"], "build.out");
    assert_eq!(h.runner.calls(), vec!["plan", "build"]);

    h.session.close();
    h.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_stage_backs_off_and_logs_wait() {
    let runner = ScriptedRunner::with_cost(0.1);
    runner.push("plan", Err(PipelineError::RateLimited("429 Too Many Requests".to_string())));
    let mut h = start(3, runner);
    let mut peer = h.accepted.recv().await.unwrap();

    peer.send_text(r#"{"type":"command","action":"generate","target_name":"todo"}"#);

    let log = next_of_kind(&mut peer, "log").await;
    assert!(log["message"].as_str().unwrap().contains("plan"));
    let completed = next_of_kind(&mut peer, "completed").await;
    assert!((completed["total_cost"].as_f64().unwrap() - 0.2).abs() < 1e-9);
    assert_eq!(h.runner.calls(), vec!["plan", "plan", "build"]);

    h.session.close();
    h.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_lost_connection_reconnects_and_rejects_sends_meanwhile() {
    let mut h = start(3, ScriptedRunner::default());
    let first = h.accepted.recv().await.unwrap();
    h.transport.refuse_next(1);
    first.close(DisconnectReason::Error);

    tokio::time::sleep(Duration::from_millis(1)).await;
    let handle = h.session.handle();
    let state = h.session.state().connection_state();
    assert_ne!(state, ConnectionState::Connected);
    assert!(handle
        .send(OutboundMessage::heartbeat_ack())
        .is_err());

    let mut second = h.accepted.recv().await.unwrap();
    assert_eq!(h.transport.attempts(), 3);
    assert_eq!(h.session.state().connection_state(), ConnectionState::Connected);
    assert_eq!(h.session.state().snapshot().consecutive_failures, 0);

    handle
        .send(OutboundMessage::Log {
            level: stagehand::session::LogLevel::Info,
            message: "back".to_string(),
        })
        .unwrap();
    let log = next_of_kind(&mut second, "log").await;
    assert_eq!(log["message"], "back");

    h.session.close();
    h.task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_reconnection_leaves_transport_unhealthy() {
    let h = start(2, ScriptedRunner::default());
    h.transport.refuse_all(true);
    drop(h.accepted);

    let result = h.task.await.unwrap();
    assert!(matches!(result, Err(SessionError::ReconnectExhausted(2))));
    let snapshot = h.session.state().snapshot();
    assert!(snapshot.gave_up);
    assert_eq!(
        snapshot.transport_health(Duration::from_secs(60)),
        HealthStatus::Unhealthy
    );
}
