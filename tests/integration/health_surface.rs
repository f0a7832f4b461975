//! Integration tests for the health, readiness, and metrics surface of a
//! fully assembled worker

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use stagehand::config::WorkerConfig;
use stagehand::http::{build_router, HttpState};
use stagehand::session::{ChannelTransport, ConnectionState};
use stagehand::worker::Worker;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tower::util::ServiceExt;

use crate::integration::test_utils::ScriptedRunner;

fn config(max_failures: u32) -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.http.listen = "127.0.0.1:0".to_string();
    config.session.url = "ws://orchestrator.invalid/ws".to_string();
    config.session.max_consecutive_failures = max_failures;
    config.session.reconnect_schedule_secs = vec![1];
    config
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_text(resp: Response) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..600 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_session_keeps_serving_unhealthy() {
    let dir = TempDir::new().unwrap();
    let (transport, _accepted) = ChannelTransport::new();
    transport.refuse_all(true);
    let worker = Arc::new(
        Worker::build(
            config(2),
            dir.path(),
            Arc::new(ScriptedRunner::default()),
            Arc::new(transport.clone()),
        )
        .unwrap(),
    );

    let (stop, stopped) = oneshot::channel::<()>();
    let running = {
        let worker = worker.clone();
        tokio::spawn(async move {
            worker
                .run(async {
                    let _ = stopped.await;
                })
                .await
        })
    };

    wait_until(|| worker.session().state().snapshot().gave_up).await;
    assert_eq!(transport.attempts(), 2);
    assert!(worker.health().is_running());

    let router = build_router(HttpState {
        health: worker.health().clone(),
        metrics: worker.metrics().clone(),
        checkpoints: worker.checkpoints().clone(),
    });

    let resp = router.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let health: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
    assert_eq!(health["status"], "unhealthy");
    assert_eq!(health["checks"]["transport"], "unhealthy");
    assert_eq!(health["checks"]["generator"], "healthy");

    let resp = router.clone().oneshot(get("/ready")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let ready: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
    assert_eq!(ready["websocket_connected"], false);
    assert_eq!(ready["generator_initialized"], true);

    let resp = router.oneshot(get("/metrics")).await.unwrap();
    let text = body_text(resp).await;
    assert!(text.contains(r#"stagehand_ws_reconnect_attempts_total{outcome="abandoned"} 1"#));
    assert!(text.contains(r#"stagehand_ws_reconnect_attempts_total{outcome="failure"} 2"#));

    stop.send(()).unwrap();
    running.await.unwrap().unwrap();
    assert!(!worker.health().is_running());
}

#[tokio::test(start_paused = true)]
async fn test_connected_worker_is_healthy_and_ready() {
    let dir = TempDir::new().unwrap();
    let (transport, mut accepted) = ChannelTransport::new();
    let worker = Arc::new(
        Worker::build(
            config(3),
            dir.path(),
            Arc::new(ScriptedRunner::default()),
            Arc::new(transport),
        )
        .unwrap(),
    );

    let (stop, stopped) = oneshot::channel::<()>();
    let running = {
        let worker = worker.clone();
        tokio::spawn(async move {
            worker
                .run(async {
                    let _ = stopped.await;
                })
                .await
        })
    };

    let peer = accepted.recv().await.unwrap();
    peer.ping();
    wait_until(|| worker.session().state().connection_state() == ConnectionState::Connected).await;

    let router = build_router(HttpState {
        health: worker.health().clone(),
        metrics: worker.metrics().clone(),
        checkpoints: worker.checkpoints().clone(),
    });
    let resp = router.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = router.oneshot(get("/ready")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    stop.send(()).unwrap();
    running.await.unwrap().unwrap();
    assert_eq!(
        worker.session().state().snapshot().last_disconnect,
        Some(stagehand::session::DisconnectReason::Normal)
    );
}
