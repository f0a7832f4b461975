//! Worker composition root.
//!
//! Wires the checkpoint store, retry executor, pipeline driver, session, and
//! health surface together and runs them until a shutdown signal arrives.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::checkpoint::{CheckpointEngine, CheckpointStore, SledCheckpointStore};
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::health::{GeneratorStatus, HealthMonitor};
use crate::http::{self, HttpState};
use crate::pipeline::{GenerationDispatcher, PipelineDriver, ProgressSink, StageRunner};
use crate::retry::RetryExecutor;
use crate::session::{SessionSettings, SharedSessionState, Transport, WorkerSession};
use crate::telemetry::WorkerMetrics;

/// How long startup waits for a monitor to release the checkpoint store.
const STORE_LOCK_WAIT: Duration = Duration::from_secs(5);

pub struct Worker {
    config: WorkerConfig,
    checkpoints: Arc<dyn CheckpointStore>,
    session: Arc<WorkerSession>,
    dispatcher: Arc<GenerationDispatcher>,
    health: Arc<HealthMonitor>,
    metrics: WorkerMetrics,
    generator: Arc<GeneratorStatus>,
}

impl Worker {
    /// Validate `config` and assemble every component. Nothing runs yet.
    pub fn build(
        config: WorkerConfig,
        workspace_root: &Path,
        runner: Arc<dyn StageRunner>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, WorkerError> {
        if let Err(errors) = config.validate() {
            let joined = errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(WorkerError::ConfigError(joined));
        }

        let checkpoint_dir = config.checkpoint_dir(workspace_root);
        let checkpoints: Arc<dyn CheckpointStore> =
            Arc::new(SledCheckpointStore::open_waiting(&checkpoint_dir, STORE_LOCK_WAIT)?);
        info!(path = %checkpoint_dir.display(), "Checkpoint store opened");
        let engine = CheckpointEngine::new(checkpoints.clone(), config.pipeline.stages.clone());

        let metrics = WorkerMetrics::default();
        let state = SharedSessionState::new();
        let session = Arc::new(WorkerSession::new(
            SessionSettings::from(&config.session),
            transport,
            state.clone(),
            metrics.clone(),
        ));
        let sink: Arc<dyn ProgressSink> = Arc::new(session.handle());

        let driver = PipelineDriver::new(
            engine,
            runner,
            RetryExecutor::new(config.retry_policy()),
            metrics.clone(),
        )
        .with_sink(sink.clone());
        let generator = Arc::new(GeneratorStatus::new());
        let dispatcher = Arc::new(GenerationDispatcher::new(
            Arc::new(driver),
            generator.clone(),
            sink,
        ));
        let health = Arc::new(HealthMonitor::new(
            state,
            generator.clone(),
            config.session.heartbeat_stale(),
        ));

        Ok(Self {
            config,
            checkpoints,
            session,
            dispatcher,
            health,
            metrics,
            generator,
        })
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    pub fn session(&self) -> &Arc<WorkerSession> {
        &self.session
    }

    pub fn generator(&self) -> &Arc<GeneratorStatus> {
        &self.generator
    }

    /// Run until `shutdown` resolves.
    ///
    /// An abandoned session does not stop the worker: the health endpoint keeps
    /// answering (unhealthy) so the supervisor can see why, until shutdown.
    pub async fn run(&self, shutdown: impl Future<Output = ()> + Send) -> Result<(), WorkerError> {
        let listen = self
            .config
            .http
            .socket_addr()
            .map_err(WorkerError::ConfigError)?;

        self.metrics.start();
        self.health.start();

        let (http_stop, mut http_stopped) = watch::channel(false);
        let http_state = HttpState {
            health: self.health.clone(),
            metrics: self.metrics.clone(),
            checkpoints: self.checkpoints.clone(),
        };
        let mut http_task = tokio::spawn(http::serve(listen, http_state, async move {
            let _ = http_stopped.wait_for(|stop| *stop).await;
        }));

        let session = self.session.clone();
        let handler = self.dispatcher.clone();
        let mut session_task = tokio::spawn(async move { session.run(handler).await });

        tokio::pin!(shutdown);
        let mut session_done = false;
        let mut http_result = None;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                joined = &mut session_task, if !session_done => {
                    session_done = true;
                    match joined {
                        Ok(Ok(())) => info!("Session ended"),
                        Ok(Err(e)) => error!(error = %e, "Session terminated, waiting for shutdown"),
                        Err(e) => error!(error = %e, "Session task panicked"),
                    }
                }
                joined = &mut http_task => {
                    http_result = Some(joined);
                    break;
                }
            }
        }

        self.session.close();
        if !session_done {
            if let Err(e) = session_task.await {
                warn!(error = %e, "Session task did not stop cleanly");
            }
        }
        self.health.stop();
        self.metrics.stop();
        http_stop.send_replace(true);

        let joined = match http_result {
            Some(joined) => joined,
            None => http_task.await,
        };
        match joined {
            Ok(result) => result,
            Err(e) => Err(WorkerError::HttpError(e.to_string())),
        }
    }
}
