//! Pipeline driver: runs the stages of a generation run in order.
//!
//! Each stage is executed through the retry executor and checkpointed before
//! and after it runs, so a crash at any point leaves a run that resumes at the
//! first stage that is not `Completed`. Stage content belongs to the external
//! generation engine behind [`StageRunner`].

pub mod command;
pub mod dispatch;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::checkpoint::{CheckpointEngine, GenerationRun, StageStatus, StageUpdate};
use crate::error::PipelineError;
use crate::retry::{RetryExecutor, WaitTick};
use crate::session::protocol::{LogLevel, OutboundMessage};
use crate::telemetry::{GenerationOutcome, WorkerMetrics};

pub use command::CommandRunner;
pub use dispatch::GenerationDispatcher;

/// Input handed to the generation engine for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageContext {
    pub run_id: String,
    pub target_name: String,
    pub stage: String,
    pub request: String,
    /// Outputs of every completed stage declared before this one.
    pub prior_outputs: BTreeMap<String, BTreeMap<String, String>>,
}

impl StageContext {
    fn for_stage(run: &GenerationRun, stage: &str) -> Self {
        let prior_outputs = run
            .stages()
            .iter()
            .take_while(|s| s.name != stage)
            .filter(|s| s.status == StageStatus::Completed)
            .map(|s| (s.name.clone(), s.outputs.clone()))
            .collect();
        Self {
            run_id: run.run_id.clone(),
            target_name: run.target_name.clone(),
            stage: stage.to_string(),
            request: run.original_request.clone(),
            prior_outputs,
        }
    }
}

/// What a successful stage reports back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// The external generation engine.
///
/// `run_stage` may be invoked more than once for the same stage: transient
/// failures restart it, and a crashed run redoes its interrupted stage.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run_stage(&self, ctx: &StageContext) -> Result<StageOutcome, PipelineError>;

    /// Whether the engine finished its own initialization.
    fn is_ready(&self) -> bool {
        true
    }

    fn on_prompt_response(&self, _prompt_id: &str, _response: &str) {}

    fn on_approval(&self, _prompt_id: Option<&str>, _approved: bool) {}
}

/// Destination for progress, log, completion, and error reports.
pub trait ProgressSink: Send + Sync {
    /// Best-effort; implementations drop rather than fail.
    fn report(&self, message: OutboundMessage);
}

/// Discards every report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&self, _message: OutboundMessage) {}
}

/// Cooperative cancellation, checked before each stage starts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    run_id: Mutex<Option<String>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Run the token is currently guarding, once the driver knows it.
    pub fn run_id(&self) -> Option<String> {
        self.inner.run_id.lock().clone()
    }

    fn bind(&self, run_id: &str) {
        *self.inner.run_id.lock() = Some(run_id.to_string());
    }
}

pub struct PipelineDriver {
    engine: CheckpointEngine,
    runner: Arc<dyn StageRunner>,
    executor: RetryExecutor,
    metrics: WorkerMetrics,
    sink: Arc<dyn ProgressSink>,
}

impl PipelineDriver {
    pub fn new(
        engine: CheckpointEngine,
        runner: Arc<dyn StageRunner>,
        executor: RetryExecutor,
        metrics: WorkerMetrics,
    ) -> Self {
        Self {
            engine,
            runner,
            executor,
            metrics,
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn engine(&self) -> &CheckpointEngine {
        &self.engine
    }

    pub fn runner(&self) -> &Arc<dyn StageRunner> {
        &self.runner
    }

    /// Resume the latest unfinished run for `target_name`, or start a new one.
    pub async fn run_or_resume(
        &self,
        target_name: &str,
        request: &str,
        cancel: &CancelToken,
    ) -> Result<GenerationRun, PipelineError> {
        let run = match self.engine.find_latest(target_name)? {
            Some(run) if run.can_resume() => {
                info!(
                    run_id = %run.run_id,
                    target = %target_name,
                    next_stage = run.next_stage().unwrap_or_default(),
                    "Resuming generation run"
                );
                run
            }
            _ => self.engine.create(target_name, request)?,
        };
        self.drive(run, cancel).await
    }

    /// Resume a specific run. Finished runs are returned unchanged.
    pub async fn resume(&self, run_id: &str, cancel: &CancelToken) -> Result<GenerationRun, PipelineError> {
        let run = self.engine.load(run_id)?;
        if !run.can_resume() {
            info!(run_id = %run_id, "Run already complete, nothing to resume");
            return Ok(run);
        }
        self.drive(run, cancel).await
    }

    /// Execute every remaining stage of `run`.
    pub async fn drive(
        &self,
        mut run: GenerationRun,
        cancel: &CancelToken,
    ) -> Result<GenerationRun, PipelineError> {
        cancel.bind(&run.run_id);
        let started = Instant::now();
        let result = self.drive_stages(&mut run, cancel).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(()) => {
                self.metrics.generation(elapsed, GenerationOutcome::Success);
                info!(
                    run_id = %run.run_id,
                    total_cost = run.total_cost(),
                    elapsed_secs = elapsed.as_secs(),
                    "Generation run completed"
                );
                self.sink.report(OutboundMessage::Completed {
                    run_id: run.run_id.clone(),
                    total_cost: run.total_cost(),
                    outputs: merged_outputs(&run),
                });
            }
            Err(PipelineError::Cancelled(_)) => {
                self.metrics.generation(elapsed, GenerationOutcome::Cancelled);
                info!(run_id = %run.run_id, next_stage = ?run.next_stage(), "Generation run cancelled");
                self.sink.report(OutboundMessage::Log {
                    level: LogLevel::Warn,
                    message: format!("run {} cancelled", run.run_id),
                });
            }
            Err(e) => {
                self.metrics.generation(elapsed, GenerationOutcome::Failed);
                self.metrics.error(e.kind(), e.is_retryable());
                error!(run_id = %run.run_id, error = %e, "Generation run failed");
                self.sink.report(OutboundMessage::Error {
                    message: e.to_string(),
                    run_id: Some(run.run_id.clone()),
                    retryable: e.is_retryable(),
                });
            }
        }
        result.map(|()| run)
    }

    async fn drive_stages(&self, run: &mut GenerationRun, cancel: &CancelToken) -> Result<(), PipelineError> {
        while let Some(stage) = run.next_stage().map(str::to_string) {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled(run.run_id.clone()));
            }

            self.engine.update_stage(run, &stage, StageUpdate::in_progress())?;
            self.sink.report(OutboundMessage::Progress {
                percent: run.progress() * 100.0,
                stage: stage.clone(),
                run_id: Some(run.run_id.clone()),
            });
            info!(run_id = %run.run_id, stage = %stage, "Stage started");

            let ctx = StageContext::for_stage(run, &stage);
            let executor = self.executor.clone().with_wait_hook(self.wait_hook(&stage));
            match executor.execute(|| self.runner.run_stage(&ctx)).await {
                Ok(outcome) => {
                    let update = StageUpdate::completed()
                        .with_cost_delta(outcome.cost)
                        .with_iterations(outcome.iterations)
                        .with_outputs(outcome.outputs)
                        .with_metadata(outcome.metadata);
                    self.engine.update_stage(run, &stage, update)?;
                    info!(
                        run_id = %run.run_id,
                        stage = %stage,
                        stage_cost = outcome.cost,
                        total_cost = run.total_cost(),
                        "Stage completed"
                    );
                }
                Err(e) => {
                    self.engine
                        .update_stage(run, &stage, StageUpdate::failed(e.to_string()))?;
                    warn!(run_id = %run.run_id, stage = %stage, error = %e, "Stage failed");
                    return Err(e);
                }
            }
        }
        self.sink.report(OutboundMessage::Progress {
            percent: 100.0,
            stage: run
                .stages()
                .names()
                .last()
                .map(|s| s.to_string())
                .unwrap_or_default(),
            run_id: Some(run.run_id.clone()),
        });
        Ok(())
    }

    fn wait_hook(&self, stage: &str) -> Arc<dyn Fn(&WaitTick) + Send + Sync> {
        let sink = self.sink.clone();
        let stage = stage.to_string();
        Arc::new(move |tick: &WaitTick| {
            sink.report(OutboundMessage::Log {
                level: LogLevel::Info,
                message: format!(
                    "{stage}: {} backoff, retry {} in {}s",
                    tick.kind,
                    tick.attempt,
                    tick.remaining.as_secs()
                ),
            });
        })
    }
}

fn merged_outputs(run: &GenerationRun) -> BTreeMap<String, String> {
    run.stages()
        .iter()
        .flat_map(|s| {
            s.outputs
                .iter()
                .map(move |(key, value)| (format!("{}.{}", s.name, key), value.clone()))
        })
        .collect()
}
