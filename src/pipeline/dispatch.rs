//! Routes inbound orchestrator commands to the pipeline driver.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::health::{GeneratorStatus, HealthStatus};
use crate::pipeline::{CancelToken, PipelineDriver, ProgressSink};
use crate::retry::Classify;
use crate::session::client::InboundHandler;
use crate::session::protocol::{CommandAction, InboundMessage, OutboundMessage};

struct ActiveJob {
    target_name: String,
    cancel: CancelToken,
}

/// Frees the job slot when the job task ends, including by panic.
struct JobSlot(Arc<Mutex<Option<ActiveJob>>>);

impl Drop for JobSlot {
    fn drop(&mut self) {
        if let Some(job) = self.0.lock().take() {
            if std::thread::panicking() {
                error!(target = %job.target_name, "Job panicked, slot released");
            }
        }
    }
}

/// Accepts one job at a time; a command arriving while busy is refused.
pub struct GenerationDispatcher {
    driver: Arc<PipelineDriver>,
    generator: Arc<GeneratorStatus>,
    sink: Arc<dyn ProgressSink>,
    active: Arc<Mutex<Option<ActiveJob>>>,
}

impl GenerationDispatcher {
    pub fn new(
        driver: Arc<PipelineDriver>,
        generator: Arc<GeneratorStatus>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        if driver.runner().is_ready() {
            generator.mark_initialized();
        }
        Self {
            driver,
            generator,
            sink,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active.lock().is_some()
    }

    fn start_job(&self, action: CommandAction, target_name: String, request: String, run_id: Option<String>) {
        let cancel = CancelToken::new();
        {
            let mut active = self.active.lock();
            if let Some(job) = active.as_ref() {
                warn!(busy_with = %job.target_name, target = %target_name, "Worker busy, refusing command");
                self.sink.report(OutboundMessage::Error {
                    message: format!("worker busy with target '{}'", job.target_name),
                    run_id,
                    retryable: true,
                });
                return;
            }
            *active = Some(ActiveJob {
                target_name: target_name.clone(),
                cancel: cancel.clone(),
            });
        }

        let driver = self.driver.clone();
        let generator = self.generator.clone();
        let slot = JobSlot(self.active.clone());
        tokio::spawn(async move {
            let _slot = slot;
            let result = match (action, run_id) {
                (CommandAction::Resume, Some(run_id)) => driver.resume(&run_id, &cancel).await,
                _ => driver.run_or_resume(&target_name, &request, &cancel).await,
            };
            match result {
                Ok(run) => {
                    generator.set_status(HealthStatus::Healthy);
                    info!(run_id = %run.run_id, "Job finished");
                }
                Err(e) if e.transient_kind().is_some() => {
                    generator.set_status(HealthStatus::Degraded);
                    warn!(target = %target_name, error = %e, "Job stopped on exhausted retries");
                }
                Err(e) => {
                    warn!(target = %target_name, error = %e, "Job stopped");
                }
            }
        });
    }

    fn cancel(&self, run_id: Option<String>, reason: Option<String>) {
        let active = self.active.lock();
        let Some(job) = active.as_ref() else {
            info!(run_id = ?run_id, "Cancel received with no active job");
            return;
        };
        let matches = match (&run_id, job.cancel.run_id()) {
            (Some(wanted), Some(current)) => *wanted == current,
            _ => true,
        };
        if matches {
            job.cancel.cancel();
            info!(target = %job.target_name, reason = ?reason, "Cancellation requested");
        } else {
            warn!(run_id = ?run_id, "Cancel does not match the active run, ignoring");
        }
    }
}

impl InboundHandler for GenerationDispatcher {
    fn handle(&self, message: InboundMessage) {
        match message {
            InboundMessage::Command {
                action,
                target_name,
                request,
                run_id,
            } => self.start_job(action, target_name, request, run_id),
            InboundMessage::Cancel { run_id, reason } => self.cancel(run_id, reason),
            InboundMessage::PromptResponse { prompt_id, response } => {
                self.driver.runner().on_prompt_response(&prompt_id, &response)
            }
            InboundMessage::Approve { prompt_id, approved } => {
                self.driver.runner().on_approval(prompt_id.as_deref(), approved)
            }
        }
    }
}
