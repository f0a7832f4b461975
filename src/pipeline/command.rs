//! Stage runner that delegates to an external program.
//!
//! The program is started once per stage attempt with the stage name as its
//! last argument. It receives the [`StageContext`] as JSON on stdin and must
//! print a [`StageOutcome`] as JSON on stdout. A non-zero exit is classified
//! from its stderr, so an upstream "429" or "overloaded" becomes retryable.

use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::GeneratorConfig;
use crate::error::PipelineError;
use crate::pipeline::{StageContext, StageOutcome, StageRunner};
use crate::retry::{classify, TransientKind};

pub struct CommandRunner {
    config: GeneratorConfig,
}

impl CommandRunner {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }
}

fn failure_from_stderr(stage: &str, stderr: &str) -> PipelineError {
    let message = stderr.trim();
    let message = if message.is_empty() {
        format!("generator exited with failure during '{}'", stage)
    } else {
        message.to_string()
    };
    match classify(&message) {
        Some(TransientKind::Overloaded) => PipelineError::Overloaded(message),
        Some(TransientKind::RateLimited) => PipelineError::RateLimited(message),
        Some(TransientKind::Timeout) => PipelineError::Timeout(message),
        None => PipelineError::StageFailed {
            stage: stage.to_string(),
            message,
        },
    }
}

#[async_trait]
impl StageRunner for CommandRunner {
    async fn run_stage(&self, ctx: &StageContext) -> Result<StageOutcome, PipelineError> {
        let Some((program, args)) = self.config.command.split_first() else {
            return Err(PipelineError::Generator("no generator command configured".to_string()));
        };
        let input = serde_json::to_vec(ctx).map_err(|e| PipelineError::InvalidInput(e.to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .arg(&ctx.stage)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| PipelineError::Generator(format!("failed to start '{}': {}", program, e)))?;

        // Stdin is fed from its own task; the stage timeout covers the write.
        let stdin = child.stdin.take();
        let writer = tokio::spawn(async move {
            match stdin {
                Some(mut stdin) => stdin.write_all(&input).await,
                None => Ok(()),
            }
        });
        let abort_writer = writer.abort_handle();

        let limit = Duration::from_secs(self.config.stage_timeout_secs);
        let finished = tokio::time::timeout(limit, async move {
            let output = child.wait_with_output().await;
            let written = writer.await;
            (output, written)
        })
        .await;
        let (output, written) = match finished {
            Ok(done) => done,
            Err(_) => {
                abort_writer.abort();
                return Err(PipelineError::Timeout(format!(
                    "stage '{}' exceeded {}s",
                    ctx.stage,
                    limit.as_secs()
                )));
            }
        };
        let output = output.map_err(|e| PipelineError::Generator(e.to_string()))?;

        debug!(
            run_id = %ctx.run_id,
            stage = %ctx.stage,
            status = %output.status,
            "Generator process exited"
        );
        if !output.status.success() {
            return Err(failure_from_stderr(
                &ctx.stage,
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.kind() == ErrorKind::BrokenPipe => {
                debug!(stage = %ctx.stage, "Generator exited before reading all of its input");
            }
            Ok(Err(e)) => {
                return Err(PipelineError::Generator(format!("failed to write stage input: {}", e)))
            }
            Err(e) => {
                return Err(PipelineError::Generator(format!("stage input writer failed: {}", e)))
            }
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| PipelineError::Generator(format!("invalid stage outcome JSON: {}", e)))
    }

    fn is_ready(&self) -> bool {
        !self.config.command.is_empty()
    }
}
