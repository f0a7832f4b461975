//! CLI route: single route table and run context. Dispatches to domain services.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cli::parse::Commands;
use crate::config::{ConfigLoader, WorkerConfig};
use crate::error::{StorageError, WorkerError};
use crate::monitor::{
    render_run_list, render_snapshot, ProgressMonitor, ProgressSnapshot, RunSource,
    WorkerRunSource, WorkspaceRunSource,
};
use crate::pipeline::CommandRunner;
use crate::session::WebSocketTransport;
use crate::worker::Worker;

/// Runtime context for CLI execution: workspace and effective configuration.
/// Built from workspace path and optional config path using ConfigLoader only.
pub struct RunContext {
    workspace_root: PathBuf,
    config: WorkerConfig,
}

impl RunContext {
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, WorkerError> {
        let config = match config_path {
            Some(ref path) => ConfigLoader::load_from_file(path)?,
            None => ConfigLoader::load(&workspace_root)?,
        };
        Ok(Self {
            workspace_root,
            config,
        })
    }

    pub fn from_config(workspace_root: PathBuf, config: WorkerConfig) -> Self {
        Self {
            workspace_root,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Execute a CLI command via the single route table.
    pub fn execute(&self, command: &Commands) -> Result<String, WorkerError> {
        match command {
            Commands::Worker {
                url,
                worker_id,
                listen,
            } => self.handle_worker(url.as_deref(), worker_id.as_deref(), listen.as_deref()),
            Commands::Monitor {
                run_id,
                once,
                interval,
            } => self.handle_monitor(run_id.as_deref(), *once, *interval),
            Commands::Runs {
                target,
                resumable,
                format,
            } => self.handle_runs(target.as_deref(), *resumable, format),
            Commands::Config { validate } => self.handle_config(*validate),
        }
    }

    fn handle_worker(
        &self,
        url: Option<&str>,
        worker_id: Option<&str>,
        listen: Option<&str>,
    ) -> Result<String, WorkerError> {
        let mut config = self.config.clone();
        if let Some(url) = url {
            config.session.url = url.to_string();
        }
        if let Some(worker_id) = worker_id {
            config.session.worker_id = worker_id.to_string();
        }
        if let Some(listen) = listen {
            config.http.listen = listen.to_string();
        }

        let runtime = build_runtime()?;
        runtime.block_on(async {
            let runner = Arc::new(CommandRunner::new(config.generator.clone()));
            let transport = Arc::new(WebSocketTransport::default());
            let worker = Worker::build(config, &self.workspace_root, runner, transport)?;
            info!("Starting worker");
            worker
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::warn!(error = %e, "Failed to listen for interrupt, stopping");
                    }
                })
                .await
        })?;
        Ok("Worker stopped".to_string())
    }

    fn handle_monitor(
        &self,
        run_id: Option<&str>,
        once: bool,
        interval: Option<u64>,
    ) -> Result<String, WorkerError> {
        let poll = Duration::from_secs(interval.unwrap_or(self.config.monitor.poll_interval_secs).max(1));
        let monitor = ProgressMonitor::new(self.run_source()?, poll);
        let runtime = build_runtime()?;

        match (run_id, once) {
            (Some(run_id), true) => Ok(render_snapshot(&runtime.block_on(monitor.snapshot(run_id))?)),
            (None, true) => Ok(render_run_list(&runtime.block_on(monitor.poll_once())?)),
            (Some(run_id), false) => {
                let last = runtime.block_on(monitor.watch_run(run_id, |snapshot| {
                    println!("{}", render_snapshot(snapshot));
                }))?;
                Ok(finished_summary(&last))
            }
            (None, false) => {
                runtime.block_on(monitor.watch_all(|active| {
                    if !active.is_empty() {
                        println!("{}", render_run_list(active));
                    }
                }))?;
                Ok("No active runs".to_string())
            }
        }
    }

    fn handle_runs(
        &self,
        target: Option<&str>,
        resumable: bool,
        format: &str,
    ) -> Result<String, WorkerError> {
        let monitor = ProgressMonitor::new(
            self.run_source()?,
            Duration::from_secs(self.config.monitor.poll_interval_secs),
        );
        let runtime = build_runtime()?;
        let mut runs = if resumable {
            runtime.block_on(monitor.poll_once())?
        } else {
            runtime.block_on(monitor.all_runs())?
        };
        if let Some(target) = target {
            runs.retain(|s| s.target_name == target);
        }

        match format {
            "json" => serde_json::to_string_pretty(&runs)
                .map_err(|e| WorkerError::StorageError(StorageError::Serialization(e.to_string()))),
            "text" => Ok(render_run_list(&runs)),
            other => Err(WorkerError::ConfigError(format!(
                "unknown format '{}', expected text or json",
                other
            ))),
        }
    }

    fn handle_config(&self, validate: bool) -> Result<String, WorkerError> {
        if validate {
            return match self.config.validate() {
                Ok(()) => Ok("Configuration is valid".to_string()),
                Err(errors) => Err(WorkerError::ConfigError(
                    errors
                        .iter()
                        .map(|e| e.to_string())
                        .collect::<Vec<_>>()
                        .join("; "),
                )),
            };
        }
        toml::to_string_pretty(&self.config)
            .map_err(|e| WorkerError::ConfigError(format!("failed to render configuration: {}", e)))
    }

    /// The workspace store, read per poll, or the local worker while it
    /// holds the store.
    fn run_source(&self) -> Result<Arc<dyn RunSource>, WorkerError> {
        let worker_url = self
            .config
            .monitor
            .worker_url
            .clone()
            .unwrap_or_else(|| self.config.http.local_url());
        let worker = WorkerRunSource::new(worker_url)?;
        Ok(Arc::new(WorkspaceRunSource::new(
            self.config.checkpoint_dir(&self.workspace_root),
            worker,
        )))
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime, WorkerError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| WorkerError::RuntimeError(format!("failed to start tokio runtime: {}", e)))
}

fn finished_summary(snapshot: &ProgressSnapshot) -> String {
    format!(
        "Run {} completed, total cost {:.4}",
        snapshot.run_id, snapshot.total_cost
    )
}
