//! Configuration System
//!
//! Layered worker configuration: built-in defaults, the global file, the
//! workspace files, then `STAGEHAND__*` environment variables. Validation
//! collects every problem instead of stopping at the first.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logging::LoggingConfig;
use crate::retry::RetryPolicy;

mod loader;
mod merge;
mod sources;

pub use loader::ConfigLoader;
pub use sources::global_file::global_config_path;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Workspace root path (defaults to current directory)
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub generator: GeneratorConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            pipeline: PipelineConfig::default(),
            retry: RetryConfig::default(),
            session: SessionConfig::default(),
            http: HttpConfig::default(),
            generator: GeneratorConfig::default(),
            monitor: MonitorConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub const DEFAULT_STAGES: &[&str] = &["plan", "scaffold", "implement", "verify", "package"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Stage names in execution order.
    #[serde(default = "default_stages")]
    pub stages: Vec<String>,
}

fn default_stages() -> Vec<String> {
    DEFAULT_STAGES.iter().map(|s| s.to_string()).collect()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: default_stages(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_delay_schedule")]
    pub delay_schedule_secs: Vec<u64>,
    #[serde(default = "default_sleep_chunk")]
    pub sleep_chunk_secs: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_delay_schedule() -> Vec<u64> {
    vec![60, 120, 240, 480, 960]
}

fn default_sleep_chunk() -> u64 {
    10
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_schedule_secs: default_delay_schedule(),
            sleep_chunk_secs: default_sleep_chunk(),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy::new(
            config.max_retries,
            config
                .delay_schedule_secs
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect(),
        )
        .with_sleep_chunk(Duration::from_secs(config.sleep_chunk_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Orchestrator WebSocket endpoint.
    #[serde(default = "default_session_url")]
    pub url: String,
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_reconnect_schedule")]
    pub reconnect_schedule_secs: Vec<u64>,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_stale")]
    pub heartbeat_stale_secs: u64,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

fn default_session_url() -> String {
    "ws://127.0.0.1:8080/ws/worker".to_string()
}

fn default_worker_id() -> String {
    format!("worker-{}", std::process::id())
}

fn default_max_consecutive_failures() -> u32 {
    10
}

fn default_reconnect_schedule() -> Vec<u64> {
    vec![1, 2, 5, 10, 30]
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_stale() -> u64 {
    60
}

fn default_outbound_queue() -> usize {
    256
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: default_session_url(),
            worker_id: default_worker_id(),
            max_consecutive_failures: default_max_consecutive_failures(),
            reconnect_schedule_secs: default_reconnect_schedule(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_stale_secs: default_heartbeat_stale(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl SessionConfig {
    pub fn heartbeat_stale(&self) -> Duration {
        Duration::from_secs(self.heartbeat_stale_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:8088".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl HttpConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, String> {
        self.listen
            .parse()
            .map_err(|e| format!("invalid listen address '{}': {}", self.listen, e))
    }

    /// Base URL a local client uses to reach this listener.
    pub fn local_url(&self) -> String {
        match self.socket_addr() {
            Ok(addr) if addr.ip().is_unspecified() => {
                let host = if addr.is_ipv4() { "127.0.0.1" } else { "[::1]" };
                format!("http://{}:{}", host, addr.port())
            }
            Ok(addr) => format!("http://{}", addr),
            Err(_) => format!("http://{}", self.listen),
        }
    }
}

/// External program that executes one stage per invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Program followed by fixed arguments. Empty means no generator is installed.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Per-attempt limit for one stage.
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,
}

fn default_stage_timeout() -> u64 {
    4 * 60 * 60
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            working_dir: None,
            stage_timeout_secs: default_stage_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Worker HTTP surface to ask while the worker holds the store; derived
    /// from `http.listen` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_url: Option<String>,
}

fn default_poll_interval() -> u64 {
    5
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            worker_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// sled directory; relative paths resolve against the workspace root.
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from(".stagehand/checkpoints")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: default_checkpoint_path(),
        }
    }
}

impl StorageConfig {
    pub fn resolve(&self, workspace_root: &Path) -> PathBuf {
        if self.checkpoint_path.is_absolute() {
            self.checkpoint_path.clone()
        } else {
            workspace_root.join(&self.checkpoint_path)
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Pipeline(String),
    Retry(String),
    Session(String),
    Http(String),
    Generator(String),
    Monitor(String),
    Storage(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Pipeline(msg) => write!(f, "Pipeline: {}", msg),
            ValidationError::Retry(msg) => write!(f, "Retry: {}", msg),
            ValidationError::Session(msg) => write!(f, "Session: {}", msg),
            ValidationError::Http(msg) => write!(f, "HTTP: {}", msg),
            ValidationError::Generator(msg) => write!(f, "Generator: {}", msg),
            ValidationError::Monitor(msg) => write!(f, "Monitor: {}", msg),
            ValidationError::Storage(msg) => write!(f, "Storage: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl WorkerConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.pipeline.stages.is_empty() {
            errors.push(ValidationError::Pipeline("at least one stage is required".to_string()));
        }
        let mut seen = HashSet::new();
        for stage in &self.pipeline.stages {
            if stage.trim().is_empty() {
                errors.push(ValidationError::Pipeline("stage names cannot be empty".to_string()));
            } else if !seen.insert(stage.as_str()) {
                errors.push(ValidationError::Pipeline(format!("duplicate stage '{}'", stage)));
            }
        }

        if self.retry.delay_schedule_secs.is_empty() {
            errors.push(ValidationError::Retry("delay_schedule_secs cannot be empty".to_string()));
        }

        let session = &self.session;
        if !(session.url.starts_with("ws://") || session.url.starts_with("wss://")) {
            errors.push(ValidationError::Session(format!(
                "url must use ws:// or wss://, got '{}'",
                session.url
            )));
        }
        if session.worker_id.trim().is_empty() {
            errors.push(ValidationError::Session("worker_id cannot be empty".to_string()));
        }
        if session.max_consecutive_failures == 0 {
            errors.push(ValidationError::Session(
                "max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        if session.reconnect_schedule_secs.is_empty() {
            errors.push(ValidationError::Session(
                "reconnect_schedule_secs cannot be empty".to_string(),
            ));
        }
        if session.heartbeat_interval_secs == 0 {
            errors.push(ValidationError::Session(
                "heartbeat_interval_secs must be positive".to_string(),
            ));
        }
        if session.heartbeat_stale_secs < session.heartbeat_interval_secs {
            errors.push(ValidationError::Session(
                "heartbeat_stale_secs must not be shorter than heartbeat_interval_secs".to_string(),
            ));
        }
        if session.outbound_queue == 0 {
            errors.push(ValidationError::Session("outbound_queue must be positive".to_string()));
        }

        if let Err(e) = self.http.socket_addr() {
            errors.push(ValidationError::Http(e));
        }

        if self.generator.stage_timeout_secs == 0 {
            errors.push(ValidationError::Generator(
                "stage_timeout_secs must be positive".to_string(),
            ));
        }
        if self
            .generator
            .command
            .first()
            .is_some_and(|program| program.trim().is_empty())
        {
            errors.push(ValidationError::Generator("command program cannot be blank".to_string()));
        }

        if self.monitor.poll_interval_secs == 0 {
            errors.push(ValidationError::Monitor("poll_interval_secs must be positive".to_string()));
        }
        if let Some(url) = &self.monitor.worker_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(ValidationError::Monitor(format!(
                    "worker_url must use http:// or https://, got '{}'",
                    url
                )));
            }
        }

        if self.storage.checkpoint_path.as_os_str().is_empty() {
            errors.push(ValidationError::Storage("checkpoint_path cannot be empty".to_string()));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }

    pub fn checkpoint_dir(&self, workspace_root: &Path) -> PathBuf {
        let root = self.workspace_root.as_deref().unwrap_or(workspace_root);
        self.storage.resolve(root)
    }
}
