//! Error types for the stagehand generation worker.

use crate::session::state::ConnectionState;
use thiserror::Error;

/// Checkpoint storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Corrupt checkpoint document for run {run_id}: {message}")]
    CorruptDocument { run_id: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Checkpoint store at {0} is held by another process")]
    Locked(String),

    #[error("Worker query failed: {0}")]
    Remote(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Pipeline and stage execution errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unknown stage '{stage}' for run {run_id}")]
    UnknownStage { run_id: String, stage: String },

    #[error("Stage '{stage}' failed: {message}")]
    StageFailed { stage: String, message: String },

    #[error("Upstream overloaded: {0}")]
    Overloaded(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Run {0} was cancelled")]
    Cancelled(String),

    #[error("Generator error: {0}")]
    Generator(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl PipelineError {
    /// Whether the retry executor should absorb this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Overloaded(_) | PipelineError::RateLimited(_) | PipelineError::Timeout(_)
        )
    }

    /// Stable label used as the `error_type` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::UnknownStage { .. } => "unknown_stage",
            PipelineError::StageFailed { .. } => "stage_failed",
            PipelineError::Overloaded(_) => "overloaded",
            PipelineError::RateLimited(_) => "rate_limited",
            PipelineError::Timeout(_) => "timeout",
            PipelineError::InvalidInput(_) => "invalid_input",
            PipelineError::AuthFailed(_) => "auth_failed",
            PipelineError::Cancelled(_) => "cancelled",
            PipelineError::Generator(_) => "generator",
            PipelineError::Storage(_) => "storage",
        }
    }
}

/// Worker session (WSI) errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Cannot send while {0}")]
    NotConnected(ConnectionState),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Reconnection abandoned after {0} consecutive failures")]
    ReconnectExhausted(u32),

    #[error("Outbound queue full, dropped '{0}' message")]
    QueueFull(&'static str),

    #[error("Outbound queue closed")]
    QueueClosed,
}

/// Top-level worker errors
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Pipeline error: {0}")]
    PipelineError(#[from] PipelineError),

    #[error("Session error: {0}")]
    SessionError(#[from] SessionError),

    #[error("HTTP server error: {0}")]
    HttpError(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),
}

impl From<config::ConfigError> for WorkerError {
    fn from(err: config::ConfigError) -> Self {
        WorkerError::ConfigError(err.to_string())
    }
}
