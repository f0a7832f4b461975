//! Stagehand: resumable generation worker
//!
//! Drives long-running, multi-stage generation jobs on behalf of an
//! orchestrator. Every stage transition is checkpointed so a crashed or
//! restarted worker resumes at the first unfinished stage; transient upstream
//! failures are absorbed by a bounded retry executor; and a WebSocket session
//! streams progress back while exposing health, readiness, and metrics.

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod logging;
pub mod monitor;
pub mod pipeline;
pub mod retry;
pub mod session;
pub mod telemetry;
pub mod worker;
