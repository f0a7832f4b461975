//! WSI wire protocol: closed message sets per direction.
//!
//! Every frame is a JSON object with a `type` discriminator. Unknown inbound
//! kinds decode to [`Decoded::Unknown`] so the session can log and drop them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SessionError;

pub const INBOUND_KINDS: &[&str] = &["command", "prompt_response", "approve", "cancel"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Worker → orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Progress {
        percent: f64,
        stage: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
    },
    Log {
        level: LogLevel,
        message: String,
    },
    Completed {
        run_id: String,
        total_cost: f64,
        #[serde(default)]
        outputs: BTreeMap<String, String>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        #[serde(default)]
        retryable: bool,
    },
    HeartbeatAck {
        timestamp: DateTime<Utc>,
    },
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Progress { .. } => "progress",
            OutboundMessage::Log { .. } => "log",
            OutboundMessage::Completed { .. } => "completed",
            OutboundMessage::Error { .. } => "error",
            OutboundMessage::HeartbeatAck { .. } => "heartbeat_ack",
        }
    }

    pub fn encode(&self) -> Result<String, SessionError> {
        serde_json::to_string(self).map_err(|e| SessionError::Protocol(e.to_string()))
    }

    pub fn heartbeat_ack() -> Self {
        OutboundMessage::HeartbeatAck {
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    /// Start a new run, or resume the latest unfinished run for the target.
    Generate,
    /// Resume an explicit run id.
    Resume,
}

/// Orchestrator → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Command {
        action: CommandAction,
        target_name: String,
        #[serde(default)]
        request: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
    },
    PromptResponse {
        prompt_id: String,
        response: String,
    },
    Approve {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt_id: Option<String>,
        #[serde(default = "default_true")]
        approved: bool,
    },
    Cancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

fn default_true() -> bool {
    true
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Command { .. } => "command",
            InboundMessage::PromptResponse { .. } => "prompt_response",
            InboundMessage::Approve { .. } => "approve",
            InboundMessage::Cancel { .. } => "cancel",
        }
    }
}

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(InboundMessage),
    /// Well-formed frame whose `type` is outside the inbound set.
    Unknown { kind: String },
}

/// Decode an inbound text frame.
///
/// A frame that is not JSON, lacks a `type`, or carries a known type with a
/// malformed payload is a protocol error.
pub fn decode_inbound(text: &str) -> Result<Decoded, SessionError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| SessionError::Protocol(format!("invalid JSON: {e}")))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| SessionError::Protocol("missing message type".to_string()))?
        .to_string();

    if !INBOUND_KINDS.contains(&kind.as_str()) {
        return Ok(Decoded::Unknown { kind });
    }

    serde_json::from_value(value)
        .map(Decoded::Message)
        .map_err(|e| SessionError::Protocol(format!("malformed '{kind}' payload: {e}")))
}
