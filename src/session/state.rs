//! Connection state machine for the worker session.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::health::HealthStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    Normal,
    Error,
    Timeout,
}

impl DisconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::Normal => "normal",
            DisconnectReason::Error => "error",
            DisconnectReason::Timeout => "timeout",
        }
    }
}

/// Mutable per-connection bookkeeping. Owns no durable state.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub connection_state: ConnectionState,
    /// Attempts made since the last successful connect.
    pub reconnect_attempts: u32,
    /// Failed attempts in a row; reaching the configured bound stops reconnection.
    pub consecutive_failures: u32,
    pub last_heartbeat: Option<Instant>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_disconnect: Option<DisconnectReason>,
    pub connected_at: Option<DateTime<Utc>>,
    /// Set once the reconnection budget is spent; no further attempts follow.
    pub gave_up: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            consecutive_failures: 0,
            last_heartbeat: None,
            last_heartbeat_at: None,
            last_disconnect: None,
            connected_at: None,
            gave_up: false,
        }
    }
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    /// Returns false when a connect is not allowed from the current state.
    pub fn begin_connect(&mut self) -> bool {
        if self.gave_up || self.connection_state != ConnectionState::Disconnected {
            return false;
        }
        self.connection_state = ConnectionState::Connecting;
        self.reconnect_attempts += 1;
        true
    }

    pub fn mark_connected(&mut self) {
        self.connection_state = ConnectionState::Connected;
        self.reconnect_attempts = 0;
        self.consecutive_failures = 0;
        self.last_disconnect = None;
        self.connected_at = Some(Utc::now());
        self.touch_heartbeat();
    }

    pub fn mark_connect_failed(&mut self, reason: DisconnectReason) {
        self.connection_state = ConnectionState::Disconnected;
        self.consecutive_failures += 1;
        self.last_disconnect = Some(reason);
    }

    pub fn begin_close(&mut self) -> bool {
        if self.connection_state != ConnectionState::Connected {
            return false;
        }
        self.connection_state = ConnectionState::Closing;
        true
    }

    pub fn mark_disconnected(&mut self, reason: DisconnectReason) {
        self.connection_state = ConnectionState::Disconnected;
        self.last_disconnect = Some(reason);
        self.connected_at = None;
    }

    pub fn give_up(&mut self) {
        self.gave_up = true;
        self.connection_state = ConnectionState::Disconnected;
    }

    pub fn touch_heartbeat(&mut self) {
        self.last_heartbeat = Some(Instant::now());
        self.last_heartbeat_at = Some(Utc::now());
    }

    pub fn heartbeat_age(&self) -> Option<Duration> {
        self.last_heartbeat.map(|at| at.elapsed())
    }

    /// Transport health.
    ///
    /// A stale heartbeat only degrades; losing the connection is unhealthy.
    pub fn transport_health(&self, stale_after: Duration) -> HealthStatus {
        if self.gave_up {
            return HealthStatus::Unhealthy;
        }
        match self.connection_state {
            ConnectionState::Connected => match self.heartbeat_age() {
                Some(age) if age <= stale_after => HealthStatus::Healthy,
                _ => HealthStatus::Degraded,
            },
            ConnectionState::Connecting | ConnectionState::Closing => HealthStatus::Degraded,
            ConnectionState::Disconnected => HealthStatus::Unhealthy,
        }
    }
}

/// Shared handle; reads never wait on the network.
#[derive(Debug, Clone, Default)]
pub struct SharedSessionState(Arc<RwLock<SessionState>>);

impl SharedSessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SessionState {
        self.0.read().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.0.read().connection_state
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        f(&mut *self.0.write())
    }

    pub fn touch_heartbeat(&self) {
        self.0.write().touch_heartbeat();
    }
}
