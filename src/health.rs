//! Health and readiness of the worker.
//!
//! `HealthMonitor` is constructed explicitly and handed to the session and the
//! HTTP surface; it has a `start()`/`stop()` lifecycle and reads session state
//! without ever waiting on the network.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::info;

use crate::session::state::SharedSessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    /// Load-balancer view: only `Healthy` is OK.
    pub fn is_ok(self) -> bool {
        self == HealthStatus::Healthy
    }

    fn to_u8(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => HealthStatus::Healthy,
            1 => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Both healthy is healthy, either unhealthy is unhealthy, anything else degrades.
pub fn compose(transport: HealthStatus, generator: HealthStatus) -> HealthStatus {
    match (transport, generator) {
        (HealthStatus::Healthy, HealthStatus::Healthy) => HealthStatus::Healthy,
        (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
        _ => HealthStatus::Degraded,
    }
}

/// Liveness of the external generation engine.
pub trait GeneratorProbe: Send + Sync {
    fn status(&self) -> HealthStatus;
    fn initialized(&self) -> bool;
}

/// Generator state updated by the pipeline side.
#[derive(Debug)]
pub struct GeneratorStatus {
    status: AtomicU8,
    initialized: AtomicBool,
}

impl Default for GeneratorStatus {
    fn default() -> Self {
        Self {
            status: AtomicU8::new(HealthStatus::Unhealthy.to_u8()),
            initialized: AtomicBool::new(false),
        }
    }
}

impl GeneratorStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialized generators start out healthy.
    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
        self.set_status(HealthStatus::Healthy);
    }

    pub fn set_status(&self, status: HealthStatus) {
        self.status.store(status.to_u8(), Ordering::SeqCst);
    }
}

impl GeneratorProbe for GeneratorStatus {
    fn status(&self) -> HealthStatus {
        HealthStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthChecks {
    pub transport: HealthStatus,
    pub generator: HealthStatus,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub websocket_connected: bool,
    pub generator_initialized: bool,
}

pub struct HealthMonitor {
    session: SharedSessionState,
    generator: Arc<dyn GeneratorProbe>,
    stale_after: Duration,
    started_at: RwLock<Option<Instant>>,
}

impl HealthMonitor {
    pub fn new(
        session: SharedSessionState,
        generator: Arc<dyn GeneratorProbe>,
        stale_after: Duration,
    ) -> Self {
        Self {
            session,
            generator,
            stale_after,
            started_at: RwLock::new(None),
        }
    }

    pub fn start(&self) {
        let mut started = self.started_at.write();
        if started.is_none() {
            *started = Some(Instant::now());
            info!("Health monitor started");
        }
    }

    pub fn stop(&self) {
        if self.started_at.write().take().is_some() {
            info!("Health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.started_at.read().is_some()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at
            .read()
            .map(|at| at.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// A stopped monitor reports unhealthy so load balancers drain the worker.
    pub fn check_health(&self) -> HealthReport {
        let transport = self.session.snapshot().transport_health(self.stale_after);
        let generator = self.generator.status();
        let status = if self.is_running() {
            compose(transport, generator)
        } else {
            HealthStatus::Unhealthy
        };
        HealthReport {
            status,
            timestamp: Utc::now(),
            checks: HealthChecks {
                transport,
                generator,
                uptime_secs: self.uptime().as_secs(),
            },
        }
    }

    pub fn check_readiness(&self) -> ReadinessReport {
        let websocket_connected = self.session.snapshot().is_connected();
        let generator_initialized = self.generator.initialized();
        ReadinessReport {
            ready: websocket_connected && generator_initialized,
            websocket_connected,
            generator_initialized,
        }
    }
}
