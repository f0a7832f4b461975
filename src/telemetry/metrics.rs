//! Worker metrics: a bounded, non-blocking sink in front of a Prometheus recorder.
//!
//! Callers hand events to [`WorkerMetrics::record`], which never blocks and
//! never fails. Events that cannot be queued bump `metrics_dropped` instead.
//! Queued events are applied to a recorder owned by this object (no global
//! recorder is installed) either by the background drain task or on render.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

use ::metrics::{counter, histogram, with_local_recorder};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::session::state::DisconnectReason;

pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;
const DRAIN_INTERVAL: Duration = Duration::from_secs(1);

const GENERATION_DURATION: &str = "stagehand_generation_duration_seconds";
const GENERATION_BUCKETS: &[f64] = &[
    30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0, 14400.0, 28800.0,
];

/// Outcome label for reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Success,
    Failure,
    Abandoned,
}

impl ReconnectOutcome {
    fn as_str(self) -> &'static str {
        match self {
            ReconnectOutcome::Success => "success",
            ReconnectOutcome::Failure => "failure",
            ReconnectOutcome::Abandoned => "abandoned",
        }
    }
}

/// Outcome label for one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    Success,
    Failed,
    Cancelled,
}

impl GenerationOutcome {
    fn as_str(self) -> &'static str {
        match self {
            GenerationOutcome::Success => "success",
            GenerationOutcome::Failed => "failed",
            GenerationOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    Connection,
    Disconnection(DisconnectReason),
    ReconnectAttempt(ReconnectOutcome),
    Generation {
        duration: Duration,
        outcome: GenerationOutcome,
    },
    Error {
        error_type: String,
        retryable: bool,
    },
    Message {
        direction: Direction,
        kind: String,
    },
    MessageProcessing {
        kind: String,
        duration: Duration,
    },
}

struct Inner {
    sender: SyncSender<MetricEvent>,
    receiver: Mutex<Receiver<MetricEvent>>,
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    dropped: AtomicU64,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn drain(&self) -> usize {
        let receiver = self.receiver.lock();
        let mut applied = 0usize;
        while let Ok(event) = receiver.try_recv() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                with_local_recorder(&self.recorder, || apply(&event))
            }));
            match outcome {
                Ok(()) => applied += 1,
                Err(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(event = ?event, "Recording metric panicked, event dropped");
                }
            }
        }
        let dropped = self.dropped.load(Ordering::Relaxed);
        with_local_recorder(&self.recorder, || {
            counter!("stagehand_metrics_dropped_total").absolute(dropped);
        });
        applied
    }
}

#[derive(Clone)]
pub struct WorkerMetrics {
    inner: Arc<Inner>,
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl WorkerMetrics {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = sync_channel(capacity.max(1));
        let recorder = match PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Full(GENERATION_DURATION.to_string()), GENERATION_BUCKETS)
        {
            Ok(builder) => builder.build_recorder(),
            Err(err) => {
                warn!(error = %err, "Invalid generation buckets, falling back to summaries");
                PrometheusBuilder::new().build_recorder()
            }
        };
        let handle = recorder.handle();
        Self {
            inner: Arc::new(Inner {
                sender,
                receiver: Mutex::new(receiver),
                recorder,
                handle,
                dropped: AtomicU64::new(0),
                drain_task: Mutex::new(None),
            }),
        }
    }

    /// Queue an event. Never blocks and never propagates a failure.
    pub fn record(&self, event: MetricEvent) {
        match self.inner.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) | Err(TrySendError::Disconnected(event)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(event = ?event, "Metrics queue unavailable, event dropped");
            }
        }
    }

    pub fn connection(&self) {
        self.record(MetricEvent::Connection);
    }

    pub fn disconnection(&self, reason: DisconnectReason) {
        self.record(MetricEvent::Disconnection(reason));
    }

    pub fn reconnect_attempt(&self, outcome: ReconnectOutcome) {
        self.record(MetricEvent::ReconnectAttempt(outcome));
    }

    pub fn generation(&self, duration: Duration, outcome: GenerationOutcome) {
        self.record(MetricEvent::Generation { duration, outcome });
    }

    pub fn error(&self, error_type: impl Into<String>, retryable: bool) {
        self.record(MetricEvent::Error {
            error_type: error_type.into(),
            retryable,
        });
    }

    pub fn message(&self, direction: Direction, kind: impl Into<String>) {
        self.record(MetricEvent::Message {
            direction,
            kind: kind.into(),
        });
    }

    pub fn message_processing(&self, kind: impl Into<String>, duration: Duration) {
        self.record(MetricEvent::MessageProcessing {
            kind: kind.into(),
            duration,
        });
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Apply every queued event to the recorder.
    pub fn drain(&self) -> usize {
        self.inner.drain()
    }

    /// Text exposition of every metric.
    pub fn render(&self) -> String {
        self.drain();
        self.inner.handle.render()
    }

    /// Spawn the periodic drain task. Requires a tokio runtime.
    pub fn start(&self) {
        let mut task = self.inner.drain_task.lock();
        if task.is_some() {
            return;
        }
        let inner = Arc::downgrade(&self.inner);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DRAIN_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    debug!("Metrics released, drain task exiting");
                    return;
                };
                inner.drain();
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self.inner.drain_task.lock().take() {
            task.abort();
        }
        self.drain();
    }
}

fn bool_label(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn apply(event: &MetricEvent) {
    match event {
        MetricEvent::Connection => {
            counter!("stagehand_ws_connections_total").increment(1);
        }
        MetricEvent::Disconnection(reason) => {
            counter!("stagehand_ws_disconnections_total", "reason" => reason.as_str()).increment(1);
        }
        MetricEvent::ReconnectAttempt(outcome) => {
            counter!("stagehand_ws_reconnect_attempts_total", "outcome" => outcome.as_str())
                .increment(1);
        }
        MetricEvent::Generation { duration, outcome } => {
            histogram!(GENERATION_DURATION).record(duration.as_secs_f64());
            counter!("stagehand_generations_total", "outcome" => outcome.as_str()).increment(1);
        }
        MetricEvent::Error {
            error_type,
            retryable,
        } => {
            counter!(
                "stagehand_errors_total",
                "error_type" => error_type.clone(),
                "retryable" => bool_label(*retryable)
            )
            .increment(1);
        }
        MetricEvent::Message { direction, kind } => {
            counter!(
                "stagehand_messages_total",
                "direction" => direction.as_str(),
                "type" => kind.clone()
            )
            .increment(1);
        }
        MetricEvent::MessageProcessing { kind, duration } => {
            histogram!("stagehand_message_processing_seconds", "type" => kind.clone())
                .record(duration.as_secs_f64());
        }
    }
}
