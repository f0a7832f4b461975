//! Telemetry domain: Prometheus metrics for the worker.

pub mod metrics;

pub use self::metrics::{Direction, GenerationOutcome, MetricEvent, ReconnectOutcome, WorkerMetrics};
