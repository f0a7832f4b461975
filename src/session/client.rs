//! Worker session: connection lifecycle, message flow, bounded reconnection.
//!
//! One `run()` loop owns the physical connection. Everything else talks to it
//! through a [`SessionHandle`], which enqueues outbound messages only while the
//! session is `Connected`. Frames still queued when the connection drops are
//! discarded; there is no redelivery.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::pipeline::ProgressSink;
use crate::retry::{Classify, RetryPolicy};
use crate::session::protocol::{decode_inbound, Decoded, InboundMessage, OutboundMessage};
use crate::session::state::{ConnectionState, DisconnectReason, SharedSessionState};
use crate::session::transport::{Connection, Transport, TransportEvent};
use crate::telemetry::{Direction, ReconnectOutcome, WorkerMetrics};

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub url: String,
    pub worker_id: String,
    pub max_consecutive_failures: u32,
    pub reconnect_schedule: Vec<Duration>,
    pub heartbeat_interval: Duration,
    pub outbound_queue: usize,
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            url: config.url.clone(),
            worker_id: config.worker_id.clone(),
            max_consecutive_failures: config.max_consecutive_failures,
            reconnect_schedule: config
                .reconnect_schedule_secs
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect(),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            outbound_queue: config.outbound_queue,
        }
    }
}

/// Receives decoded inbound messages. Must not block: long work is spawned.
pub trait InboundHandler: Send + Sync {
    fn handle(&self, message: InboundMessage);
}

/// Cloneable sending side of a session.
#[derive(Clone)]
pub struct SessionHandle {
    state: SharedSessionState,
    outbound: mpsc::Sender<OutboundMessage>,
}

impl SessionHandle {
    /// Enqueue `message`. Rejected unless the session is `Connected`.
    pub fn send(&self, message: OutboundMessage) -> Result<(), SessionError> {
        let state = self.state.connection_state();
        if state != ConnectionState::Connected {
            return Err(SessionError::NotConnected(state));
        }
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(message) => SessionError::QueueFull(message.kind()),
            mpsc::error::TrySendError::Closed(_) => SessionError::QueueClosed,
        })
    }

    pub fn state(&self) -> &SharedSessionState {
        &self.state
    }
}

impl ProgressSink for SessionHandle {
    fn report(&self, message: OutboundMessage) {
        let kind = message.kind();
        if let Err(e) = self.send(message) {
            warn!(kind = kind, error = %e, "Dropping outbound message");
        }
    }
}

enum ServeEnd {
    Shutdown,
    Lost(DisconnectReason),
}

pub struct WorkerSession {
    settings: SessionSettings,
    transport: Arc<dyn Transport>,
    state: SharedSessionState,
    metrics: WorkerMetrics,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: AsyncMutex<mpsc::Receiver<OutboundMessage>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerSession {
    pub fn new(
        settings: SessionSettings,
        transport: Arc<dyn Transport>,
        state: SharedSessionState,
        metrics: WorkerMetrics,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(settings.outbound_queue.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            settings,
            transport,
            state,
            metrics,
            outbound_tx,
            outbound_rx: AsyncMutex::new(outbound_rx),
            shutdown,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            state: self.state.clone(),
            outbound: self.outbound_tx.clone(),
        }
    }

    pub fn state(&self) -> &SharedSessionState {
        &self.state
    }

    /// Ask the run loop to close the connection with a normal reason and exit.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    /// Drive the session until `close()` or until reconnection is abandoned.
    pub async fn run(&self, handler: Arc<dyn InboundHandler>) -> Result<(), SessionError> {
        let mut outbound = self.outbound_rx.lock().await;
        let mut shutdown = self.shutdown.subscribe();
        info!(
            worker_id = %self.settings.worker_id,
            url = %self.settings.url,
            "Worker session starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let Some(mut conn) = self.connect(&mut shutdown).await? else {
                break;
            };
            match self
                .serve(conn.as_mut(), &mut outbound, handler.as_ref(), &mut shutdown)
                .await
            {
                ServeEnd::Shutdown => {
                    self.state.update(|s| s.begin_close());
                    conn.close().await;
                    self.disconnected(DisconnectReason::Normal, &mut outbound);
                    break;
                }
                ServeEnd::Lost(reason) => {
                    warn!(reason = reason.as_str(), "Connection lost, reconnecting");
                    self.disconnected(reason, &mut outbound);
                }
            }
        }

        info!(worker_id = %self.settings.worker_id, "Worker session stopped");
        Ok(())
    }

    /// Establish a connection, backing off between failures.
    ///
    /// Returns `Ok(None)` when shutdown was requested while waiting, and
    /// `ReconnectExhausted` once the consecutive failure bound is reached.
    async fn connect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Box<dyn Connection>>, SessionError> {
        let backoff = RetryPolicy::new(
            self.settings.max_consecutive_failures,
            self.settings.reconnect_schedule.clone(),
        );
        loop {
            if !self.state.update(|s| s.begin_connect()) {
                let failures = self.state.snapshot().consecutive_failures;
                return Err(SessionError::ReconnectExhausted(failures));
            }
            let attempt = self.state.snapshot().reconnect_attempts;
            debug!(attempt = attempt, url = %self.settings.url, "Connecting");

            let err = match self.transport.connect(&self.settings.url).await {
                Ok(conn) => {
                    self.state.update(|s| s.mark_connected());
                    self.metrics.connection();
                    if attempt > 1 {
                        self.metrics.reconnect_attempt(ReconnectOutcome::Success);
                    }
                    info!(attempt = attempt, "Worker session connected");
                    return Ok(Some(conn));
                }
                Err(err) => err,
            };

            let reason = match err {
                SessionError::ConnectTimeout(_) => DisconnectReason::Timeout,
                _ => DisconnectReason::Error,
            };
            let failures = self.state.update(|s| {
                s.mark_connect_failed(reason);
                s.consecutive_failures
            });
            self.metrics.reconnect_attempt(ReconnectOutcome::Failure);
            self.metrics
                .error("connect", err.transient_kind().is_some());

            if failures >= self.settings.max_consecutive_failures {
                self.state.update(|s| s.give_up());
                self.metrics.reconnect_attempt(ReconnectOutcome::Abandoned);
                error!(
                    failures = failures,
                    error = %err,
                    "Reconnection abandoned, session is unhealthy"
                );
                return Err(SessionError::ReconnectExhausted(failures));
            }

            let delay = backoff.delay_for(failures.saturating_sub(1));
            warn!(
                failures = failures,
                max = self.settings.max_consecutive_failures,
                delay_secs = delay.as_secs_f64(),
                error = %err,
                "Connect failed, backing off"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return Ok(None),
            }
        }
    }

    async fn serve(
        &self,
        conn: &mut dyn Connection,
        outbound: &mut mpsc::Receiver<OutboundMessage>,
        handler: &dyn InboundHandler,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ServeEnd {
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => return ServeEnd::Shutdown,
                event = conn.recv() => match event {
                    TransportEvent::Text(text) => {
                        self.state.touch_heartbeat();
                        self.receive(&text, handler);
                    }
                    TransportEvent::Heartbeat => self.state.touch_heartbeat(),
                    TransportEvent::Closed(reason) => return ServeEnd::Lost(reason),
                },
                Some(message) = outbound.recv() => {
                    if let Err(e) = self.transmit(conn, &message).await {
                        warn!(kind = message.kind(), error = %e, "Send failed");
                        return ServeEnd::Lost(DisconnectReason::Error);
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.transmit(conn, &OutboundMessage::heartbeat_ack()).await {
                        warn!(error = %e, "Heartbeat send failed");
                        return ServeEnd::Lost(DisconnectReason::Error);
                    }
                }
            }
        }
    }

    async fn transmit(
        &self,
        conn: &mut dyn Connection,
        message: &OutboundMessage,
    ) -> Result<(), SessionError> {
        let text = message.encode()?;
        conn.send_text(text).await?;
        self.metrics.message(Direction::Outbound, message.kind());
        Ok(())
    }

    /// Decode and dispatch one inbound frame. Bad frames are logged and dropped.
    pub fn receive(&self, text: &str, handler: &dyn InboundHandler) {
        let started = Instant::now();
        match decode_inbound(text) {
            Ok(Decoded::Message(message)) => {
                let kind = message.kind();
                self.metrics.message(Direction::Inbound, kind);
                debug!(kind = kind, "Inbound message");
                handler.handle(message);
                self.metrics.message_processing(kind, started.elapsed());
            }
            Ok(Decoded::Unknown { kind }) => {
                warn!(kind = %kind, "Unrecognized message type, dropping");
                self.metrics.message(Direction::Inbound, "unknown");
            }
            Err(e) => {
                warn!(error = %e, "Malformed inbound frame, dropping");
                self.metrics.error("protocol", false);
            }
        }
    }

    fn disconnected(&self, reason: DisconnectReason, outbound: &mut mpsc::Receiver<OutboundMessage>) {
        self.state.update(|s| s.mark_disconnected(reason));
        self.metrics.disconnection(reason);
        let mut discarded = 0usize;
        while outbound.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!(discarded = discarded, "Discarded undelivered outbound messages");
        }
    }
}
