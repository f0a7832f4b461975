//! Physical transport under the worker session.
//!
//! The session only sees text frames, liveness signals, and a close event.
//! [`WebSocketTransport`] is the production implementation; [`ChannelTransport`]
//! is an in-process pair used by tests and local tooling.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::SessionError;
use crate::session::state::DisconnectReason;

/// What a connection yields to the session loop.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Text(String),
    /// Transport-level liveness (ping/pong) with no payload for the session.
    Heartbeat,
    Closed(DisconnectReason),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, SessionError>;
}

#[async_trait]
pub trait Connection: Send {
    async fn send_text(&mut self, text: String) -> Result<(), SessionError>;

    /// Next event. Must be cancel-safe: the session polls it inside `select!`.
    async fn recv(&mut self) -> TransportEvent;

    async fn close(&mut self);
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, SessionError> {
        let connecting = tokio_tungstenite::connect_async(url);
        let (stream, response) = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| SessionError::ConnectTimeout(self.connect_timeout))?
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        debug!(url = %url, status = %response.status(), "WebSocket handshake complete");
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn send_text(&mut self, text: String) -> Result<(), SessionError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> TransportEvent {
        match self.stream.next().await {
            Some(Ok(Message::Text(text))) => TransportEvent::Text(text),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => TransportEvent::Text(text),
                Err(_) => TransportEvent::Heartbeat,
            },
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => TransportEvent::Heartbeat,
            Some(Ok(Message::Frame(_))) => TransportEvent::Heartbeat,
            Some(Ok(Message::Close(frame))) => {
                let reason = match frame {
                    Some(frame) if frame.code != CloseCode::Normal => DisconnectReason::Error,
                    _ => DisconnectReason::Normal,
                };
                TransportEvent::Closed(reason)
            }
            Some(Err(e)) => {
                debug!(error = %e, "WebSocket read failed");
                TransportEvent::Closed(DisconnectReason::Error)
            }
            None => TransportEvent::Closed(DisconnectReason::Error),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "WebSocket close handshake failed");
        }
    }
}

/// Orchestrator side of one [`ChannelTransport`] connection.
pub struct ChannelPeer {
    to_worker: mpsc::UnboundedSender<TransportEvent>,
    from_worker: mpsc::UnboundedReceiver<String>,
}

impl ChannelPeer {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_worker.send(TransportEvent::Text(text.into())).is_ok()
    }

    pub fn ping(&self) -> bool {
        self.to_worker.send(TransportEvent::Heartbeat).is_ok()
    }

    pub fn close(&self, reason: DisconnectReason) -> bool {
        self.to_worker.send(TransportEvent::Closed(reason)).is_ok()
    }

    /// Next frame sent by the worker; `None` once the worker side is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_worker.recv().await
    }
}

#[derive(Default)]
struct ChannelPlan {
    refusals: VecDeque<bool>,
    refuse_all: bool,
    attempts: u32,
}

/// In-process transport. Each accepted connection hands a [`ChannelPeer`] to
/// whoever holds the peer receiver.
#[derive(Clone)]
pub struct ChannelTransport {
    plan: Arc<Mutex<ChannelPlan>>,
    peers: mpsc::UnboundedSender<ChannelPeer>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelPeer>) {
        let (peers, accepted) = mpsc::unbounded_channel();
        let transport = Self {
            plan: Arc::new(Mutex::new(ChannelPlan::default())),
            peers,
        };
        (transport, accepted)
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: usize) {
        let mut plan = self.plan.lock();
        plan.refusals.extend(std::iter::repeat(true).take(count));
    }

    pub fn refuse_all(&self, refuse: bool) {
        self.plan.lock().refuse_all = refuse;
    }

    pub fn attempts(&self) -> u32 {
        self.plan.lock().attempts
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>, SessionError> {
        let refused = {
            let mut plan = self.plan.lock();
            plan.attempts += 1;
            let scripted = plan.refusals.pop_front().unwrap_or(false);
            plan.refuse_all || scripted
        };
        if refused {
            return Err(SessionError::Transport(format!("connection refused: {url}")));
        }

        let (to_worker, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_worker) = mpsc::unbounded_channel();
        self.peers
            .send(ChannelPeer {
                to_worker,
                from_worker,
            })
            .map_err(|_| SessionError::Transport("no peer listening".to_string()))?;
        Ok(Box::new(ChannelConnection {
            incoming,
            outgoing: Some(outgoing),
        }))
    }
}

struct ChannelConnection {
    incoming: mpsc::UnboundedReceiver<TransportEvent>,
    outgoing: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl Connection for ChannelConnection {
    async fn send_text(&mut self, text: String) -> Result<(), SessionError> {
        let Some(outgoing) = &self.outgoing else {
            return Err(SessionError::Transport("connection closed".to_string()));
        };
        outgoing
            .send(text)
            .map_err(|_| SessionError::Transport("peer hung up".to_string()))
    }

    async fn recv(&mut self) -> TransportEvent {
        self.incoming
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed(DisconnectReason::Error))
    }

    async fn close(&mut self) {
        self.outgoing = None;
        self.incoming.close();
    }
}
