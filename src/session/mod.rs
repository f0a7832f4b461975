//! Worker session interface (WSI): the control channel to the orchestrator.

pub mod client;
pub mod protocol;
pub mod state;
pub mod transport;

pub use client::{InboundHandler, SessionHandle, SessionSettings, WorkerSession};
pub use protocol::{decode_inbound, CommandAction, Decoded, InboundMessage, LogLevel, OutboundMessage};
pub use state::{ConnectionState, DisconnectReason, SessionState, SharedSessionState};
pub use transport::{
    ChannelPeer, ChannelTransport, Connection, Transport, TransportEvent, WebSocketTransport,
};
