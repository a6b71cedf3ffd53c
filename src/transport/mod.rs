//! Duplex message transports the connection manager can drive.

mod channel;
mod websocket;

pub use channel::{ChannelTransportFactory, ServerEnd};
pub use websocket::WebSocketTransportFactory;

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::SocketError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Close,
}

/// One connection attempt. Closing is fire-and-forget; completion is
/// reported as [`TransportEvent::Close`].
pub trait Transport: Send + Sync {
    fn send(&self, text: String) -> Result<(), SocketError>;
    fn close(&self);
    fn ready_state(&self) -> ReadyState;
}

pub struct OpenedTransport {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens a fresh transport to one keyserver. Must be called inside a tokio
/// runtime.
pub trait TransportFactory: Send + Sync {
    fn open(&self) -> OpenedTransport;

    /// Endpoint description for logs.
    fn describe(&self) -> String;
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
