//! In-process transport backed by tokio channels.
//!
//! Every `open()` hands the peer side to whoever holds the receiver returned
//! by [`ChannelTransportFactory::new`], which lets tests and embedders play
//! the keyserver.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::{OpenedTransport, ReadyState, Transport, TransportEvent, TransportFactory};
use crate::error::SocketError;
use crate::protocol::ClientSocketMessage;

type SharedState = Arc<Mutex<ReadyState>>;

fn read_state(state: &SharedState) -> ReadyState {
    *state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn set_state(state: &SharedState, next: ReadyState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

struct ChannelTransport {
    state: SharedState,
    to_server: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Transport for ChannelTransport {
    fn send(&self, text: String) -> Result<(), SocketError> {
        if read_state(&self.state) != ReadyState::Open {
            return Err(SocketError::TransportOffline(
                "channel transport is not open".to_string(),
            ));
        }
        self.to_server
            .send(text)
            .map_err(|_| SocketError::TransportOffline("server end dropped".to_string()))
    }

    fn close(&self) {
        if read_state(&self.state) == ReadyState::Closed {
            return;
        }
        set_state(&self.state, ReadyState::Closed);
        let _ = self.events.send(TransportEvent::Close);
    }

    fn ready_state(&self) -> ReadyState {
        read_state(&self.state)
    }
}

/// Keyserver side of one channel connection.
pub struct ServerEnd {
    state: SharedState,
    from_client: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl ServerEnd {
    /// Completes the connection, as a successful socket handshake would.
    pub fn accept(&self) {
        set_state(&self.state, ReadyState::Open);
        let _ = self.events.send(TransportEvent::Open);
    }

    pub fn send_raw(&self, text: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Message(text.into()));
    }

    pub fn send_json<T: Serialize>(&self, message: &T) {
        match serde_json::to_string(message) {
            Ok(text) => self.send_raw(text),
            Err(e) => debug!("Dropping unserializable server message: {}", e),
        }
    }

    /// Next frame from the client, or `None` once the client side is gone.
    pub async fn recv_raw(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next frame from the client that decodes as a client message.
    pub async fn recv_client_message(&mut self) -> Option<ClientSocketMessage> {
        while let Some(text) = self.from_client.recv().await {
            match serde_json::from_str(&text) {
                Ok(message) => return Some(message),
                Err(e) => debug!("Ignoring undecodable client frame: {}", e),
            }
        }
        None
    }

    /// Drops the connection from the server side.
    pub fn close(&self) {
        set_state(&self.state, ReadyState::Closed);
        let _ = self.events.send(TransportEvent::Close);
    }

    pub fn ready_state(&self) -> ReadyState {
        read_state(&self.state)
    }
}

pub struct ChannelTransportFactory {
    connections: mpsc::UnboundedSender<ServerEnd>,
}

impl ChannelTransportFactory {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
        let (connections, rx) = mpsc::unbounded_channel();
        (Self { connections }, rx)
    }
}

impl TransportFactory for ChannelTransportFactory {
    fn open(&self) -> OpenedTransport {
        let state = Arc::new(Mutex::new(ReadyState::Connecting));
        let (to_server, from_client) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let server_end = ServerEnd {
            state: state.clone(),
            from_client,
            events: events_tx.clone(),
        };
        if self.connections.send(server_end).is_err() {
            debug!("No listener for channel connections; the transport will never open");
        }

        OpenedTransport {
            transport: Arc::new(ChannelTransport {
                state,
                to_server,
                events: events_tx,
            }),
            events: events_rx,
        }
    }

    fn describe(&self) -> String {
        "channel".to_string()
    }
}
