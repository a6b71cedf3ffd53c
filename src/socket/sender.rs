use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::inflight::InflightRequests;
use crate::error::SocketError;
use crate::protocol::{ClientMessageBody, ClientSocketMessage, ServerMessageKind, ServerSocketMessage};
use crate::transport::Transport;

/// Writes client messages to one socket. Ids come from a counter shared
/// across every socket the manager opens, so they never repeat.
#[derive(Clone)]
pub struct SocketSender {
    keyserver_id: Arc<str>,
    transport: Arc<dyn Transport>,
    next_id: Arc<AtomicU64>,
}

impl SocketSender {
    pub fn new(
        keyserver_id: Arc<str>,
        transport: Arc<dyn Transport>,
        next_id: Arc<AtomicU64>,
    ) -> Self {
        Self {
            keyserver_id,
            transport,
            next_id,
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn send_with_id(&self, message: &ClientSocketMessage) -> Result<(), SocketError> {
        let text = serde_json::to_string(message)
            .map_err(|e| SocketError::MalformedMessage(e.to_string()))?;
        debug!(
            keyserver_id = %self.keyserver_id,
            message_id = message.id(),
            "Sending client message"
        );
        self.transport.send(text)
    }

    /// Assigns the next id and sends. Returns the id used.
    pub fn send(&self, body: ClientMessageBody) -> Result<u64, SocketError> {
        let id = self.next_id();
        self.send_with_id(&body.with_id(id))?;
        Ok(id)
    }
}

/// Sends `body` and waits for the reply of kind `expected`.
pub async fn request(
    sender: &SocketSender,
    inflight: &InflightRequests,
    body: ClientMessageBody,
    expected: ServerMessageKind,
) -> Result<ServerSocketMessage, SocketError> {
    let id = sender.next_id();
    let pending = inflight.register(id, expected);
    sender.send_with_id(&body.with_id(id))?;
    pending.wait().await
}
