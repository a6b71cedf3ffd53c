use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::inflight::InflightRequests;
use super::sender::{request, SocketSender};
use crate::config::Timeouts;
use crate::protocol::{ClientMessageBody, ServerMessageKind};

/// Idle-ping schedule plus the inbound-message clock the unsupervised
/// background check reads.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    ping_frequency: Duration,
    server_request_socket_timeout: Duration,
    ping_at: Option<Instant>,
    message_last_received: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(timeouts: &Timeouts) -> Self {
        Self {
            ping_frequency: timeouts.ping_frequency(),
            server_request_socket_timeout: timeouts.server_request_socket_timeout(),
            ping_at: None,
            message_last_received: None,
        }
    }

    /// Records inbound traffic and pushes the next ping out.
    pub fn message_received(&mut self, now: Instant) {
        self.message_last_received = Some(now);
        self.ping_at = Some(now + self.ping_frequency);
    }

    /// Starts the idle timer without counting as inbound traffic.
    pub fn reset(&mut self, now: Instant) {
        self.ping_at = Some(now + self.ping_frequency);
    }

    pub fn stop(&mut self) {
        self.ping_at = None;
    }

    pub fn ping_deadline(&self) -> Option<Instant> {
        self.ping_at
    }

    /// Consumes the deadline if it has passed.
    pub fn take_due_ping(&mut self, now: Instant) -> bool {
        match self.ping_at {
            Some(at) if at <= now => {
                self.ping_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn message_last_received(&self) -> Option<Instant> {
        self.message_last_received
    }

    /// A message has arrived at some point but none within the server
    /// request timeout.
    pub fn is_silent(&self, now: Instant) -> bool {
        self.message_last_received
            .is_some_and(|at| at + self.server_request_socket_timeout < now)
    }
}

/// Sends a PING and waits for the PONG. Failures are only logged; a
/// timeout already tears the socket down through the tracker.
pub async fn send_ping(keyserver_id: &str, sender: SocketSender, inflight: InflightRequests) {
    match request(&sender, &inflight, ClientMessageBody::Ping, ServerMessageKind::Pong).await {
        Ok(_) => debug!(keyserver_id, "Received pong"),
        Err(e) => debug!(keyserver_id, "Ping failed: {}", e),
    }
}

#[cfg(test)]
#[path = "tests/heartbeat_tests.rs"]
mod tests;
