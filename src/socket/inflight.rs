//! Tracks client requests awaiting a server reply on one socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

use crate::error::SocketError;
use crate::protocol::{ServerMessageKind, ServerSocketMessage};

type Completion = oneshot::Sender<Result<ServerSocketMessage, SocketError>>;

/// Timer notifications sent back to the connection manager, tagged with
/// the socket generation that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InflightEvent {
    Late {
        generation: u64,
        message_id: u64,
        is_late: bool,
    },
    TimedOut {
        generation: u64,
        expected: ServerMessageKind,
    },
}

struct InflightRequest {
    /// Unique per registration; one message id can carry several awaits.
    token: u64,
    message_id: u64,
    expected: ServerMessageKind,
    created_at: Instant,
    completion: Completion,
}

#[derive(Debug, Clone, Copy)]
pub struct InflightTimeouts {
    pub visual: Duration,
    pub socket: Duration,
}

/// Shared per-socket request table. Clones refer to the same table.
#[derive(Clone)]
pub struct InflightRequests {
    requests: Arc<Mutex<Vec<InflightRequest>>>,
    next_token: Arc<AtomicU64>,
    generation: u64,
    timeouts: InflightTimeouts,
    events: mpsc::UnboundedSender<InflightEvent>,
}

impl InflightRequests {
    pub fn new(
        generation: u64,
        timeouts: InflightTimeouts,
        events: mpsc::UnboundedSender<InflightEvent>,
    ) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            next_token: Arc::new(AtomicU64::new(0)),
            generation,
            timeouts,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<InflightRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Registers interest in the reply to `message_id`. Register before
    /// sending so a fast reply cannot slip past.
    pub fn register(&self, message_id: u64, expected: ServerMessageKind) -> PendingResponse {
        let (completion, receiver) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.lock().push(InflightRequest {
            token,
            message_id,
            expected,
            created_at: Instant::now(),
            completion,
        });
        PendingResponse {
            requests: self.clone(),
            token,
            message_id,
            expected,
            receiver,
        }
    }

    pub async fn fetch_response(
        &self,
        message_id: u64,
        expected: ServerMessageKind,
    ) -> Result<ServerSocketMessage, SocketError> {
        self.register(message_id, expected).wait().await
    }

    /// Settles every request `message` answers.
    ///
    /// ERROR and AUTH_ERROR replies reject the request they answer. Kinds
    /// that never carry a response id settle every request expecting them.
    pub fn resolve_requests_for_message(&self, message: &ServerSocketMessage) {
        let kind = message.kind();
        let response_to = message.response_to();
        let mut settled = Vec::new();
        {
            let mut requests = self.lock();
            let mut idx = 0;
            while idx < requests.len() {
                let request = &requests[idx];
                let matches = match response_to {
                    Some(id) => request.message_id == id,
                    None => !kind.carries_response_id() && request.expected == kind,
                };
                let outcome = if !matches {
                    None
                } else if let ServerSocketMessage::Error {
                    message: code,
                    payload,
                    ..
                } = message
                {
                    Some(Err(SocketError::ServerError {
                        code: code.clone(),
                        payload: payload.clone(),
                    }))
                } else if kind == ServerMessageKind::AuthError {
                    Some(Err(SocketError::AuthInvalidation))
                } else if kind == request.expected {
                    Some(Ok(message.clone()))
                } else {
                    None
                };
                match outcome {
                    Some(outcome) => settled.push((requests.remove(idx), outcome)),
                    None => idx += 1,
                }
            }
        }
        for (request, outcome) in settled {
            debug!(
                message_id = request.message_id,
                expected = %request.expected,
                elapsed_ms = request.created_at.elapsed().as_millis() as u64,
                ok = outcome.is_ok(),
                "Settled inflight request"
            );
            let _ = request.completion.send(outcome);
        }
    }

    /// True when nothing is pending apart from `except`.
    pub fn all_resolved_except(&self, except: Option<u64>) -> bool {
        self.lock()
            .iter()
            .all(|request| Some(request.message_id) == except)
    }

    pub fn reject_all(&self, error: SocketError) {
        let drained: Vec<InflightRequest> = self.lock().drain(..).collect();
        for request in drained {
            let _ = request.completion.send(Err(error.clone()));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn remove(&self, token: u64) {
        self.lock().retain(|request| request.token != token);
    }

    fn emit(&self, event: InflightEvent) {
        let _ = self.events.send(event);
    }
}

/// The await side of one registered request.
pub struct PendingResponse {
    requests: InflightRequests,
    token: u64,
    message_id: u64,
    expected: ServerMessageKind,
    receiver: oneshot::Receiver<Result<ServerSocketMessage, SocketError>>,
}

impl PendingResponse {
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    /// Waits for the reply. Past the visual timeout the request is reported
    /// late; past the socket timeout every request on the socket is
    /// rejected and the manager is told to tear the socket down.
    pub async fn wait(mut self) -> Result<ServerSocketMessage, SocketError> {
        let timeouts = self.requests.timeouts;
        let generation = self.requests.generation;

        if let Ok(outcome) = tokio::time::timeout(timeouts.visual, &mut self.receiver).await {
            return outcome.unwrap_or_else(|_| Err(SocketError::socket_closed()));
        }

        self.requests.emit(InflightEvent::Late {
            generation,
            message_id: self.message_id,
            is_late: true,
        });
        let remaining = timeouts.socket.saturating_sub(timeouts.visual);
        let outcome = tokio::time::timeout(remaining, &mut self.receiver).await;
        self.requests.emit(InflightEvent::Late {
            generation,
            message_id: self.message_id,
            is_late: false,
        });

        match outcome {
            Ok(outcome) => outcome.unwrap_or_else(|_| Err(SocketError::socket_closed())),
            Err(_) => {
                debug!(
                    message_id = self.message_id,
                    expected = %self.expected,
                    "Inflight request timed out"
                );
                self.requests.remove(self.token);
                self.requests.reject_all(SocketError::Closed(
                    "socket closed due to timeout".to_string(),
                ));
                self.requests.emit(InflightEvent::TimedOut {
                    generation,
                    expected: self.expected,
                });
                Err(SocketError::Timeout {
                    expected: self.expected,
                })
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        // An abandoned await must not hold up teardown.
        self.requests.remove(self.token);
    }
}

#[cfg(test)]
#[path = "tests/inflight_tests.rs"]
mod tests;
