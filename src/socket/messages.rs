//! Inbound message routing and the request helpers it spawns.

use std::collections::BTreeMap;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::handle::ConnectionEvent;
use super::inflight::InflightRequests;
use super::manager::{ConnectionManager, Internal};
use super::recovery::SessionRecoveryCoordinator;
use super::sender::{request, SocketSender};
use crate::error::{SocketError, POLICIES_NOT_ACCEPTED};
use crate::keyserver::{Action, ConnectionStatus};
use crate::protocol::{
    parse_server_message, AckUpdatesPayload, ActivityUpdate, ActivityUpdateResult,
    ApiRequestPayload, ClientMessageBody, ResponsesPayload, ServerMessageKind, ServerRequest,
    ServerSocketMessage, SessionChange, UpdatesPayload,
};

/// Endpoint that commits activity updates outside the handshake.
pub const UPDATE_ACTIVITY_ENDPOINT: &str = "update_activity";

impl ConnectionManager {
    pub(super) fn receive_message(&mut self, raw: &str) {
        let message = match parse_server_message(raw, self.deps.decompressor.as_ref()) {
            Ok(message) => message,
            Err(e) => {
                warn!(keyserver_id = %self.keyserver_id, "Dropping server message: {}", e);
                return;
            }
        };
        let Some(inflight) = self.socket.as_ref().map(|socket| socket.inflight.clone()) else {
            return;
        };
        debug!(
            keyserver_id = %self.keyserver_id,
            kind = %message.kind(),
            response_to = ?message.response_to(),
            "Received server message"
        );

        self.policy_failures.reset();
        self.heartbeat.message_received(Instant::now());
        inflight.resolve_requests_for_message(&message);
        if self.status().is_closing() {
            self.finish_closing_socket(message.response_to());
        }
        self.emit(ConnectionEvent::Message {
            keyserver_id: self.keyserver_id.clone(),
            message: message.clone(),
        });

        match message {
            ServerSocketMessage::Updates { payload } => self.process_updates(payload),
            ServerSocketMessage::Messages { payload } => self.dispatch(Action::ProcessMessages {
                keyserver_id: self.keyserver_id.clone(),
                payload,
            }),
            ServerSocketMessage::Requests { payload, .. } => {
                self.respond_to_requests(payload.server_requests)
            }
            ServerSocketMessage::Error {
                message: code,
                payload,
                ..
            } => {
                warn!(keyserver_id = %self.keyserver_id, code = %code, payload = ?payload, "Server reported an error");
                if code == POLICIES_NOT_ACCEPTED && self.active {
                    self.dispatch(Action::ForcePolicyAcknowledgment {
                        keyserver_id: self.keyserver_id.clone(),
                    });
                }
            }
            ServerSocketMessage::AuthError { session_change, .. } => {
                self.start_session_recovery(session_change)
            }
            _ => {}
        }
    }

    fn connected_socket(&self) -> Option<(SocketSender, InflightRequests)> {
        if self.status() != ConnectionStatus::Connected {
            return None;
        }
        self.socket
            .as_ref()
            .map(|socket| (socket.sender.clone(), socket.inflight.clone()))
    }

    fn process_updates(&mut self, payload: UpdatesPayload) {
        let current_as_of = payload.updates_result.current_as_of;
        self.dispatch(Action::ProcessUpdates {
            keyserver_id: self.keyserver_id.clone(),
            payload,
        });
        if let Some((sender, _)) = self.connected_socket() {
            if let Err(e) = sender.send(ClientMessageBody::AckUpdates(AckUpdatesPayload {
                current_as_of,
            })) {
                warn!(keyserver_id = %self.keyserver_id, "Failed to acknowledge updates: {}", e);
            }
        }
    }

    fn respond_to_requests(&self, requests: Vec<ServerRequest>) {
        if requests.is_empty() {
            return;
        }
        let Some(socket) = &self.socket else {
            return;
        };
        let sender = socket.sender.clone();
        let inflight = socket.inflight.clone();
        let responder = self.deps.responder.clone();
        let keyserver_id = self.keyserver_id.clone();
        tokio::spawn(async move {
            let client_responses = responder.respond(&keyserver_id, &requests).await;
            if client_responses.is_empty() {
                return;
            }
            let body = ClientMessageBody::Responses(ResponsesPayload { client_responses });
            if let Err(e) = request(&sender, &inflight, body, ServerMessageKind::Requests).await {
                debug!(keyserver_id = %keyserver_id, "Responses were not acknowledged: {}", e);
            }
        });
    }

    fn start_session_recovery(&mut self, session_change: SessionChange) {
        if self.recovery_in_progress {
            debug!(keyserver_id = %self.keyserver_id, "Session recovery already in progress");
            return;
        }
        self.recovery_in_progress = true;
        let coordinator = SessionRecoveryCoordinator::new(
            self.keyserver_id.clone(),
            self.store.clone(),
            self.deps.session_recovery.clone(),
            self.deps.notifications_crypto.clone(),
        );
        let pre_request_user_state = self.initialized_with_user_state.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let outcome = coordinator
                .handle_auth_error(session_change, pre_request_user_state)
                .await;
            let _ = internal.send(Internal::RecoveryFinished { outcome });
        });
    }

    pub(super) fn start_api_request(
        &self,
        endpoint: String,
        input: Value,
        reply: oneshot::Sender<Result<Value, SocketError>>,
    ) {
        let Some((sender, inflight)) = self.connected_socket() else {
            let _ = reply.send(Err(SocketError::TransportOffline(
                "socket is not connected".to_string(),
            )));
            return;
        };
        tokio::spawn(async move {
            let _ = reply.send(api_request(&sender, &inflight, endpoint, input).await);
        });
    }

    pub(super) fn start_activity_update(
        &self,
        updates: Vec<ActivityUpdate>,
        reply: oneshot::Sender<Result<(), SocketError>>,
    ) {
        self.dispatch(Action::QueueActivityUpdates {
            keyserver_id: self.keyserver_id.clone(),
            activity_updates: updates.clone(),
        });
        let Some((sender, inflight)) = self.connected_socket() else {
            // Flushed with the next INITIAL.
            let _ = reply.send(Ok(()));
            return;
        };
        let input = match serde_json::to_value(&updates) {
            Ok(updates) => Value::Object([("updates".to_string(), updates)].into_iter().collect()),
            Err(e) => {
                let _ = reply.send(Err(SocketError::MalformedMessage(e.to_string())));
                return;
            }
        };
        let keyserver_id = self.keyserver_id.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            let outcome = api_request(&sender, &inflight, UPDATE_ACTIVITY_ENDPOINT.to_string(), input)
                .await
                .map(|payload| {
                    let result: ActivityUpdateResult =
                        serde_json::from_value(payload).unwrap_or_else(|e| {
                            debug!(keyserver_id = %keyserver_id, "Unexpected activity update reply: {}", e);
                            ActivityUpdateResult::default()
                        });
                    store.dispatch(Action::UpdateActivitySuccess {
                        activity_updates: BTreeMap::from([(keyserver_id.clone(), updates)]),
                        result,
                    });
                });
            let _ = reply.send(outcome);
        });
    }
}

async fn api_request(
    sender: &SocketSender,
    inflight: &InflightRequests,
    endpoint: String,
    input: Value,
) -> Result<Value, SocketError> {
    let body = ClientMessageBody::ApiRequest(ApiRequestPayload { endpoint, input });
    match request(sender, inflight, body, ServerMessageKind::ApiResponse).await? {
        ServerSocketMessage::ApiResponse { payload, .. } => Ok(payload),
        other => Err(SocketError::MalformedMessage(format!(
            "expected API_RESPONSE, got {}",
            other.kind()
        ))),
    }
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
