//! The INITIAL / STATE_SYNC / ACK_UPDATES handshake and its retry policy.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::context::ClientContext;
use super::inflight::InflightRequests;
use super::sender::SocketSender;
use crate::error::{SocketError, NOT_LOGGED_IN, UNKNOWN_ERROR};
use crate::keyserver::{
    Action, ConnectionIssue, ConnectionStatus, KeyserverInfo, KeyserverStoreHandle,
};
use crate::protocol::{
    AckUpdatesPayload, ActivityUpdate, ClientMessageBody, ClientResponse, InitialPayload,
    PlatformDetails, PreRequestUserState, ServerMessageKind, ServerSocketMessage, SessionChange,
    SessionIdentification, SessionState, StateSyncPayload,
};

/// An INITIAL payload plus what it reported, so the caller can commit the
/// reports once the server acknowledges them.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialMessage {
    pub payload: InitialPayload,
    pub flushed_activity_updates: Vec<ActivityUpdate>,
    pub sent_platform_details: Option<PlatformDetails>,
}

pub fn compose_initial_message(
    keyserver_id: &str,
    home_keyserver_id: &str,
    info: &KeyserverInfo,
    context: &dyn ClientContext,
) -> InitialMessage {
    let platform_details = context.platform_details();
    let sent_platform_details = (info.last_communicated_platform_details.as_ref()
        != Some(&platform_details))
    .then_some(platform_details);
    let flushed_activity_updates = info.connection.queued_activity_updates.clone();

    let mut client_responses = Vec::new();
    if let Some(details) = &sent_platform_details {
        client_responses.push(ClientResponse::PlatformDetails(details.clone()));
    }
    if !flushed_activity_updates.is_empty() {
        client_responses.push(ClientResponse::InitialActivityUpdates(
            flushed_activity_updates.clone(),
        ));
    }

    let calendar_query = context
        .calendar_query()
        .map(|query| query.for_keyserver(keyserver_id, home_keyserver_id))
        .unwrap_or_else(|| info.actualized_calendar_query.clone());

    InitialMessage {
        payload: InitialPayload {
            session_identification: SessionIdentification {
                cookie: info.cookie.clone(),
                session_id: context.session_id(keyserver_id),
            },
            session_state: SessionState {
                calendar_query,
                messages_current_as_of: context.messages_current_as_of(keyserver_id),
                updates_current_as_of: info.updates_current_as_of,
                watched_ids: context.watched_ids(),
            },
            client_responses,
        },
        flushed_activity_updates,
        sent_platform_details,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub kind: SyncKind,
    pub checkpoint: i64,
}

/// What the handshake task needs; all of it is cheap to clone.
#[derive(Clone)]
pub struct Handshake {
    pub keyserver_id: String,
    pub store: KeyserverStoreHandle,
    pub context: Arc<dyn ClientContext>,
    pub sender: SocketSender,
    pub inflight: InflightRequests,
}

impl Handshake {
    /// Sends INITIAL, applies the resulting sync, and acknowledges the
    /// checkpoint. The caller marks the socket connected on success.
    pub async fn run(&self) -> Result<HandshakeOutcome, SocketError> {
        let info = self
            .store
            .keyserver_info(&self.keyserver_id)
            .ok_or_else(|| SocketError::UnknownKeyserver(self.keyserver_id.clone()))?;
        let initial = compose_initial_message(
            &self.keyserver_id,
            self.store.home_keyserver_id(),
            &info,
            self.context.as_ref(),
        );
        let pre_request_user_state = PreRequestUserState {
            current_user_info: self.context.current_user_info(),
            cookie: info.cookie.clone(),
            session_id: self.context.session_id(&self.keyserver_id),
        };

        let message_id = self.sender.next_id();
        let activity_pending = (!initial.flushed_activity_updates.is_empty())
            .then(|| {
                self.inflight
                    .register(message_id, ServerMessageKind::ActivityUpdateResponse)
            });
        let sync_pending = self.inflight.register(message_id, ServerMessageKind::StateSync);
        self.sender
            .send_with_id(&ClientMessageBody::Initial(initial.payload).with_id(message_id))?;
        debug!(
            keyserver_id = %self.keyserver_id,
            message_id,
            activity_updates = initial.flushed_activity_updates.len(),
            "Sent initial message"
        );

        let activity = async {
            match activity_pending {
                Some(pending) => pending.wait().await.map(Some),
                None => Ok(None),
            }
        };
        let (activity_response, sync_response) =
            futures::try_join!(activity, sync_pending.wait())?;

        if let Some(platform_details) = initial.sent_platform_details {
            self.store.dispatch(Action::UpdateLastCommunicatedPlatformDetails {
                keyserver_id: self.keyserver_id.clone(),
                platform_details,
            });
        }
        if let Some(ServerSocketMessage::ActivityUpdateResponse { payload, .. }) = activity_response
        {
            self.store.dispatch(Action::UpdateActivitySuccess {
                activity_updates: BTreeMap::from([(
                    self.keyserver_id.clone(),
                    initial.flushed_activity_updates,
                )]),
                result: payload,
            });
        }

        let ServerSocketMessage::StateSync { payload, .. } = sync_response else {
            return Err(SocketError::MalformedMessage(
                "expected a state sync reply".to_string(),
            ));
        };
        let outcome = self.apply_state_sync(payload, pre_request_user_state);

        // Fire and forget; a dead transport surfaces through its close event.
        if let Err(e) = self.sender.send(ClientMessageBody::AckUpdates(AckUpdatesPayload {
            current_as_of: outcome.checkpoint,
        })) {
            warn!(keyserver_id = %self.keyserver_id, "Failed to acknowledge updates: {}", e);
        }
        info!(
            keyserver_id = %self.keyserver_id,
            kind = ?outcome.kind,
            checkpoint = outcome.checkpoint,
            "State sync complete"
        );
        Ok(outcome)
    }

    fn apply_state_sync(
        &self,
        payload: StateSyncPayload,
        pre_request_user_state: PreRequestUserState,
    ) -> HandshakeOutcome {
        let checkpoint = payload.checkpoint();
        match payload {
            StateSyncPayload::Full(full) => {
                let session_id = full.session_id.clone();
                self.store.dispatch(Action::FullStateSync {
                    keyserver_id: self.keyserver_id.clone(),
                    payload: full,
                });
                if let Some(session_id) = session_id {
                    self.store.dispatch(Action::SetNewSession {
                        keyserver_id: self.keyserver_id.clone(),
                        session_change: SessionChange {
                            cookie_invalidated: false,
                            cookie: None,
                            current_user_info: None,
                            session_id: Some(session_id),
                        },
                        pre_request_user_state: Some(pre_request_user_state),
                        error: None,
                        source: None,
                    });
                }
                HandshakeOutcome {
                    kind: SyncKind::Full,
                    checkpoint,
                }
            }
            StateSyncPayload::Incremental(incremental) => {
                self.store.dispatch(Action::IncrementalStateSync {
                    keyserver_id: self.keyserver_id.clone(),
                    payload: incremental,
                });
                HandshakeOutcome {
                    kind: SyncKind::Incremental,
                    checkpoint,
                }
            }
        }
    }
}

/// What to do after a failed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStep {
    /// The socket is going away anyway; its close drives the reconnect.
    Ignore,
    Retry,
    SetIssue(ConnectionIssue),
    CloseSocket,
}

pub fn next_step(error: &SocketError, status: ConnectionStatus, retries_left: u32) -> FailureStep {
    if error.is_connectivity() || !status.is_opening() {
        return FailureStep::Ignore;
    }
    let not_logged_in =
        matches!(error, SocketError::AuthInvalidation) || error.server_code() == Some(NOT_LOGGED_IN);
    let gives_up = not_logged_in
        || retries_left == 0
        || error
            .server_code()
            .is_some_and(|code| code != UNKNOWN_ERROR);
    if !gives_up {
        return FailureStep::Retry;
    }
    if not_logged_in {
        FailureStep::SetIssue(ConnectionIssue::NotLoggedInError)
    } else {
        FailureStep::CloseSocket
    }
}

/// Counts consecutive handshake failures right after policy acknowledgment.
#[derive(Debug)]
pub struct PolicyFailureCounter {
    threshold: u32,
    failures: u32,
}

impl PolicyFailureCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            failures: 0,
        }
    }

    /// Records a failure; true when crash-loop recovery should run. The
    /// count keeps tripping until `reset`.
    pub fn record_failure(&mut self, no_data_after_policy_acknowledgment: bool) -> bool {
        if !no_data_after_policy_acknowledgment {
            self.failures = 0;
            return false;
        }
        self.failures = self.failures.saturating_add(1);
        self.failures >= self.threshold
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
#[path = "tests/state_sync_tests.rs"]
mod tests;
