use super::*;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::Timeouts;
use crate::keyserver::KeyserverInfo;
use crate::protocol::{
    ClientResponse, ClientSocketMessage, CurrentUserInfo, ServerSocketMessage, SessionChange,
};
use crate::socket::context::CrashLoopRecovery;
use crate::socket::recovery::{RecoveryRequest, SessionRecovery};
use crate::socket::handle::ConnectionEvent;
use crate::socket::test_support::{
    calendar_query, full_sync, logged_in_store, spawn_manager, spawn_manager_with,
    static_context, test_config, Harness, KEYSERVER_ID, USER_COOKIE,
};
use crate::transport::{ChannelTransportFactory, ServerEnd};

fn activity(thread_id: &str, focus: bool) -> crate::protocol::ActivityUpdate {
    crate::protocol::ActivityUpdate {
        thread_id: thread_id.to_string(),
        focus,
        latest_message: None,
    }
}

struct RecordingRecovery {
    result: Option<SessionChange>,
    requests: Mutex<Vec<RecoveryRequest>>,
}

#[async_trait]
impl SessionRecovery for RecordingRecovery {
    async fn resolve_session_invalidation(
        &self,
        request: RecoveryRequest,
    ) -> Result<Option<SessionChange>, SocketError> {
        self.requests.lock().unwrap().push(request);
        Ok(self.result.clone())
    }
}

/// Never answers, so the session stays untouched while the test runs.
struct StalledRecovery;

#[async_trait]
impl SessionRecovery for StalledRecovery {
    async fn resolve_session_invalidation(
        &self,
        _request: RecoveryRequest,
    ) -> Result<Option<SessionChange>, SocketError> {
        std::future::pending().await
    }
}

struct RecordingCrashLoopRecovery {
    calls: mpsc::UnboundedSender<String>,
    fails: bool,
}

#[async_trait]
impl CrashLoopRecovery for RecordingCrashLoopRecovery {
    async fn recover(&self, keyserver_id: &str) -> Result<(), SocketError> {
        let _ = self.calls.send(keyserver_id.to_string());
        if self.fails {
            return Err(SocketError::TransportOffline("recovery failed".to_string()));
        }
        Ok(())
    }
}

fn unknown_error(response_to: u64) -> ServerSocketMessage {
    ServerSocketMessage::Error {
        response_to: Some(response_to),
        message: crate::error::UNKNOWN_ERROR.to_string(),
        payload: None,
    }
}

/// Drives two failed handshakes right after policy acknowledgment.
async fn trip_crash_loop(fails: bool) -> (Harness, ServerEnd, mpsc::UnboundedReceiver<String>) {
    let (calls, recorded) = mpsc::unbounded_channel();
    let recovery: Arc<dyn CrashLoopRecovery> = Arc::new(RecordingCrashLoopRecovery { calls, fails });
    let mut context = static_context();
    context.no_data_after_policy_acknowledgment = true;
    let mut harness = spawn_manager_with(logged_in_store(), test_config(), context, |deps| {
        deps.with_crash_loop_recovery(recovery)
    });
    harness.handle.set_active(true, false).await.unwrap();
    let mut server = harness.next_connection().await;
    server.accept();

    let first = server.recv_client_message().await.unwrap();
    server.send_json(&unknown_error(first.id()));
    let retry = server.recv_client_message().await.unwrap();
    assert!(matches!(retry, ClientSocketMessage::Initial { .. }));
    server.send_json(&unknown_error(retry.id()));
    (harness, server, recorded)
}

fn auth_error(current_user_info: Option<CurrentUserInfo>) -> ServerSocketMessage {
    ServerSocketMessage::AuthError {
        response_to: None,
        message: "session invalidated".to_string(),
        session_change: SessionChange {
            cookie_invalidated: true,
            cookie: Some("anonymous=9:x".to_string()),
            current_user_info,
            session_id: None,
        },
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_sync_connects_and_acknowledges_checkpoint() {
    let mut harness = spawn_manager();
    harness.handle.set_active(true, false).await.unwrap();

    let mut server = harness.next_connection().await;
    assert_eq!(harness.status(), ConnectionStatus::Connecting);
    server.accept();

    let initial = server.recv_client_message().await.unwrap();
    let ClientSocketMessage::Initial { id, payload } = initial else {
        panic!("expected INITIAL");
    };
    assert_eq!(
        payload.session_identification.cookie.as_deref(),
        Some(USER_COOKIE)
    );
    assert!(payload
        .client_responses
        .iter()
        .any(|r| matches!(r, ClientResponse::PlatformDetails(_))));

    server.send_json(&full_sync(id, 100));
    let ack = server.recv_client_message().await.unwrap();
    assert!(matches!(
        ack,
        ClientSocketMessage::AckUpdates {
            payload: crate::protocol::AckUpdatesPayload { current_as_of: 100 },
            ..
        }
    ));

    harness.wait_for_status(ConnectionStatus::Connected).await;
    let info = harness.store.keyserver_info(KEYSERVER_ID).unwrap();
    assert_eq!(info.updates_current_as_of, 100);

    let statuses: Vec<ConnectionStatus> = harness
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            ConnectionEvent::StatusChanged { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
    );
}

#[tokio::test(start_paused = true)]
async fn test_queued_activity_updates_need_both_replies() {
    let mut harness = spawn_manager();
    harness.store.dispatch(Action::QueueActivityUpdates {
        keyserver_id: KEYSERVER_ID.to_string(),
        activity_updates: vec![activity("256|1", true), activity("256|2", false)],
    });
    harness.handle.set_active(true, false).await.unwrap();
    let mut server = harness.next_connection().await;
    server.accept();

    let initial = server.recv_client_message().await.unwrap();
    let ClientSocketMessage::Initial { id, payload } = initial else {
        panic!("expected INITIAL");
    };
    assert!(payload.client_responses.contains(&ClientResponse::InitialActivityUpdates(vec![
        activity("256|1", true),
        activity("256|2", false),
    ])));

    server.send_json(&full_sync(id, 100));
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(harness.status(), ConnectionStatus::Connecting);

    server.send_json(&ServerSocketMessage::ActivityUpdateResponse {
        response_to: id,
        payload: Default::default(),
    });
    let ack = server.recv_client_message().await.unwrap();
    assert!(matches!(ack, ClientSocketMessage::AckUpdates { .. }));
    harness.wait_for_status(ConnectionStatus::Connected).await;

    let info = harness.store.keyserver_info(KEYSERVER_ID).unwrap();
    assert!(info.connection.queued_activity_updates.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_abrupt_close_rejects_pending_requests_and_reconnects() {
    let mut harness = spawn_manager();
    let mut server = harness.connect().await;

    let handle = harness.handle.clone();
    let request =
        tokio::spawn(async move { handle.api_request("fetch_entries", serde_json::json!({})).await });
    let sent = server.recv_client_message().await.unwrap();
    assert!(matches!(sent, ClientSocketMessage::ApiRequest { .. }));

    server.close();

    assert_eq!(
        request.await.unwrap().unwrap_err(),
        SocketError::Closed("socket closed".to_string())
    );
    let _replacement = harness.next_connection().await;
    assert_eq!(harness.status(), ConnectionStatus::Reconnecting);
}

#[tokio::test(start_paused = true)]
async fn test_idle_socket_pings_and_close_rejects_pong_wait() {
    let mut harness = spawn_manager();
    let mut server = harness.connect().await;

    // Idle: the paused clock runs forward to the ping.
    let ping = server.recv_client_message().await.unwrap();
    assert!(matches!(ping, ClientSocketMessage::Ping { .. }));
    server.send_json(&ServerSocketMessage::Pong {
        response_to: ping.id(),
    });
    let second_ping = server.recv_client_message().await.unwrap();
    assert!(matches!(second_ping, ClientSocketMessage::Ping { .. }));

    server.close();
    harness
        .wait_for_status(ConnectionStatus::Reconnecting)
        .await;
    let connection = harness.store.connection(KEYSERVER_ID).unwrap();
    assert!(connection.late_responses.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_handshake_times_out_and_reconnects() {
    let mut harness = spawn_manager();
    let mut actions = harness.store.subscribe_actions();
    harness.handle.set_active(true, false).await.unwrap();
    let mut server = harness.next_connection().await;
    server.accept();
    let initial_id = server.recv_client_message().await.unwrap().id();

    let _replacement = harness.next_connection().await;

    assert_eq!(harness.status(), ConnectionStatus::Reconnecting);
    let mut marked_late = false;
    while let Ok(action) = actions.try_recv() {
        if let Action::SetLateResponse {
            message_id,
            is_late: true,
            ..
        } = action
        {
            assert_eq!(message_id, i64::try_from(initial_id).unwrap());
            marked_late = true;
        }
    }
    assert!(marked_late);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_gives_up_on_unopened_transport() {
    let mut harness = spawn_manager();
    let mut actions = harness.store.subscribe_actions();
    harness.handle.set_active(true, false).await.unwrap();
    let _never_accepted = harness.next_connection().await;

    let _replacement = harness.next_connection().await;

    let mut marked_late = false;
    while let Ok(action) = actions.try_recv() {
        if matches!(
            action,
            Action::SetLateResponse {
                message_id: HANDSHAKE_LATE_ID,
                is_late: true,
                ..
            }
        ) {
            marked_late = true;
        }
    }
    assert!(marked_late);
}

#[tokio::test(start_paused = true)]
async fn test_not_logged_in_sets_connection_issue() {
    let mut harness = spawn_manager();
    harness.handle.set_active(true, false).await.unwrap();
    let mut server = harness.next_connection().await;
    server.accept();
    let id = server.recv_client_message().await.unwrap().id();

    server.send_json(&ServerSocketMessage::Error {
        response_to: Some(id),
        message: crate::error::NOT_LOGGED_IN.to_string(),
        payload: None,
    });

    harness
        .wait_until(|store| {
            store
                .connection(KEYSERVER_ID)
                .is_some_and(|c| c.connection_issue == Some(ConnectionIssue::NotLoggedInError))
        })
        .await;
    assert_eq!(harness.status(), ConnectionStatus::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_error_retries_once_then_closes() {
    let mut harness = spawn_manager();
    harness.handle.set_active(true, false).await.unwrap();
    let mut server = harness.next_connection().await;
    server.accept();

    let first = server.recv_client_message().await.unwrap();
    server.send_json(&ServerSocketMessage::Error {
        response_to: Some(first.id()),
        message: crate::error::UNKNOWN_ERROR.to_string(),
        payload: None,
    });
    let retry = server.recv_client_message().await.unwrap();
    assert!(matches!(retry, ClientSocketMessage::Initial { .. }));
    assert_ne!(retry.id(), first.id());

    server.send_json(&ServerSocketMessage::Error {
        response_to: Some(retry.id()),
        message: crate::error::UNKNOWN_ERROR.to_string(),
        payload: None,
    });

    let _replacement = harness.next_connection().await;
    assert_eq!(server.ready_state(), ReadyState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_auth_error_reply_to_initial_gives_up_as_not_logged_in() {
    let recovery: Arc<dyn SessionRecovery> = Arc::new(StalledRecovery);
    let mut harness = spawn_manager_with(logged_in_store(), test_config(), static_context(), |deps| {
        deps.with_session_recovery(recovery)
    });
    harness.handle.set_active(true, false).await.unwrap();
    let mut server = harness.next_connection().await;
    server.accept();
    let id = server.recv_client_message().await.unwrap().id();

    let mut message = auth_error(None);
    if let ServerSocketMessage::AuthError { response_to, .. } = &mut message {
        *response_to = Some(id);
    }
    server.send_json(&message);

    harness
        .wait_until(|store| {
            store
                .connection(KEYSERVER_ID)
                .is_some_and(|c| c.connection_issue == Some(ConnectionIssue::NotLoggedInError))
        })
        .await;
    let resent = tokio::time::timeout(Duration::from_millis(100), server.recv_client_message()).await;
    assert!(!matches!(resent, Ok(Some(ClientSocketMessage::Initial { .. }))));
}

#[tokio::test(start_paused = true)]
async fn test_crash_loop_after_policy_acknowledgment_runs_recovery() {
    let (harness, server, mut recorded) = trip_crash_loop(false).await;

    assert_eq!(recorded.recv().await.as_deref(), Some(KEYSERVER_ID));
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(recorded.try_recv().is_err());
    let connection = harness.store.connection(KEYSERVER_ID).unwrap();
    assert_eq!(connection.connection_issue, None);
    assert_eq!(server.ready_state(), ReadyState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_failed_crash_loop_recovery_sets_connection_issue() {
    let (harness, _server, mut recorded) = trip_crash_loop(true).await;

    assert_eq!(recorded.recv().await.as_deref(), Some(KEYSERVER_ID));
    harness
        .wait_until(|store| {
            store.connection(KEYSERVER_ID).is_some_and(|c| {
                c.connection_issue == Some(ConnectionIssue::PolicyAcknowledgementSocketCrashLoop)
            })
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_auth_error_downgrade_skips_recovery_and_stays_closed() {
    let recovery = Arc::new(RecordingRecovery {
        result: None,
        requests: Mutex::new(Vec::new()),
    });
    let recovery_dep: Arc<dyn SessionRecovery> = recovery.clone();
    let mut harness = spawn_manager_with(logged_in_store(), test_config(), static_context(), |deps| {
        deps.with_session_recovery(recovery_dep)
    });
    let server = harness.connect().await;

    server.send_json(&auth_error(Some(CurrentUserInfo::anonymous())));
    let event = harness
        .wait_for_event(|e| matches!(e, ConnectionEvent::SessionInvalidated { .. }))
        .await;
    assert_eq!(
        event,
        ConnectionEvent::SessionInvalidated {
            keyserver_id: KEYSERVER_ID.to_string(),
            downgrade: true,
        }
    );
    assert!(recovery.requests.lock().unwrap().is_empty());
    let info = harness.store.keyserver_info(KEYSERVER_ID).unwrap();
    assert_eq!(info.cookie.as_deref(), Some("anonymous=9:x"));

    server.close();
    harness.wait_for_status(ConnectionStatus::Disconnected).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(harness.connections.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_auth_error_recovers_with_stored_cookie() {
    let fresh = SessionChange {
        cookie_invalidated: false,
        cookie: Some("user=1:fresh".to_string()),
        current_user_info: Some(CurrentUserInfo::logged_in("1", "ashoat")),
        session_id: None,
    };
    let recovery = Arc::new(RecordingRecovery {
        result: Some(fresh),
        requests: Mutex::new(Vec::new()),
    });
    let recovery_dep: Arc<dyn SessionRecovery> = recovery.clone();
    let mut harness = spawn_manager_with(logged_in_store(), test_config(), static_context(), |deps| {
        deps.with_session_recovery(recovery_dep)
    });
    let server = harness.connect().await;

    let mut message = auth_error(None);
    if let ServerSocketMessage::AuthError { session_change, .. } = &mut message {
        session_change.cookie = None;
    }
    server.send_json(&message);
    harness
        .wait_for_event(|e| matches!(e, ConnectionEvent::SessionRecovered { .. }))
        .await;

    let requests = recovery.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].cookie.as_deref(), Some(USER_COOKIE));
    assert_eq!(requests[0].url_prefix, "http://localhost:3000");
    let info = harness.store.keyserver_info(KEYSERVER_ID).unwrap();
    assert_eq!(info.cookie.as_deref(), Some("user=1:fresh"));
    assert!(!info.connection.session_recovery_in_progress);
}

#[tokio::test(start_paused = true)]
async fn test_graceful_close_waits_for_activity_reply() {
    let mut harness = spawn_manager();
    let mut server = harness.connect().await;

    let handle = harness.handle.clone();
    let update =
        tokio::spawn(async move { handle.update_activity(vec![activity("256|9", false)]).await });
    let sent = server.recv_client_message().await.unwrap();
    let ClientSocketMessage::ApiRequest { id, payload } = sent else {
        panic!("expected API_REQUEST");
    };
    assert_eq!(payload.endpoint, "update_activity");

    harness.handle.set_active(false, true).await.unwrap();
    harness
        .wait_for_status(ConnectionStatus::Disconnecting)
        .await;

    server.send_json(&ServerSocketMessage::ApiResponse {
        response_to: id,
        payload: serde_json::json!({"unfocused_to_unread": []}),
    });

    update.await.unwrap().unwrap();
    harness.wait_for_status(ConnectionStatus::Disconnected).await;
    let info = harness.store.keyserver_info(KEYSERVER_ID).unwrap();
    assert!(info.connection.queued_activity_updates.is_empty());
    assert!(harness.connections.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_replace_transport_reopens_on_new_target() {
    let mut harness = spawn_manager();
    let server = harness.connect().await;

    let (factory, mut new_connections) = ChannelTransportFactory::new();
    harness
        .handle
        .replace_transport(Arc::new(factory))
        .await
        .unwrap();

    let replacement = new_connections.recv().await.unwrap();
    assert_eq!(server.ready_state(), ReadyState::Closed);
    assert_eq!(replacement.ready_state(), ReadyState::Connecting);
    assert_eq!(harness.status(), ConnectionStatus::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_frozen_client_never_opens() {
    let mut context = static_context();
    context.frozen = true;
    let mut harness = spawn_manager_with(logged_in_store(), test_config(), context, |deps| deps);

    harness.handle.set_active(true, false).await.unwrap();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert!(harness.connections.try_recv().is_err());
    assert_eq!(harness.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_login_while_active_opens_socket() {
    let store = KeyserverStoreHandle::new(KeyserverStore::default(), KEYSERVER_ID, 64);
    store.dispatch(Action::AddKeyserver {
        keyserver_id: KEYSERVER_ID.to_string(),
        keyserver_info: KeyserverInfo::new("http://localhost:3000", calendar_query()),
    });
    let mut harness = spawn_manager_with(store, test_config(), static_context(), |deps| deps);
    harness.handle.set_active(true, false).await.unwrap();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(harness.connections.try_recv().is_err());

    harness.store.dispatch(Action::SetNewSession {
        keyserver_id: KEYSERVER_ID.to_string(),
        session_change: crate::protocol::SessionChange {
            cookie_invalidated: false,
            cookie: Some(USER_COOKIE.to_string()),
            current_user_info: None,
            session_id: None,
        },
        pre_request_user_state: None,
        error: None,
        source: None,
    });

    let _server = harness.next_connection().await;
    assert_eq!(harness.status(), ConnectionStatus::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_unsupervised_background_detection() {
    let config = ConnectionConfig {
        timeouts: Timeouts {
            ping_frequency_ms: 1_000_000,
            server_request_socket_timeout_ms: 1_000,
            ..Timeouts::default()
        },
        ..test_config()
    };
    let mut harness = spawn_manager_with(logged_in_store(), config, static_context(), |deps| deps);
    let _server = harness.connect().await;
    harness.drain_events();

    tokio::time::advance(Duration::from_millis(1_500)).await;
    assert!(harness.handle.detect_unsupervised_background().await.unwrap());

    assert_eq!(harness.status(), ConnectionStatus::Disconnected);
    let events = harness.drain_events();
    assert!(events.contains(&ConnectionEvent::UnsupervisedBackground {
        keyserver_id: KEYSERVER_ID.to_string()
    }));
    // The manager treats the client as backgrounded and stays closed.
    assert!(harness.connections.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_idle_client_is_not_flagged_as_backgrounded() {
    let config = ConnectionConfig {
        timeouts: Timeouts {
            ping_frequency_ms: 1_000_000,
            server_request_socket_timeout_ms: 1_000,
            ..Timeouts::default()
        },
        ..test_config()
    };
    let mut harness = spawn_manager_with(logged_in_store(), config, static_context(), |deps| deps);
    let _server = harness.connect().await;

    tokio::time::advance(Duration::from_millis(5_000)).await;

    assert!(!harness.handle.detect_unsupervised_background().await.unwrap());
    assert_eq!(harness.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_socket_and_stops_task() {
    let mut harness = spawn_manager();
    let server = harness.connect().await;

    harness.handle.shutdown().await.unwrap();
    (&mut harness.task).await.unwrap();

    assert_eq!(server.ready_state(), ReadyState::Closed);
    assert_eq!(harness.status(), ConnectionStatus::Disconnected);
    assert!(matches!(
        harness.handle.api_request("ping", serde_json::json!({})).await,
        Err(SocketError::Closed(_))
    ));
}
