//! Fixtures shared by the socket test modules.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::context::{ConnectionDeps, StaticClientContext};
use super::handle::{ConnectionEvent, ConnectionHandle};
use super::inflight::{InflightEvent, InflightRequests, InflightTimeouts};
use super::sender::SocketSender;
use crate::config::ConnectionConfig;
use crate::keyserver::{
    Action, ConnectionStatus, KeyserverInfo, KeyserverStore, KeyserverStoreHandle,
};
use crate::protocol::{
    CalendarQuery, ClientSocketMessage, CurrentUserInfo, FullStateSync, PlatformDetails,
    ServerSocketMessage, StateSyncPayload,
};
use crate::transport::{
    ChannelTransportFactory, OpenedTransport, ServerEnd, TransportEvent, TransportFactory,
};

pub(crate) const KEYSERVER_ID: &str = "256";
pub(crate) const USER_COOKIE: &str = "user=1:secret";

pub(crate) fn platform() -> PlatformDetails {
    PlatformDetails {
        platform: "web".to_string(),
        code_version: Some(42),
        state_version: Some(7),
    }
}

pub(crate) fn calendar_query() -> CalendarQuery {
    CalendarQuery::new("2026-10-01", "2026-10-31")
}

pub(crate) fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        home_keyserver_id: KEYSERVER_ID.to_string(),
        ..ConnectionConfig::default()
    }
}

pub(crate) fn static_context() -> StaticClientContext {
    let mut context = StaticClientContext::new(platform());
    context.current_user_info = Some(CurrentUserInfo::logged_in("1", "ashoat"));
    context
}

/// A store holding the home keyserver with a logged-in cookie.
pub(crate) fn logged_in_store() -> KeyserverStoreHandle {
    let store = KeyserverStoreHandle::new(KeyserverStore::default(), KEYSERVER_ID, 64);
    store.dispatch(Action::AddKeyserver {
        keyserver_id: KEYSERVER_ID.to_string(),
        keyserver_info: KeyserverInfo::new("http://localhost:3000", calendar_query())
            .with_cookie(Some(USER_COOKIE.to_string())),
    });
    store
}

pub(crate) fn full_sync(response_to: u64, checkpoint: i64) -> ServerSocketMessage {
    ServerSocketMessage::StateSync {
        response_to,
        payload: StateSyncPayload::Full(FullStateSync {
            message_infos: json!({}),
            thread_infos: json!({}),
            user_infos: json!({}),
            entry_infos: json!({}),
            current_user_info: CurrentUserInfo::logged_in("1", "ashoat"),
            updates_current_as_of: checkpoint,
            calendar_query: None,
            session_id: None,
        }),
    }
}

/// An open socket on the channel transport, driven directly by a test.
pub(crate) struct TestSocket {
    pub sender: SocketSender,
    pub inflight: InflightRequests,
    pub server: ServerEnd,
    pub inflight_events: mpsc::UnboundedReceiver<InflightEvent>,
    pub transport_events: mpsc::UnboundedReceiver<TransportEvent>,
}

pub(crate) async fn open_test_socket(generation: u64) -> TestSocket {
    let (factory, mut connections) = ChannelTransportFactory::new();
    let OpenedTransport {
        transport,
        mut events,
    } = factory.open();
    let server = connections.recv().await.unwrap();
    server.accept();
    assert_eq!(events.recv().await, Some(TransportEvent::Open));

    let (tx, inflight_events) = mpsc::unbounded_channel();
    let timeouts = test_config().timeouts;
    let inflight = InflightRequests::new(
        generation,
        InflightTimeouts {
            visual: timeouts.client_request_visual_timeout(),
            socket: timeouts.client_request_socket_timeout(),
        },
        tx,
    );
    TestSocket {
        sender: SocketSender::new(Arc::from(KEYSERVER_ID), transport, Arc::new(AtomicU64::new(0))),
        inflight,
        server,
        inflight_events,
        transport_events: events,
    }
}

/// A running connection manager wired to the channel transport.
pub(crate) struct Harness {
    pub handle: ConnectionHandle,
    pub store: KeyserverStoreHandle,
    pub connections: mpsc::UnboundedReceiver<ServerEnd>,
    pub events: broadcast::Receiver<ConnectionEvent>,
    pub task: JoinHandle<()>,
}

const WAIT_LIMIT: Duration = Duration::from_secs(600);

pub(crate) fn spawn_manager() -> Harness {
    spawn_manager_with(logged_in_store(), test_config(), static_context(), |deps| deps)
}

pub(crate) fn spawn_manager_with(
    store: KeyserverStoreHandle,
    config: ConnectionConfig,
    context: StaticClientContext,
    customize: impl FnOnce(ConnectionDeps) -> ConnectionDeps,
) -> Harness {
    let (factory, connections) = ChannelTransportFactory::new();
    let deps = customize(ConnectionDeps::new(Arc::new(factory), Arc::new(context)));
    let (handle, task) = ConnectionHandle::spawn(KEYSERVER_ID, config, store.clone(), deps);
    let events = handle.subscribe();
    Harness {
        handle,
        store,
        connections,
        events,
        task,
    }
}

impl Harness {
    pub fn status(&self) -> ConnectionStatus {
        self.store
            .connection(KEYSERVER_ID)
            .map(|connection| connection.status)
            .unwrap_or_default()
    }

    pub async fn wait_for_status(&self, status: ConnectionStatus) {
        self.wait_until(|store| store.connection(KEYSERVER_ID).map(|c| c.status) == Some(status))
            .await;
    }

    /// Waits until a store snapshot satisfies `predicate`.
    pub async fn wait_until(&self, predicate: impl FnMut(&KeyserverStore) -> bool) {
        let mut snapshots = self.store.watch();
        tokio::time::timeout(WAIT_LIMIT, snapshots.wait_for(predicate))
            .await
            .expect("store never reached the expected state")
            .unwrap();
    }

    /// Skips events until one matches `predicate`.
    pub async fn wait_for_event(
        &mut self,
        mut predicate: impl FnMut(&ConnectionEvent) -> bool,
    ) -> ConnectionEvent {
        tokio::time::timeout(WAIT_LIMIT, async {
            loop {
                let event = self.events.recv().await.unwrap();
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected event was never published")
    }

    pub async fn next_connection(&mut self) -> ServerEnd {
        tokio::time::timeout(WAIT_LIMIT, self.connections.recv())
            .await
            .expect("no connection was opened")
            .unwrap()
    }

    /// Activates the manager and completes a full-sync handshake at
    /// checkpoint 100.
    pub async fn connect(&mut self) -> ServerEnd {
        self.handle.set_active(true, false).await.unwrap();
        let mut server = self.next_connection().await;
        server.accept();
        let initial = server.recv_client_message().await.unwrap();
        server.send_json(&full_sync(initial.id(), 100));
        let ack = server.recv_client_message().await.unwrap();
        assert!(matches!(ack, ClientSocketMessage::AckUpdates { .. }));
        self.wait_for_status(ConnectionStatus::Connected).await;
        server
    }

    /// Drains connection events published so far.
    pub fn drain_events(&mut self) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
