use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::context::ConnectionDeps;
use super::manager::ConnectionManager;
use crate::config::ConnectionConfig;
use crate::error::SocketError;
use crate::keyserver::{ConnectionStatus, KeyserverStoreHandle};
use crate::protocol::{ActivityUpdate, ServerSocketMessage};
use crate::transport::TransportFactory;

/// Notifications published by one connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StatusChanged {
        keyserver_id: String,
        status: ConnectionStatus,
    },
    Message {
        keyserver_id: String,
        message: ServerSocketMessage,
    },
    UnsupervisedBackground {
        keyserver_id: String,
    },
    SessionRecovered {
        keyserver_id: String,
    },
    SessionInvalidated {
        keyserver_id: String,
        downgrade: bool,
    },
}

pub(crate) enum Command {
    SetActive {
        active: bool,
        activity_update_pending: bool,
    },
    ReplaceTransport(Arc<dyn TransportFactory>),
    ApiRequest {
        endpoint: String,
        input: Value,
        reply: oneshot::Sender<Result<Value, SocketError>>,
    },
    UpdateActivity {
        updates: Vec<ActivityUpdate>,
        reply: oneshot::Sender<Result<(), SocketError>>,
    },
    DetectUnsupervisedBackground {
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

const COMMAND_BUFFER: usize = 64;

/// Cheap, cloneable front end to a running [`ConnectionManager`].
#[derive(Clone)]
pub struct ConnectionHandle {
    keyserver_id: Arc<str>,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionHandle {
    /// Spawns the manager task for `keyserver_id`. The manager starts
    /// inactive; call [`ConnectionHandle::set_active`] to connect.
    pub fn spawn(
        keyserver_id: impl Into<String>,
        config: ConnectionConfig,
        store: KeyserverStoreHandle,
        deps: ConnectionDeps,
    ) -> (Self, JoinHandle<()>) {
        let keyserver_id = keyserver_id.into();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, _) = broadcast::channel(config.event_buffer.max(1));
        let manager = ConnectionManager::new(
            keyserver_id.clone(),
            config,
            store,
            deps,
            commands_rx,
            events_tx.clone(),
        );
        let task = tokio::spawn(manager.run());
        (
            Self {
                keyserver_id: Arc::from(keyserver_id),
                commands: commands_tx,
                events: events_tx,
            },
            task,
        )
    }

    pub fn keyserver_id(&self) -> &str {
        &self.keyserver_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: Command) -> Result<(), SocketError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SocketError::Closed("connection manager stopped".to_string()))
    }

    /// Foregrounds or backgrounds the connection. When going inactive with
    /// an activity update still in flight, teardown waits for its reply.
    pub async fn set_active(
        &self,
        active: bool,
        activity_update_pending: bool,
    ) -> Result<(), SocketError> {
        self.send(Command::SetActive {
            active,
            activity_update_pending,
        })
        .await
    }

    /// Force-closes the current socket and reconnects through `factory`.
    pub async fn replace_transport(
        &self,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<(), SocketError> {
        self.send(Command::ReplaceTransport(factory)).await
    }

    pub async fn api_request(
        &self,
        endpoint: impl Into<String>,
        input: Value,
    ) -> Result<Value, SocketError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ApiRequest {
            endpoint: endpoint.into(),
            input,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| SocketError::Closed("connection manager stopped".to_string()))?
    }

    /// Queues `updates` and flushes them if connected. Queued updates that
    /// are not flushed now ride along with the next INITIAL.
    pub async fn update_activity(&self, updates: Vec<ActivityUpdate>) -> Result<(), SocketError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::UpdateActivity { updates, reply }).await?;
        rx.await
            .map_err(|_| SocketError::Closed("connection manager stopped".to_string()))?
    }

    /// Runs the unsupervised background check now; true if it fired.
    pub async fn detect_unsupervised_background(&self) -> Result<bool, SocketError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::DetectUnsupervisedBackground { reply })
            .await?;
        rx.await
            .map_err(|_| SocketError::Closed("connection manager stopped".to_string()))
    }

    pub async fn shutdown(&self) -> Result<(), SocketError> {
        self.send(Command::Shutdown).await
    }
}
