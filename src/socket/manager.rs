//! Per-keyserver socket lifecycle.
//!
//! One task owns every piece of mutable connection state and drives it
//! from a single `select!` loop. Helper tasks (handshake, ping, recovery,
//! responders, API requests) report back over channels tagged with the
//! socket generation they belong to; anything from an older generation is
//! dropped.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::context::ConnectionDeps;
use super::handle::{Command, ConnectionEvent};
use super::heartbeat::{send_ping, HeartbeatMonitor};
use super::inflight::{InflightEvent, InflightRequests, InflightTimeouts};
use super::recovery::RecoveryOutcome;
use super::sender::SocketSender;
use super::state_sync::{next_step, FailureStep, Handshake, HandshakeOutcome, PolicyFailureCounter};
use super::throttle::ReconnectThrottle;
use crate::config::ConnectionConfig;
use crate::error::SocketError;
use crate::keyserver::{
    Action, ConnectionIssue, ConnectionStatus, KeyserverStore, KeyserverStoreHandle,
    HANDSHAKE_LATE_ID,
};
use crate::protocol::PreRequestUserState;
use crate::transport::{OpenedTransport, ReadyState, Transport, TransportEvent};

pub(super) struct ActiveSocket {
    pub(super) generation: u64,
    pub(super) transport: Arc<dyn Transport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    pub(super) inflight: InflightRequests,
    pub(super) sender: SocketSender,
}

/// The transport must open within the client request timeouts.
struct OpenWatchdog {
    late_at: Option<Instant>,
    close_at: Instant,
}

pub(super) enum Internal {
    HandshakeFinished {
        generation: u64,
        retries_left: u32,
        result: Result<HandshakeOutcome, SocketError>,
    },
    RecoveryFinished {
        outcome: RecoveryOutcome,
    },
}

pub(crate) struct ConnectionManager {
    pub(super) keyserver_id: String,
    pub(super) config: ConnectionConfig,
    pub(super) store: KeyserverStoreHandle,
    pub(super) deps: ConnectionDeps,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<ConnectionEvent>,
    store_changes: watch::Receiver<KeyserverStore>,
    pub(super) internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    inflight_tx: mpsc::UnboundedSender<InflightEvent>,
    inflight_rx: mpsc::UnboundedReceiver<InflightEvent>,
    message_ids: Arc<AtomicU64>,
    pub(super) active: bool,
    generation: u64,
    pub(super) socket: Option<ActiveSocket>,
    watchdog: Option<OpenWatchdog>,
    close_deadline: Option<Instant>,
    reopen_after_close: bool,
    pub(super) recovery_in_progress: bool,
    pub(super) initialized_with_user_state: Option<PreRequestUserState>,
    pub(super) heartbeat: HeartbeatMonitor,
    throttle: ReconnectThrottle,
    pub(super) policy_failures: PolicyFailureCounter,
    last_status: ConnectionStatus,
    last_had_user_cookie: bool,
}

impl ConnectionManager {
    pub(crate) fn new(
        keyserver_id: String,
        config: ConnectionConfig,
        store: KeyserverStoreHandle,
        deps: ConnectionDeps,
        commands: mpsc::Receiver<Command>,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (inflight_tx, inflight_rx) = mpsc::unbounded_channel();
        let heartbeat = HeartbeatMonitor::new(&config.timeouts);
        let throttle = ReconnectThrottle::new(config.timeouts.reconnect_throttle());
        let policy_failures = PolicyFailureCounter::new(config.policy_failure_threshold);
        let store_changes = store.watch();
        Self {
            keyserver_id,
            config,
            store,
            deps,
            commands,
            events,
            store_changes,
            internal_tx,
            internal_rx,
            inflight_tx,
            inflight_rx,
            message_ids: Arc::new(AtomicU64::new(0)),
            active: false,
            generation: 0,
            socket: None,
            watchdog: None,
            close_deadline: None,
            reopen_after_close: false,
            recovery_in_progress: false,
            initialized_with_user_state: None,
            heartbeat,
            throttle,
            policy_failures,
            last_status: ConnectionStatus::Disconnected,
            last_had_user_cookie: false,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            keyserver_id = %self.keyserver_id,
            transport = %self.deps.transport_factory.describe(),
            "Connection manager started"
        );
        // A status restored from a previous run has no socket behind it.
        if self.status() != ConnectionStatus::Disconnected {
            self.set_status(ConnectionStatus::Disconnected);
        }
        self.last_status = self.status();
        self.last_had_user_cookie = self.has_user_cookie();

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                (generation, event) = next_transport_event(&mut self.socket) => {
                    self.handle_transport_event(generation, event);
                }
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                Some(event) = self.inflight_rx.recv() => self.handle_inflight_event(event),
                Ok(()) = self.store_changes.changed() => {}
                () = sleep_until_deadline(deadline) => self.handle_timers(Instant::now()),
            }
            self.reconcile();
        }

        self.active = false;
        self.throttle.cancel();
        self.force_close_socket();
        info!(keyserver_id = %self.keyserver_id, "Connection manager stopped");
    }

    pub(super) fn status(&self) -> ConnectionStatus {
        self.store
            .connection(&self.keyserver_id)
            .map(|connection| connection.status)
            .unwrap_or_default()
    }

    fn has_user_cookie(&self) -> bool {
        self.store
            .keyserver_info(&self.keyserver_id)
            .is_some_and(|info| info.has_user_cookie())
    }

    pub(super) fn set_status(&mut self, status: ConnectionStatus) {
        let previous = self.status();
        self.store.dispatch(Action::UpdateConnectionStatus {
            keyserver_id: self.keyserver_id.clone(),
            status,
        });
        if previous != status {
            debug!(keyserver_id = %self.keyserver_id, from = %previous, to = %status, "Connection status changed");
            self.emit(ConnectionEvent::StatusChanged {
                keyserver_id: self.keyserver_id.clone(),
                status,
            });
        }
    }

    pub(super) fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(super) fn dispatch(&self, action: Action) {
        self.store.dispatch(action);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetActive {
                active,
                activity_update_pending,
            } => {
                if active == self.active {
                    return;
                }
                self.active = active;
                if active {
                    self.open_socket(ConnectionStatus::Connecting);
                } else {
                    self.throttle.cancel();
                    self.close_socket(activity_update_pending);
                }
            }
            Command::ReplaceTransport(factory) => {
                info!(
                    keyserver_id = %self.keyserver_id,
                    transport = %factory.describe(),
                    "Replacing transport"
                );
                self.deps.transport_factory = factory;
                if self.socket.is_some() {
                    self.reopen_after_close = true;
                    self.force_close_socket();
                } else if self.active {
                    self.open_socket(ConnectionStatus::Connecting);
                }
            }
            Command::ApiRequest {
                endpoint,
                input,
                reply,
            } => self.start_api_request(endpoint, input, reply),
            Command::UpdateActivity { updates, reply } => self.start_activity_update(updates, reply),
            Command::DetectUnsupervisedBackground { reply } => {
                let _ = reply.send(self.detect_unsupervised_background(false));
            }
            Command::Shutdown => {}
        }
    }

    fn handle_transport_event(&mut self, generation: u64, event: Option<TransportEvent>) {
        if generation != self.generation {
            return;
        }
        match event {
            Some(TransportEvent::Open) => self.on_open(),
            Some(TransportEvent::Message(text)) => self.receive_message(&text),
            Some(TransportEvent::Close) | None => self.on_close(),
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::HandshakeFinished {
                generation,
                retries_left,
                result,
            } => {
                if generation != self.generation || self.socket.is_none() {
                    debug!(keyserver_id = %self.keyserver_id, generation, "Ignoring stale handshake result");
                    return;
                }
                match result {
                    Ok(_) if self.status().is_opening() => self.mark_socket_initialized(),
                    Ok(_) => {}
                    Err(e) => self.handle_handshake_failure(e, retries_left),
                }
            }
            Internal::RecoveryFinished { outcome } => {
                self.recovery_in_progress = false;
                let event = match outcome {
                    RecoveryOutcome::Recovered => ConnectionEvent::SessionRecovered {
                        keyserver_id: self.keyserver_id.clone(),
                    },
                    RecoveryOutcome::Invalidated { downgrade } => {
                        ConnectionEvent::SessionInvalidated {
                            keyserver_id: self.keyserver_id.clone(),
                            downgrade,
                        }
                    }
                };
                self.emit(event);
                if self.active
                    && self.socket.is_none()
                    && self.status() == ConnectionStatus::Disconnected
                {
                    self.reconnect();
                }
            }
        }
    }

    fn handle_inflight_event(&mut self, event: InflightEvent) {
        match event {
            InflightEvent::Late {
                generation,
                message_id,
                is_late,
            } => {
                if generation == self.generation && self.socket.is_some() {
                    self.dispatch(Action::SetLateResponse {
                        keyserver_id: self.keyserver_id.clone(),
                        message_id: i64::try_from(message_id).unwrap_or(i64::MAX),
                        is_late,
                    });
                }
            }
            InflightEvent::TimedOut {
                generation,
                expected,
            } => {
                if generation == self.generation && self.socket.is_some() {
                    warn!(keyserver_id = %self.keyserver_id, %expected, "Request timed out; tearing socket down");
                    self.finish_closing_socket(None);
                }
            }
        }
    }

    fn handle_timers(&mut self, now: Instant) {
        let mut watchdog_late = false;
        let mut watchdog_expired = false;
        if let Some(watchdog) = &mut self.watchdog {
            if watchdog.late_at.is_some_and(|at| at <= now) {
                watchdog.late_at = None;
                watchdog_late = true;
            }
            watchdog_expired = watchdog.close_at <= now;
        }
        if watchdog_late {
            self.dispatch(Action::SetLateResponse {
                keyserver_id: self.keyserver_id.clone(),
                message_id: HANDSHAKE_LATE_ID,
                is_late: true,
            });
        }
        if watchdog_expired {
            self.watchdog = None;
            warn!(keyserver_id = %self.keyserver_id, "Socket did not open in time");
            self.finish_closing_socket(None);
        }

        if self.close_deadline.is_some_and(|at| at <= now) {
            self.close_deadline = None;
            self.finish_closing_socket(None);
        }

        if self.heartbeat.take_due_ping(now) {
            self.start_ping();
        }

        if self.throttle.take_trailing(now) && self.active {
            self.open_socket(ConnectionStatus::Reconnecting);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.heartbeat.ping_deadline(),
            self.watchdog.as_ref().and_then(|w| w.late_at),
            self.watchdog.as_ref().map(|w| w.close_at),
            self.close_deadline,
            self.throttle.trailing_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Follows status and cookie changes made since the last loop turn,
    /// wherever they came from.
    fn reconcile(&mut self) {
        let status = self.status();
        let previous = std::mem::replace(&mut self.last_status, status);
        let has_user_cookie = self.has_user_cookie();
        let gained_user_cookie = has_user_cookie && !self.last_had_user_cookie;
        self.last_had_user_cookie = has_user_cookie;

        if status != ConnectionStatus::Disconnected {
            return;
        }
        if self.socket.is_some() {
            // Disconnected by an outside action; the transport goes too.
            self.drop_socket();
        }
        if !self.active {
            return;
        }
        let recovering = self.recovery_in_progress
            || self
                .store
                .connection(&self.keyserver_id)
                .is_some_and(|c| c.session_recovery_in_progress);
        if recovering {
            return;
        }
        if previous != status {
            self.reconnect();
        } else if gained_user_cookie {
            self.open_socket(ConnectionStatus::Connecting);
        }
    }

    fn reconnect(&mut self) {
        if self.throttle.request(Instant::now()) {
            self.open_socket(ConnectionStatus::Reconnecting);
        } else {
            debug!(keyserver_id = %self.keyserver_id, "Reconnect throttled");
        }
    }

    pub(super) fn open_socket(&mut self, target: ConnectionStatus) {
        if self.deps.context.frozen() {
            debug!(keyserver_id = %self.keyserver_id, "Client is frozen; not opening socket");
            return;
        }
        if !self.has_user_cookie() {
            debug!(keyserver_id = %self.keyserver_id, "No user cookie; not opening socket");
            return;
        }
        if let Some(socket) = &self.socket {
            match self.status() {
                ConnectionStatus::ForcedDisconnecting => {
                    self.reopen_after_close = true;
                    return;
                }
                ConnectionStatus::Disconnecting
                    if socket.transport.ready_state() == ReadyState::Open =>
                {
                    self.mark_socket_initialized();
                    return;
                }
                ConnectionStatus::Connected
                | ConnectionStatus::Connecting
                | ConnectionStatus::Reconnecting => return,
                status => {
                    warn!(keyserver_id = %self.keyserver_id, %status, "Replacing a socket the store considers closed");
                    self.drop_socket();
                }
            }
        }

        self.generation += 1;
        self.set_status(target);
        let OpenedTransport { transport, events } = self.deps.transport_factory.open();
        let timeouts = InflightTimeouts {
            visual: self.config.timeouts.client_request_visual_timeout(),
            socket: self.config.timeouts.client_request_socket_timeout(),
        };
        let inflight = InflightRequests::new(self.generation, timeouts, self.inflight_tx.clone());
        let sender = SocketSender::new(
            Arc::from(self.keyserver_id.as_str()),
            transport.clone(),
            self.message_ids.clone(),
        );
        self.socket = Some(ActiveSocket {
            generation: self.generation,
            transport,
            events,
            inflight,
            sender,
        });

        let cookie = self
            .store
            .keyserver_info(&self.keyserver_id)
            .and_then(|info| info.cookie);
        self.initialized_with_user_state = Some(PreRequestUserState {
            current_user_info: self.deps.context.current_user_info(),
            cookie,
            session_id: self.deps.context.session_id(&self.keyserver_id),
        });
        let now = Instant::now();
        self.watchdog = Some(OpenWatchdog {
            late_at: Some(now + timeouts.visual),
            close_at: now + timeouts.socket,
        });
        info!(
            keyserver_id = %self.keyserver_id,
            generation = self.generation,
            status = %target,
            "Opening socket"
        );
    }

    fn on_open(&mut self) {
        self.watchdog = None;
        debug!(keyserver_id = %self.keyserver_id, generation = self.generation, "Transport open");
        self.spawn_handshake(self.config.initial_sync_retries);
    }

    fn spawn_handshake(&self, retries_left: u32) {
        let Some(socket) = &self.socket else {
            return;
        };
        let handshake = Handshake {
            keyserver_id: self.keyserver_id.clone(),
            store: self.store.clone(),
            context: self.deps.context.clone(),
            sender: socket.sender.clone(),
            inflight: socket.inflight.clone(),
        };
        let generation = socket.generation;
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = handshake.run().await;
            let _ = internal.send(Internal::HandshakeFinished {
                generation,
                retries_left,
                result,
            });
        });
    }

    fn handle_handshake_failure(&mut self, error: SocketError, retries_left: u32) {
        let crash_loop = self
            .policy_failures
            .record_failure(self.deps.context.no_data_after_policy_acknowledgment());
        if crash_loop {
            if let Some(recovery) = self.deps.crash_loop_recovery.clone() {
                warn!(keyserver_id = %self.keyserver_id, "Handshake crash loop after policy acknowledgment");
                self.policy_failures.reset();
                let keyserver_id = self.keyserver_id.clone();
                let store = self.store.clone();
                tokio::spawn(async move {
                    if let Err(e) = recovery.recover(&keyserver_id).await {
                        warn!(keyserver_id = %keyserver_id, "Crash loop recovery failed: {}", e);
                        store.dispatch(Action::SetConnectionIssue {
                            keyserver_id,
                            connection_issue: Some(ConnectionIssue::PolicyAcknowledgementSocketCrashLoop),
                        });
                    }
                });
                return;
            }
        }

        warn!(keyserver_id = %self.keyserver_id, retries_left, "Error while initializing socket: {}", error);
        match next_step(&error, self.status(), retries_left) {
            FailureStep::Ignore => {}
            FailureStep::Retry => self.spawn_handshake(retries_left.saturating_sub(1)),
            FailureStep::SetIssue(issue) => self.dispatch(Action::SetConnectionIssue {
                keyserver_id: self.keyserver_id.clone(),
                connection_issue: Some(issue),
            }),
            FailureStep::CloseSocket => {
                if let Some(socket) = &self.socket {
                    socket.transport.close();
                }
            }
        }
    }

    fn mark_socket_initialized(&mut self) {
        self.watchdog = None;
        self.close_deadline = None;
        self.set_status(ConnectionStatus::Connected);
        self.heartbeat.reset(Instant::now());
        info!(keyserver_id = %self.keyserver_id, generation = self.generation, "Socket connected");
    }

    fn start_ping(&self) {
        if self.status() != ConnectionStatus::Connected {
            return;
        }
        let Some(socket) = &self.socket else {
            return;
        };
        let keyserver_id = self.keyserver_id.clone();
        let sender = socket.sender.clone();
        let inflight = socket.inflight.clone();
        tokio::spawn(async move { send_ping(&keyserver_id, sender, inflight).await });
    }

    /// Graceful close. With an activity update in flight the teardown waits
    /// for its reply, bounded by the socket timeout.
    pub(super) fn close_socket(&mut self, activity_update_pending: bool) {
        if self.status() == ConnectionStatus::Disconnected {
            return;
        }
        self.set_status(ConnectionStatus::Disconnecting);
        if activity_update_pending {
            self.close_deadline =
                Some(Instant::now() + self.config.timeouts.client_request_socket_timeout());
        } else {
            self.finish_closing_socket(None);
        }
    }

    /// Immediate close; every outstanding request fails.
    pub(super) fn force_close_socket(&mut self) {
        self.heartbeat.stop();
        let status = self.status();
        if status != ConnectionStatus::ForcedDisconnecting && status != ConnectionStatus::Disconnected {
            self.set_status(ConnectionStatus::ForcedDisconnecting);
        }
        if let Some(socket) = &self.socket {
            socket.inflight.reject_all(SocketError::socket_closed());
        }
        self.finish_closing_socket(None);
    }

    /// Completes a close once nothing but `received_response_to` is pending.
    pub(super) fn finish_closing_socket(&mut self, received_response_to: Option<u64>) {
        if let Some(socket) = &self.socket {
            if !socket.inflight.all_resolved_except(received_response_to) {
                debug!(
                    keyserver_id = %self.keyserver_id,
                    pending = socket.inflight.pending_count(),
                    "Deferring close until requests settle"
                );
                return;
            }
        }
        self.set_status(ConnectionStatus::Disconnected);
        self.drop_socket();
        info!(keyserver_id = %self.keyserver_id, "Socket closed");
        if std::mem::take(&mut self.reopen_after_close) && self.active {
            self.open_socket(ConnectionStatus::Connecting);
        }
    }

    /// Transport closed underneath us.
    fn on_close(&mut self) {
        let status = self.status();
        let Some(socket) = self.socket.take() else {
            return;
        };
        socket.inflight.reject_all(SocketError::socket_closed());
        self.heartbeat.stop();
        self.watchdog = None;
        self.close_deadline = None;
        info!(keyserver_id = %self.keyserver_id, %status, "Socket closed by transport");

        let handled = self.detect_unsupervised_background(true);
        if !handled && status != ConnectionStatus::Disconnected {
            self.set_status(ConnectionStatus::Disconnected);
        }
    }

    fn drop_socket(&mut self) {
        if let Some(socket) = self.socket.take() {
            if matches!(
                socket.transport.ready_state(),
                ReadyState::Connecting | ReadyState::Open
            ) {
                socket.transport.close();
            }
            socket.inflight.reject_all(SocketError::socket_closed());
        }
        self.heartbeat.stop();
        self.watchdog = None;
        self.close_deadline = None;
    }

    /// Detects a client that was backgrounded without being told: connected,
    /// silent past the server request timeout, yet the app was used within
    /// the recent-activity window.
    pub(super) fn detect_unsupervised_background(&mut self, already_closed: bool) -> bool {
        let now = Instant::now();
        if self.status() != ConnectionStatus::Connected || !self.heartbeat.is_silent(now) {
            return false;
        }
        let window = self.config.timeouts.recent_activity_window();
        if self
            .store
            .last_action_at()
            .is_some_and(|at| at + window < now)
        {
            return false;
        }

        info!(keyserver_id = %self.keyserver_id, "Unsupervised background detected");
        if !already_closed {
            self.drop_socket();
        }
        self.active = false;
        self.throttle.cancel();
        self.dispatch(Action::UnsupervisedBackground {
            keyserver_id: self.keyserver_id.clone(),
        });
        self.emit(ConnectionEvent::StatusChanged {
            keyserver_id: self.keyserver_id.clone(),
            status: ConnectionStatus::Disconnected,
        });
        self.emit(ConnectionEvent::UnsupervisedBackground {
            keyserver_id: self.keyserver_id.clone(),
        });
        true
    }
}

async fn next_transport_event(socket: &mut Option<ActiveSocket>) -> (u64, Option<TransportEvent>) {
    match socket {
        Some(socket) => (socket.generation, socket.events.recv().await),
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "tests/manager_tests.rs"]
mod tests;
