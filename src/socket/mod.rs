//! Client side of the keyserver socket: one long-lived connection per
//! keyserver, driven by a [`ConnectionHandle`].

pub mod context;
pub mod handle;
pub mod heartbeat;
pub mod inflight;
mod manager;
mod messages;
pub mod recovery;
pub mod sender;
pub mod state_sync;
pub mod throttle;

#[cfg(test)]
mod test_support;

pub use context::{
    ClientContext, ClientResponder, ConnectionDeps, CrashLoopRecovery, PlatformDetailsResponder,
    StaticClientContext,
};
pub use handle::{ConnectionEvent, ConnectionHandle};
pub use heartbeat::HeartbeatMonitor;
pub use inflight::{InflightEvent, InflightRequests, InflightTimeouts, PendingResponse};
pub use messages::UPDATE_ACTIVITY_ENDPOINT;
pub use recovery::{
    NotificationsCrypto, RecoveryOutcome, RecoveryRequest, SessionRecovery,
    SessionRecoveryCoordinator,
};
pub use sender::SocketSender;
pub use state_sync::{Handshake, HandshakeOutcome, InitialMessage, SyncKind};
pub use throttle::ReconnectThrottle;
