//! Error taxonomy shared by the connection components.

use serde_json::Value;
use thiserror::Error;

use crate::protocol::ServerMessageKind;

/// Server error code sent when the session cookie is no longer valid.
pub const NOT_LOGGED_IN: &str = "not_logged_in";
/// Catch-all server error code; retried once during the handshake.
pub const UNKNOWN_ERROR: &str = "unknown_error";
/// Sent when the user has outstanding policies to acknowledge.
pub const POLICIES_NOT_ACCEPTED: &str = "policies_not_accepted";

/// Failure of a socket-level operation.
///
/// `Clone` so a single teardown can reject every outstanding await.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SocketError {
    #[error("timed out waiting for {expected}")]
    Timeout { expected: ServerMessageKind },

    #[error("socket is offline: {0}")]
    TransportOffline(String),

    #[error("server error: {code}")]
    ServerError { code: String, payload: Option<Value> },

    #[error("session invalidated by the server")]
    AuthInvalidation,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("{0}")]
    Closed(String),

    #[error("unknown keyserver {0}")]
    UnknownKeyserver(String),
}

impl SocketError {
    pub fn server_code(&self) -> Option<&str> {
        match self {
            SocketError::ServerError { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Timeouts and offline failures are never retried by the handshake.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            SocketError::Timeout { .. } | SocketError::TransportOffline(_)
        )
    }

    pub(crate) fn socket_closed() -> Self {
        SocketError::Closed("socket closed".to_string())
    }
}
