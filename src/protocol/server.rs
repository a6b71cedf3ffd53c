//! Messages sent from the keyserver to the client.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::session::{ActivityUpdateResult, CalendarQuery, CurrentUserInfo, SessionChange};
use crate::compression::Decompressor;
use crate::error::SocketError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerSocketMessage {
    StateSync {
        response_to: u64,
        payload: StateSyncPayload,
    },
    Requests {
        #[serde(default)]
        response_to: Option<u64>,
        payload: RequestsPayload,
    },
    Error {
        #[serde(default)]
        response_to: Option<u64>,
        message: String,
        #[serde(default)]
        payload: Option<Value>,
    },
    AuthError {
        #[serde(default)]
        response_to: Option<u64>,
        message: String,
        session_change: SessionChange,
    },
    ActivityUpdateResponse {
        response_to: u64,
        payload: ActivityUpdateResult,
    },
    Pong {
        response_to: u64,
    },
    Updates {
        payload: UpdatesPayload,
    },
    Messages {
        payload: Value,
    },
    ApiResponse {
        response_to: u64,
        payload: Value,
    },
    CompressedMessage {
        payload: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessageKind {
    StateSync,
    Requests,
    Error,
    AuthError,
    ActivityUpdateResponse,
    Pong,
    Updates,
    Messages,
    ApiResponse,
    CompressedMessage,
}

impl ServerMessageKind {
    /// Whether messages of this kind can answer a specific client request.
    pub fn carries_response_id(self) -> bool {
        !matches!(
            self,
            ServerMessageKind::Updates
                | ServerMessageKind::Messages
                | ServerMessageKind::CompressedMessage
        )
    }
}

impl fmt::Display for ServerMessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerMessageKind::StateSync => "STATE_SYNC",
            ServerMessageKind::Requests => "REQUESTS",
            ServerMessageKind::Error => "ERROR",
            ServerMessageKind::AuthError => "AUTH_ERROR",
            ServerMessageKind::ActivityUpdateResponse => "ACTIVITY_UPDATE_RESPONSE",
            ServerMessageKind::Pong => "PONG",
            ServerMessageKind::Updates => "UPDATES",
            ServerMessageKind::Messages => "MESSAGES",
            ServerMessageKind::ApiResponse => "API_RESPONSE",
            ServerMessageKind::CompressedMessage => "COMPRESSED_MESSAGE",
        };
        f.write_str(name)
    }
}

impl ServerSocketMessage {
    pub fn kind(&self) -> ServerMessageKind {
        match self {
            ServerSocketMessage::StateSync { .. } => ServerMessageKind::StateSync,
            ServerSocketMessage::Requests { .. } => ServerMessageKind::Requests,
            ServerSocketMessage::Error { .. } => ServerMessageKind::Error,
            ServerSocketMessage::AuthError { .. } => ServerMessageKind::AuthError,
            ServerSocketMessage::ActivityUpdateResponse { .. } => {
                ServerMessageKind::ActivityUpdateResponse
            }
            ServerSocketMessage::Pong { .. } => ServerMessageKind::Pong,
            ServerSocketMessage::Updates { .. } => ServerMessageKind::Updates,
            ServerSocketMessage::Messages { .. } => ServerMessageKind::Messages,
            ServerSocketMessage::ApiResponse { .. } => ServerMessageKind::ApiResponse,
            ServerSocketMessage::CompressedMessage { .. } => ServerMessageKind::CompressedMessage,
        }
    }

    pub fn response_to(&self) -> Option<u64> {
        match self {
            ServerSocketMessage::StateSync { response_to, .. }
            | ServerSocketMessage::ActivityUpdateResponse { response_to, .. }
            | ServerSocketMessage::Pong { response_to }
            | ServerSocketMessage::ApiResponse { response_to, .. } => Some(*response_to),
            ServerSocketMessage::Requests { response_to, .. }
            | ServerSocketMessage::Error { response_to, .. }
            | ServerSocketMessage::AuthError { response_to, .. } => *response_to,
            ServerSocketMessage::Updates { .. }
            | ServerSocketMessage::Messages { .. }
            | ServerSocketMessage::CompressedMessage { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateSyncPayload {
    Full(FullStateSync),
    Incremental(IncrementalStateSync),
}

impl StateSyncPayload {
    /// Checkpoint to acknowledge once the sync has been applied.
    pub fn checkpoint(&self) -> i64 {
        match self {
            StateSyncPayload::Full(full) => full.updates_current_as_of,
            StateSyncPayload::Incremental(inc) => inc.updates_result.current_as_of,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullStateSync {
    #[serde(default)]
    pub message_infos: Value,
    #[serde(default)]
    pub thread_infos: Value,
    #[serde(default)]
    pub user_infos: Value,
    #[serde(default)]
    pub entry_infos: Value,
    pub current_user_info: CurrentUserInfo,
    pub updates_current_as_of: i64,
    #[serde(default)]
    pub calendar_query: Option<CalendarQuery>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementalStateSync {
    pub updates_result: UpdatesResult,
    #[serde(default)]
    pub delta_entry_infos: Value,
    #[serde(default)]
    pub delete_entry_ids: Vec<String>,
    #[serde(default)]
    pub user_infos: Value,
    #[serde(default)]
    pub calendar_query: Option<CalendarQuery>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatesResult {
    #[serde(default)]
    pub new_updates: Vec<UpdateInfo>,
    pub current_as_of: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatesPayload {
    pub updates_result: UpdatesResult,
    #[serde(default)]
    pub user_infos: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    BadDeviceToken,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateInfo {
    #[serde(rename = "type")]
    pub kind: UpdateType,
    #[serde(default)]
    pub device_token: Option<String>,
    #[serde(flatten)]
    pub details: serde_json::Map<String, Value>,
}

impl UpdatesResult {
    /// Whether the batch reports `device_token` as rejected by the push
    /// provider.
    pub fn invalidates_device_token(&self, device_token: &str) -> bool {
        self.new_updates.iter().any(|update| {
            update.kind == UpdateType::BadDeviceToken
                && update.device_token.as_deref() == Some(device_token)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerRequest {
    PlatformDetails,
    CheckState {
        #[serde(default)]
        hashes_to_check: Value,
    },
    MoreOneTimeKeys,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestsPayload {
    #[serde(default)]
    pub server_requests: Vec<ServerRequest>,
}

/// Decodes one inbound frame, unwrapping a COMPRESSED_MESSAGE envelope.
pub fn parse_server_message(
    raw: &str,
    decompressor: &dyn Decompressor,
) -> Result<ServerSocketMessage, SocketError> {
    let message: ServerSocketMessage = serde_json::from_str(raw)
        .map_err(|e| SocketError::MalformedMessage(format!("invalid server message: {}", e)))?;
    match message {
        ServerSocketMessage::CompressedMessage { payload } => {
            let inner = decompressor.decompress(&payload)?;
            let unwrapped: ServerSocketMessage = serde_json::from_str(&inner).map_err(|e| {
                SocketError::MalformedMessage(format!("invalid compressed message: {}", e))
            })?;
            if unwrapped.kind() == ServerMessageKind::CompressedMessage {
                return Err(SocketError::MalformedMessage(
                    "nested compressed message".to_string(),
                ));
            }
            Ok(unwrapped)
        }
        other => Ok(other),
    }
}
