//! Messages sent from the client to the keyserver.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::session::{ActivityUpdate, PlatformDetails, SessionIdentification, SessionState};

/// Answer to a server-initiated request, or an unsolicited report that rides
/// along with INITIAL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientResponse {
    PlatformDetails(PlatformDetails),
    InitialActivityUpdates(Vec<ActivityUpdate>),
    CheckState(Value),
    MoreOneTimeKeys(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialPayload {
    pub session_identification: SessionIdentification,
    pub session_state: SessionState,
    pub client_responses: Vec<ClientResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsesPayload {
    pub client_responses: Vec<ClientResponse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckUpdatesPayload {
    pub current_as_of: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequestPayload {
    pub endpoint: String,
    pub input: Value,
}

/// A client message as it goes on the wire, with its correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientSocketMessage {
    Initial { id: u64, payload: InitialPayload },
    Responses { id: u64, payload: ResponsesPayload },
    Ping { id: u64 },
    AckUpdates { id: u64, payload: AckUpdatesPayload },
    ApiRequest { id: u64, payload: ApiRequestPayload },
}

impl ClientSocketMessage {
    pub fn id(&self) -> u64 {
        match self {
            ClientSocketMessage::Initial { id, .. }
            | ClientSocketMessage::Responses { id, .. }
            | ClientSocketMessage::Ping { id }
            | ClientSocketMessage::AckUpdates { id, .. }
            | ClientSocketMessage::ApiRequest { id, .. } => *id,
        }
    }
}

/// A client message before an id has been assigned to it.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessageBody {
    Initial(InitialPayload),
    Responses(ResponsesPayload),
    Ping,
    AckUpdates(AckUpdatesPayload),
    ApiRequest(ApiRequestPayload),
}

impl ClientMessageBody {
    pub fn with_id(self, id: u64) -> ClientSocketMessage {
        match self {
            ClientMessageBody::Initial(payload) => ClientSocketMessage::Initial { id, payload },
            ClientMessageBody::Responses(payload) => ClientSocketMessage::Responses { id, payload },
            ClientMessageBody::Ping => ClientSocketMessage::Ping { id },
            ClientMessageBody::AckUpdates(payload) => {
                ClientSocketMessage::AckUpdates { id, payload }
            }
            ClientMessageBody::ApiRequest(payload) => {
                ClientSocketMessage::ApiRequest { id, payload }
            }
        }
    }
}
