//! Wire protocol spoken over the keyserver socket.
//!
//! Every frame is a JSON object tagged by `type`. Client frames carry a
//! client-assigned `id`; server replies echo it back as `response_to`.

pub mod client;
pub mod server;
pub mod session;

pub use client::{
    AckUpdatesPayload, ApiRequestPayload, ClientMessageBody, ClientResponse, ClientSocketMessage,
    InitialPayload, ResponsesPayload,
};
pub use server::{
    parse_server_message, FullStateSync, IncrementalStateSync, RequestsPayload, ServerMessageKind,
    ServerRequest, ServerSocketMessage, StateSyncPayload, UpdateInfo, UpdateType, UpdatesPayload,
    UpdatesResult,
};
pub use session::{
    ActivityUpdate, ActivityUpdateResult, CalendarFilter, CalendarQuery, CurrentUserInfo,
    LogInActionSource, PlatformDetails, PreRequestUserState, SessionChange,
    SessionIdentification, SessionState,
};

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
