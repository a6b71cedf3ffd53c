use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol::{ActivityUpdate, CalendarQuery, PlatformDetails};

/// Request id recorded in `late_responses` when the handshake itself is late.
pub const HANDSHAKE_LATE_ID: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    ForcedDisconnecting,
    #[default]
    Disconnected,
}

impl ConnectionStatus {
    /// Statuses in which a handshake is underway.
    pub fn is_opening(self) -> bool {
        matches!(self, ConnectionStatus::Connecting | ConnectionStatus::Reconnecting)
    }

    pub fn is_closing(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Disconnecting | ConnectionStatus::ForcedDisconnecting
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Disconnecting => "disconnecting",
            ConnectionStatus::ForcedDisconnecting => "forced_disconnecting",
            ConnectionStatus::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Persistent problem surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionIssue {
    NotLoggedInError,
    PolicyAcknowledgementSocketCrashLoop,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub status: ConnectionStatus,
    #[serde(default)]
    pub queued_activity_updates: Vec<ActivityUpdate>,
    /// Ids of requests flagged late, kept sorted and unique.
    #[serde(default)]
    pub late_responses: Vec<i64>,
    #[serde(default)]
    pub connection_issue: Option<ConnectionIssue>,
    #[serde(default)]
    pub session_recovery_in_progress: bool,
    #[serde(default)]
    pub unreachable: bool,
}

impl ConnectionInfo {
    pub fn with_status(mut self, status: ConnectionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_late_response(mut self, message_id: i64, is_late: bool) -> Self {
        match (self.late_responses.binary_search(&message_id), is_late) {
            (Err(pos), true) => self.late_responses.insert(pos, message_id),
            (Ok(pos), false) => {
                self.late_responses.remove(pos);
            }
            _ => {}
        }
        self
    }

    pub fn without_late_responses(mut self) -> Self {
        self.late_responses.clear();
        self
    }

    pub fn with_connection_issue(mut self, issue: Option<ConnectionIssue>) -> Self {
        self.connection_issue = issue;
        self
    }

    pub fn with_session_recovery_in_progress(mut self, in_progress: bool) -> Self {
        self.session_recovery_in_progress = in_progress;
        self
    }

    pub fn with_queued_activity_updates(mut self, updates: Vec<ActivityUpdate>) -> Self {
        self.queued_activity_updates = updates;
        self
    }

    pub fn with_unreachable(mut self, unreachable: bool) -> Self {
        self.unreachable = unreachable;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyserverInfo {
    pub connection: ConnectionInfo,
    #[serde(default)]
    pub cookie: Option<String>,
    pub url_prefix: String,
    #[serde(default)]
    pub device_token: Option<String>,
    #[serde(default)]
    pub updates_current_as_of: i64,
    pub actualized_calendar_query: CalendarQuery,
    #[serde(default)]
    pub last_communicated_platform_details: Option<PlatformDetails>,
}

impl KeyserverInfo {
    pub fn new(url_prefix: impl Into<String>, calendar_query: CalendarQuery) -> Self {
        Self {
            connection: ConnectionInfo::default(),
            cookie: None,
            url_prefix: url_prefix.into(),
            device_token: None,
            updates_current_as_of: 0,
            actualized_calendar_query: calendar_query,
            last_communicated_platform_details: None,
        }
    }

    /// Only cookies of logged-in sessions authenticate a socket.
    pub fn has_user_cookie(&self) -> bool {
        self.cookie
            .as_deref()
            .is_some_and(|cookie| cookie.starts_with("user="))
    }

    pub fn with_connection(mut self, connection: ConnectionInfo) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_cookie(mut self, cookie: Option<String>) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn with_url_prefix(mut self, url_prefix: impl Into<String>) -> Self {
        self.url_prefix = url_prefix.into();
        self
    }

    pub fn with_device_token(mut self, device_token: Option<String>) -> Self {
        self.device_token = device_token;
        self
    }

    pub fn with_updates_current_as_of(mut self, current_as_of: i64) -> Self {
        self.updates_current_as_of = current_as_of;
        self
    }

    pub fn with_calendar_query(mut self, query: CalendarQuery) -> Self {
        self.actualized_calendar_query = query;
        self
    }

    pub fn with_platform_details(mut self, details: Option<PlatformDetails>) -> Self {
        self.last_communicated_platform_details = details;
        self
    }

    /// Applies `f` to the connection info.
    pub fn map_connection(mut self, f: impl FnOnce(ConnectionInfo) -> ConnectionInfo) -> Self {
        self.connection = f(self.connection);
        self
    }
}
