//! Session-level data carried inside socket messages.

use serde::{Deserialize, Serialize};

/// Separates the keyserver id from the local thread id in a qualified
/// thread id such as `256|8472`.
const THREAD_ID_SEPARATOR: char = '|';

/// Credentials captured when the socket connects.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionIdentification {
    pub cookie: Option<String>,
    pub session_id: Option<String>,
}

/// Client-side view of the data the server should bring up to date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub calendar_query: CalendarQuery,
    pub messages_current_as_of: i64,
    pub updates_current_as_of: i64,
    pub watched_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalendarFilter {
    NotDeleted,
    ThreadList { thread_ids: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarQuery {
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub filters: Vec<CalendarFilter>,
}

impl CalendarQuery {
    pub fn new(start_date: impl Into<String>, end_date: impl Into<String>) -> Self {
        Self {
            start_date: start_date.into(),
            end_date: end_date.into(),
            filters: vec![CalendarFilter::NotDeleted],
        }
    }

    /// Restricts thread-list filters to the threads owned by `keyserver_id`.
    ///
    /// Unqualified thread ids belong to the home keyserver. A thread-list
    /// filter left empty is dropped entirely.
    pub fn for_keyserver(&self, keyserver_id: &str, home_keyserver_id: &str) -> Self {
        let filters = self
            .filters
            .iter()
            .filter_map(|filter| match filter {
                CalendarFilter::ThreadList { thread_ids } => {
                    let owned: Vec<String> = thread_ids
                        .iter()
                        .filter(|id| {
                            thread_keyserver(id).unwrap_or(home_keyserver_id) == keyserver_id
                        })
                        .cloned()
                        .collect();
                    if owned.is_empty() {
                        None
                    } else {
                        Some(CalendarFilter::ThreadList { thread_ids: owned })
                    }
                }
                other => Some(other.clone()),
            })
            .collect();
        Self {
            start_date: self.start_date.clone(),
            end_date: self.end_date.clone(),
            filters,
        }
    }

    /// The same query with every thread-list filter removed.
    pub fn non_thread_filters(&self) -> Self {
        Self {
            start_date: self.start_date.clone(),
            end_date: self.end_date.clone(),
            filters: self
                .filters
                .iter()
                .filter(|f| !matches!(f, CalendarFilter::ThreadList { .. }))
                .cloned()
                .collect(),
        }
    }
}

/// The keyserver half of a qualified thread id, if present.
pub fn thread_keyserver(thread_id: &str) -> Option<&str> {
    thread_id
        .split_once(THREAD_ID_SEPARATOR)
        .map(|(keyserver, _)| keyserver)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformDetails {
    pub platform: String,
    #[serde(default)]
    pub code_version: Option<u32>,
    #[serde(default)]
    pub state_version: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUserInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub anonymous: bool,
}

impl CurrentUserInfo {
    pub fn logged_in(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            username: Some(username.into()),
            anonymous: false,
        }
    }

    pub fn anonymous() -> Self {
        Self {
            id: None,
            username: None,
            anonymous: true,
        }
    }

    /// Identity used to detect account downgrades: the user id, or `None`
    /// for an anonymous session.
    pub fn identity(&self) -> Option<&str> {
        if self.anonymous {
            None
        } else {
            self.id.as_deref()
        }
    }
}

/// User state captured before a request so a later session change can be
/// attributed to it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PreRequestUserState {
    pub current_user_info: Option<CurrentUserInfo>,
    pub cookie: Option<String>,
    pub session_id: Option<String>,
}

/// Session replacement announced by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionChange {
    pub cookie_invalidated: bool,
    #[serde(default)]
    pub cookie: Option<String>,
    #[serde(default)]
    pub current_user_info: Option<CurrentUserInfo>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogInActionSource {
    SocketAuthErrorResolutionAttempt,
    SocketNotLoggedIn,
    KeyserverAuth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityUpdate {
    pub thread_id: String,
    pub focus: bool,
    #[serde(default)]
    pub latest_message: Option<String>,
}

/// Server answer to a batch of activity updates.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActivityUpdateResult {
    #[serde(default)]
    pub unfocused_to_unread: Vec<String>,
}
