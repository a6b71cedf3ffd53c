//! Collaborators the connection manager calls out to.

use std::sync::Arc;

use async_trait::async_trait;

use super::recovery::{NotificationsCrypto, SessionRecovery};
use crate::compression::{Decompressor, GzipDecompressor};
use crate::error::SocketError;
use crate::protocol::{CalendarQuery, ClientResponse, CurrentUserInfo, PlatformDetails, ServerRequest};
use crate::transport::TransportFactory;

/// Application state the handshake reads but the keyserver store does not
/// own.
pub trait ClientContext: Send + Sync {
    fn platform_details(&self) -> PlatformDetails;
    fn current_user_info(&self) -> Option<CurrentUserInfo>;
    /// Calendar range currently shown, before per-keyserver filtering.
    fn calendar_query(&self) -> Option<CalendarQuery>;
    fn messages_current_as_of(&self, keyserver_id: &str) -> i64;
    fn watched_ids(&self) -> Vec<String>;
    fn session_id(&self, keyserver_id: &str) -> Option<String>;
    /// A frozen client never opens sockets.
    fn frozen(&self) -> bool;
    /// Set right after the user acknowledged policies, until data arrives.
    fn no_data_after_policy_acknowledgment(&self) -> bool;
}

/// Fixed-value [`ClientContext`] for embedders without live app state.
#[derive(Debug, Clone)]
pub struct StaticClientContext {
    pub platform_details: PlatformDetails,
    pub current_user_info: Option<CurrentUserInfo>,
    pub calendar_query: Option<CalendarQuery>,
    pub messages_current_as_of: i64,
    pub watched_ids: Vec<String>,
    pub session_id: Option<String>,
    pub frozen: bool,
    pub no_data_after_policy_acknowledgment: bool,
}

impl StaticClientContext {
    pub fn new(platform_details: PlatformDetails) -> Self {
        Self {
            platform_details,
            current_user_info: None,
            calendar_query: None,
            messages_current_as_of: 0,
            watched_ids: Vec::new(),
            session_id: None,
            frozen: false,
            no_data_after_policy_acknowledgment: false,
        }
    }
}

impl ClientContext for StaticClientContext {
    fn platform_details(&self) -> PlatformDetails {
        self.platform_details.clone()
    }

    fn current_user_info(&self) -> Option<CurrentUserInfo> {
        self.current_user_info.clone()
    }

    fn calendar_query(&self) -> Option<CalendarQuery> {
        self.calendar_query.clone()
    }

    fn messages_current_as_of(&self, _keyserver_id: &str) -> i64 {
        self.messages_current_as_of
    }

    fn watched_ids(&self) -> Vec<String> {
        self.watched_ids.clone()
    }

    fn session_id(&self, _keyserver_id: &str) -> Option<String> {
        self.session_id.clone()
    }

    fn frozen(&self) -> bool {
        self.frozen
    }

    fn no_data_after_policy_acknowledgment(&self) -> bool {
        self.no_data_after_policy_acknowledgment
    }
}

/// Answers server-initiated REQUESTS.
#[async_trait]
pub trait ClientResponder: Send + Sync {
    async fn respond(&self, keyserver_id: &str, requests: &[ServerRequest]) -> Vec<ClientResponse>;
}

/// Answers platform detail requests and ignores the rest.
pub struct PlatformDetailsResponder {
    context: Arc<dyn ClientContext>,
}

impl PlatformDetailsResponder {
    pub fn new(context: Arc<dyn ClientContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl ClientResponder for PlatformDetailsResponder {
    async fn respond(&self, _keyserver_id: &str, requests: &[ServerRequest]) -> Vec<ClientResponse> {
        requests
            .iter()
            .filter_map(|request| match request {
                ServerRequest::PlatformDetails => {
                    Some(ClientResponse::PlatformDetails(self.context.platform_details()))
                }
                _ => None,
            })
            .collect()
    }
}

/// Breaks a handshake crash loop after policy acknowledgment, typically by
/// refetching the session over HTTP.
#[async_trait]
pub trait CrashLoopRecovery: Send + Sync {
    async fn recover(&self, keyserver_id: &str) -> Result<(), SocketError>;
}

/// Everything a connection manager needs besides config and the store.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub transport_factory: Arc<dyn TransportFactory>,
    pub context: Arc<dyn ClientContext>,
    pub decompressor: Arc<dyn Decompressor>,
    pub responder: Arc<dyn ClientResponder>,
    pub session_recovery: Option<Arc<dyn SessionRecovery>>,
    pub notifications_crypto: Option<Arc<dyn NotificationsCrypto>>,
    pub crash_loop_recovery: Option<Arc<dyn CrashLoopRecovery>>,
}

impl ConnectionDeps {
    pub fn new(
        transport_factory: Arc<dyn TransportFactory>,
        context: Arc<dyn ClientContext>,
    ) -> Self {
        Self {
            transport_factory,
            responder: Arc::new(PlatformDetailsResponder::new(context.clone())),
            context,
            decompressor: Arc::new(GzipDecompressor),
            session_recovery: None,
            notifications_crypto: None,
            crash_loop_recovery: None,
        }
    }

    pub fn with_responder(mut self, responder: Arc<dyn ClientResponder>) -> Self {
        self.responder = responder;
        self
    }

    pub fn with_decompressor(mut self, decompressor: Arc<dyn Decompressor>) -> Self {
        self.decompressor = decompressor;
        self
    }

    pub fn with_session_recovery(mut self, recovery: Arc<dyn SessionRecovery>) -> Self {
        self.session_recovery = Some(recovery);
        self
    }

    pub fn with_notifications_crypto(mut self, crypto: Arc<dyn NotificationsCrypto>) -> Self {
        self.notifications_crypto = Some(crypto);
        self
    }

    pub fn with_crash_loop_recovery(mut self, recovery: Arc<dyn CrashLoopRecovery>) -> Self {
        self.crash_loop_recovery = Some(recovery);
        self
    }
}
