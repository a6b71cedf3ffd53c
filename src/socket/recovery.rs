//! Reaction to AUTH_ERROR: try to log back in with stored native
//! credentials, otherwise publish the invalidation.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::SocketError;
use crate::keyserver::{Action, KeyserverStoreHandle};
use crate::protocol::{LogInActionSource, PreRequestUserState, SessionChange};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRequest {
    pub keyserver_id: String,
    pub cookie: Option<String>,
    pub url_prefix: String,
    pub source: LogInActionSource,
    pub initial_notifications_encrypted_message: Option<String>,
}

/// Re-authenticates with stored credentials. `Ok(None)` means there was
/// nothing to recover with.
#[async_trait]
pub trait SessionRecovery: Send + Sync {
    async fn resolve_session_invalidation(
        &self,
        request: RecoveryRequest,
    ) -> Result<Option<SessionChange>, SocketError>;
}

/// Produces the encrypted notification payload sent with a login attempt.
#[async_trait]
pub trait NotificationsCrypto: Send + Sync {
    async fn initial_encrypted_message(&self, keyserver_id: &str) -> Result<String, SocketError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered,
    Invalidated { downgrade: bool },
}

/// A session change that logs out or swaps the account the client started
/// with. Those are never papered over by a silent re-login.
pub fn is_downgrade(
    pre_request_user_state: Option<&PreRequestUserState>,
    session_change: &SessionChange,
) -> bool {
    let before = pre_request_user_state.and_then(|state| state.current_user_info.as_ref());
    match (before, session_change.current_user_info.as_ref()) {
        (Some(before), Some(after)) => before.identity() != after.identity(),
        _ => false,
    }
}

pub struct SessionRecoveryCoordinator {
    keyserver_id: String,
    store: KeyserverStoreHandle,
    recovery: Option<Arc<dyn SessionRecovery>>,
    crypto: Option<Arc<dyn NotificationsCrypto>>,
}

impl SessionRecoveryCoordinator {
    pub fn new(
        keyserver_id: impl Into<String>,
        store: KeyserverStoreHandle,
        recovery: Option<Arc<dyn SessionRecovery>>,
        crypto: Option<Arc<dyn NotificationsCrypto>>,
    ) -> Self {
        Self {
            keyserver_id: keyserver_id.into(),
            store,
            recovery,
            crypto,
        }
    }

    pub async fn handle_auth_error(
        &self,
        session_change: SessionChange,
        pre_request_user_state: Option<PreRequestUserState>,
    ) -> RecoveryOutcome {
        self.set_in_progress(true);
        let downgrade = is_downgrade(pre_request_user_state.as_ref(), &session_change);
        let recovered = if downgrade {
            info!(keyserver_id = %self.keyserver_id, "Session downgraded by the server; not recovering");
            None
        } else {
            self.attempt_recovery(&session_change).await
        };

        let outcome = match recovered {
            Some(new_session) => {
                self.publish(new_session, pre_request_user_state);
                RecoveryOutcome::Recovered
            }
            None => {
                self.publish(
                    SessionChange {
                        cookie_invalidated: true,
                        ..session_change
                    },
                    pre_request_user_state,
                );
                RecoveryOutcome::Invalidated { downgrade }
            }
        };
        self.set_in_progress(false);
        outcome
    }

    async fn attempt_recovery(&self, session_change: &SessionChange) -> Option<SessionChange> {
        let recovery = self.recovery.as_ref()?;
        let info = self.store.keyserver_info(&self.keyserver_id)?;
        let initial_notifications_encrypted_message = match &self.crypto {
            Some(crypto) => match crypto.initial_encrypted_message(&self.keyserver_id).await {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(keyserver_id = %self.keyserver_id, "Could not encrypt initial notification: {}", e);
                    None
                }
            },
            None => None,
        };
        let request = RecoveryRequest {
            keyserver_id: self.keyserver_id.clone(),
            cookie: session_change.cookie.clone().or(info.cookie),
            url_prefix: info.url_prefix,
            source: LogInActionSource::SocketAuthErrorResolutionAttempt,
            initial_notifications_encrypted_message,
        };
        match recovery.resolve_session_invalidation(request).await {
            Ok(Some(change)) => {
                info!(keyserver_id = %self.keyserver_id, "Recovered invalidated session");
                Some(change)
            }
            Ok(None) => {
                debug!(keyserver_id = %self.keyserver_id, "No credentials to recover session with");
                None
            }
            Err(e) => {
                warn!(keyserver_id = %self.keyserver_id, "Session recovery failed: {}", e);
                None
            }
        }
    }

    fn publish(&self, session_change: SessionChange, pre_request_user_state: Option<PreRequestUserState>) {
        self.store.dispatch(Action::SetNewSession {
            keyserver_id: self.keyserver_id.clone(),
            session_change,
            pre_request_user_state,
            error: None,
            source: Some(LogInActionSource::SocketAuthErrorResolutionAttempt),
        });
    }

    fn set_in_progress(&self, in_progress: bool) {
        self.store.dispatch(Action::SetSessionRecoveryInProgress {
            keyserver_id: self.keyserver_id.clone(),
            in_progress,
        });
    }
}

#[cfg(test)]
#[path = "tests/recovery_tests.rs"]
mod tests;
