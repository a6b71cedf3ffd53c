use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::types::{ConnectionIssue, ConnectionStatus, KeyserverInfo};
use crate::protocol::{
    ActivityUpdate, ActivityUpdateResult, CalendarQuery, FullStateSync, IncrementalStateSync,
    LogInActionSource, PlatformDetails, PreRequestUserState, SessionChange, UpdatesPayload,
};

/// Application-level events. Most of them touch the keyserver store; the
/// rest are forwarded to action subscribers untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    AddKeyserver {
        keyserver_id: String,
        keyserver_info: KeyserverInfo,
    },
    RemoveKeyserver {
        keyserver_id: String,
    },
    UpdateConnectionStatus {
        keyserver_id: String,
        status: ConnectionStatus,
    },
    SetLateResponse {
        keyserver_id: String,
        message_id: i64,
        is_late: bool,
    },
    SetConnectionIssue {
        keyserver_id: String,
        connection_issue: Option<ConnectionIssue>,
    },
    SetSessionRecoveryInProgress {
        keyserver_id: String,
        in_progress: bool,
    },
    UpdateKeyserverReachability {
        keyserver_id: String,
        unreachable: bool,
    },
    SetNewSession {
        keyserver_id: String,
        session_change: SessionChange,
        #[serde(default)]
        pre_request_user_state: Option<PreRequestUserState>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        source: Option<LogInActionSource>,
    },
    FullStateSync {
        keyserver_id: String,
        payload: FullStateSync,
    },
    IncrementalStateSync {
        keyserver_id: String,
        payload: IncrementalStateSync,
    },
    ProcessUpdates {
        keyserver_id: String,
        payload: UpdatesPayload,
    },
    ProcessMessages {
        keyserver_id: String,
        payload: Value,
    },
    QueueActivityUpdates {
        keyserver_id: String,
        activity_updates: Vec<ActivityUpdate>,
    },
    UpdateActivitySuccess {
        /// Updates the server acknowledged, per keyserver.
        activity_updates: BTreeMap<String, Vec<ActivityUpdate>>,
        result: ActivityUpdateResult,
    },
    UpdateLastCommunicatedPlatformDetails {
        keyserver_id: String,
        platform_details: PlatformDetails,
    },
    SetDeviceTokens {
        device_tokens: BTreeMap<String, Option<String>>,
    },
    SetUrlPrefix {
        keyserver_id: String,
        url_prefix: String,
    },
    UnsupervisedBackground {
        keyserver_id: String,
    },
    ForcePolicyAcknowledgment {
        keyserver_id: String,
    },
    ResetUserState,
    KeyserverAuthSuccess {
        updates_current_as_of: BTreeMap<String, i64>,
        calendar_query: CalendarQuery,
        #[serde(default)]
        platform_details: Option<PlatformDetails>,
    },
    UpdateCalendarQuerySuccess {
        keyserver_ids: Vec<String>,
        calendar_query: CalendarQuery,
    },
    LogOut {
        default_calendar_query: CalendarQuery,
    },
    DeleteKeyserverAccount {
        keyserver_ids: Vec<String>,
        default_calendar_query: CalendarQuery,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::AddKeyserver { .. } => "add_keyserver",
            Action::RemoveKeyserver { .. } => "remove_keyserver",
            Action::UpdateConnectionStatus { .. } => "update_connection_status",
            Action::SetLateResponse { .. } => "set_late_response",
            Action::SetConnectionIssue { .. } => "set_connection_issue",
            Action::SetSessionRecoveryInProgress { .. } => "set_session_recovery_in_progress",
            Action::UpdateKeyserverReachability { .. } => "update_keyserver_reachability",
            Action::SetNewSession { .. } => "set_new_session",
            Action::FullStateSync { .. } => "full_state_sync",
            Action::IncrementalStateSync { .. } => "incremental_state_sync",
            Action::ProcessUpdates { .. } => "process_updates",
            Action::ProcessMessages { .. } => "process_messages",
            Action::QueueActivityUpdates { .. } => "queue_activity_updates",
            Action::UpdateActivitySuccess { .. } => "update_activity_success",
            Action::UpdateLastCommunicatedPlatformDetails { .. } => {
                "update_last_communicated_platform_details"
            }
            Action::SetDeviceTokens { .. } => "set_device_tokens",
            Action::SetUrlPrefix { .. } => "set_url_prefix",
            Action::UnsupervisedBackground { .. } => "unsupervised_background",
            Action::ForcePolicyAcknowledgment { .. } => "force_policy_acknowledgment",
            Action::ResetUserState => "reset_user_state",
            Action::KeyserverAuthSuccess { .. } => "keyserver_auth_success",
            Action::UpdateCalendarQuerySuccess { .. } => "update_calendar_query_success",
            Action::LogOut { .. } => "log_out",
            Action::DeleteKeyserverAccount { .. } => "delete_keyserver_account",
        }
    }

    /// The single keyserver this action targets, if any.
    pub fn keyserver_id(&self) -> Option<&str> {
        match self {
            Action::AddKeyserver { keyserver_id, .. }
            | Action::RemoveKeyserver { keyserver_id }
            | Action::UpdateConnectionStatus { keyserver_id, .. }
            | Action::SetLateResponse { keyserver_id, .. }
            | Action::SetConnectionIssue { keyserver_id, .. }
            | Action::SetSessionRecoveryInProgress { keyserver_id, .. }
            | Action::UpdateKeyserverReachability { keyserver_id, .. }
            | Action::SetNewSession { keyserver_id, .. }
            | Action::FullStateSync { keyserver_id, .. }
            | Action::IncrementalStateSync { keyserver_id, .. }
            | Action::ProcessUpdates { keyserver_id, .. }
            | Action::ProcessMessages { keyserver_id, .. }
            | Action::QueueActivityUpdates { keyserver_id, .. }
            | Action::UpdateLastCommunicatedPlatformDetails { keyserver_id, .. }
            | Action::SetUrlPrefix { keyserver_id, .. }
            | Action::UnsupervisedBackground { keyserver_id }
            | Action::ForcePolicyAcknowledgment { keyserver_id } => Some(keyserver_id),
            Action::UpdateActivitySuccess { .. }
            | Action::SetDeviceTokens { .. }
            | Action::ResetUserState
            | Action::KeyserverAuthSuccess { .. }
            | Action::UpdateCalendarQuerySuccess { .. }
            | Action::LogOut { .. }
            | Action::DeleteKeyserverAccount { .. } => None,
        }
    }
}
