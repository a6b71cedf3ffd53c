//! Translates actions into keyserver store operations.

use tracing::warn;

use super::actions::Action;
use super::store_ops::{process_store_operations, KeyserverStore, KeyserverStoreOperation};
use super::types::{ConnectionStatus, KeyserverInfo};
use crate::protocol::{ActivityUpdate, CalendarQuery};

/// Result of reducing one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReducedStore {
    pub store: KeyserverStore,
    pub operations: Vec<KeyserverStoreOperation>,
}

/// Computes the operations `action` implies and applies them to `state`.
pub fn reduce_keyserver_store(
    state: &KeyserverStore,
    action: &Action,
    home_keyserver_id: &str,
) -> ReducedStore {
    let operations = operations_for(state, action, home_keyserver_id);
    ReducedStore {
        store: process_store_operations(state, &operations),
        operations,
    }
}

fn operations_for(
    state: &KeyserverStore,
    action: &Action,
    home_keyserver_id: &str,
) -> Vec<KeyserverStoreOperation> {
    // Replaces one existing keyserver with `f(info)`; absent ids yield nothing.
    let update = |keyserver_id: &str, f: &dyn Fn(KeyserverInfo) -> KeyserverInfo| {
        match state.get(keyserver_id) {
            Some(info) => vec![KeyserverStoreOperation::replace(
                keyserver_id,
                f(info.clone()),
            )],
            None => {
                warn!(
                    keyserver_id,
                    action = action.name(),
                    "Action targets a keyserver that is not in the store"
                );
                Vec::new()
            }
        }
    };

    match action {
        Action::AddKeyserver {
            keyserver_id,
            keyserver_info,
        } => vec![KeyserverStoreOperation::replace(
            keyserver_id.as_str(),
            keyserver_info.clone(),
        )],

        Action::RemoveKeyserver { keyserver_id } => vec![KeyserverStoreOperation::RemoveKeyservers {
            ids: vec![keyserver_id.clone()],
        }],

        Action::ResetUserState => state
            .keyserver_infos
            .iter()
            .filter(|(_, info)| {
                !info
                    .cookie
                    .as_deref()
                    .is_some_and(|cookie| cookie.starts_with("anonymous="))
            })
            .map(|(id, info)| {
                KeyserverStoreOperation::replace(id.as_str(), info.clone().with_cookie(None))
            })
            .collect(),

        Action::SetNewSession {
            keyserver_id,
            session_change,
            ..
        } => {
            let Some(existing) = state.get(keyserver_id) else {
                if session_change
                    .cookie
                    .as_deref()
                    .is_some_and(|c| c.starts_with("user="))
                {
                    warn!(
                        keyserver_id = keyserver_id.as_str(),
                        "Received a user cookie for a keyserver that is not in the store"
                    );
                }
                return Vec::new();
            };
            let got_user_cookie = session_change
                .cookie
                .as_deref()
                .is_some_and(|c| c.starts_with("user="));
            let mut info = existing.clone();
            let mut changed = false;
            if session_change.cookie.is_some() || session_change.cookie_invalidated {
                info = info.with_cookie(session_change.cookie.clone());
                changed = true;
            }
            if session_change.cookie_invalidated {
                let query = info.actualized_calendar_query.non_thread_filters();
                info = info
                    .with_calendar_query(query)
                    .map_connection(|c| c.with_queued_activity_updates(Vec::new()));
                changed = true;
            }
            if existing.connection.session_recovery_in_progress
                && (got_user_cookie || session_change.cookie_invalidated)
            {
                info = info.map_connection(|c| c.with_session_recovery_in_progress(false));
                changed = true;
            }
            if changed {
                vec![KeyserverStoreOperation::replace(keyserver_id.as_str(), info)]
            } else {
                Vec::new()
            }
        }

        Action::KeyserverAuthSuccess {
            updates_current_as_of,
            calendar_query,
            platform_details,
        } => updates_current_as_of
            .iter()
            .filter_map(|(id, current_as_of)| {
                let info = state.get(id)?;
                let query = calendar_query.for_keyserver(id, home_keyserver_id);
                Some(KeyserverStoreOperation::replace(
                    id.as_str(),
                    info.clone()
                        .with_updates_current_as_of(*current_as_of)
                        .with_calendar_query(query)
                        .with_platform_details(platform_details.clone())
                        .map_connection(|c| c.with_connection_issue(None)),
                ))
            })
            .collect(),

        Action::FullStateSync {
            keyserver_id,
            payload,
        } => update(keyserver_id, &|info| {
            let query = payload
                .calendar_query
                .clone()
                .unwrap_or_else(|| info.actualized_calendar_query.clone());
            info.with_calendar_query(query)
                .with_updates_current_as_of(payload.updates_current_as_of)
        }),

        Action::IncrementalStateSync {
            keyserver_id,
            payload,
        } => update(keyserver_id, &|info| {
            let token_invalidated = info
                .device_token
                .as_deref()
                .is_some_and(|token| payload.updates_result.invalidates_device_token(token));
            let device_token = if token_invalidated {
                None
            } else {
                info.device_token.clone()
            };
            let query = payload
                .calendar_query
                .clone()
                .unwrap_or_else(|| info.actualized_calendar_query.clone());
            info.with_updates_current_as_of(payload.updates_result.current_as_of)
                .with_device_token(device_token)
                .with_calendar_query(query)
        }),

        Action::ProcessUpdates {
            keyserver_id,
            payload,
        } => update(keyserver_id, &|info| {
            let current_as_of = info
                .updates_current_as_of
                .max(payload.updates_result.current_as_of);
            info.with_updates_current_as_of(current_as_of)
        }),

        Action::SetUrlPrefix {
            keyserver_id,
            url_prefix,
        } => update(keyserver_id, &|info| info.with_url_prefix(url_prefix.as_str())),

        Action::UpdateLastCommunicatedPlatformDetails {
            keyserver_id,
            platform_details,
        } => update(keyserver_id, &|info| {
            info.with_platform_details(Some(platform_details.clone()))
        }),

        Action::UpdateConnectionStatus {
            keyserver_id,
            status,
        } => update(keyserver_id, &|info| {
            info.map_connection(|c| c.with_status(*status).without_late_responses())
        }),

        Action::UnsupervisedBackground { keyserver_id } => update(keyserver_id, &|info| {
            info.map_connection(|c| {
                c.with_status(ConnectionStatus::Disconnected)
                    .without_late_responses()
            })
        }),

        Action::QueueActivityUpdates {
            keyserver_id,
            activity_updates,
        } => update(keyserver_id, &|info| {
            let queued = merge_activity_updates(
                &info.connection.queued_activity_updates,
                activity_updates,
            );
            info.map_connection(|c| c.with_queued_activity_updates(queued))
        }),

        Action::UpdateActivitySuccess {
            activity_updates, ..
        } => activity_updates
            .iter()
            .flat_map(|(id, acknowledged)| {
                update(id, &|info| {
                    let remaining = info
                        .connection
                        .queued_activity_updates
                        .iter()
                        .filter(|queued| !acknowledged.contains(queued))
                        .cloned()
                        .collect();
                    info.map_connection(|c| c.with_queued_activity_updates(remaining))
                })
            })
            .collect(),

        Action::LogOut {
            default_calendar_query,
        } => {
            let mut ops = vec![KeyserverStoreOperation::RemoveAllKeyservers];
            ops.extend(reset_home(state, home_keyserver_id, default_calendar_query));
            ops
        }

        Action::DeleteKeyserverAccount {
            keyserver_ids,
            default_calendar_query,
        } => {
            let mut ops = vec![KeyserverStoreOperation::RemoveKeyservers {
                ids: keyserver_ids.clone(),
            }];
            if keyserver_ids.iter().any(|id| id == home_keyserver_id) {
                ops.extend(reset_home(state, home_keyserver_id, default_calendar_query));
            }
            ops
        }

        Action::SetLateResponse {
            keyserver_id,
            message_id,
            is_late,
        } => update(keyserver_id, &|info| {
            info.map_connection(|c| c.with_late_response(*message_id, *is_late))
        }),

        Action::UpdateKeyserverReachability {
            keyserver_id,
            unreachable,
        } => update(keyserver_id, &|info| {
            info.map_connection(|c| c.with_unreachable(*unreachable))
        }),

        Action::SetDeviceTokens { device_tokens } => device_tokens
            .iter()
            .flat_map(|(id, token)| update(id, &|info| info.with_device_token(token.clone())))
            .collect(),

        Action::SetConnectionIssue {
            keyserver_id,
            connection_issue,
        } => update(keyserver_id, &|info| {
            info.map_connection(|c| c.with_connection_issue(*connection_issue))
        }),

        Action::SetSessionRecoveryInProgress {
            keyserver_id,
            in_progress,
        } => update(keyserver_id, &|info| {
            info.map_connection(|c| c.with_session_recovery_in_progress(*in_progress))
        }),

        Action::UpdateCalendarQuerySuccess {
            keyserver_ids,
            calendar_query,
        } => keyserver_ids
            .iter()
            .flat_map(|id| {
                let query = calendar_query.for_keyserver(id, home_keyserver_id);
                update(id, &|info| info.with_calendar_query(query.clone()))
            })
            .collect(),

        Action::ProcessMessages { .. } | Action::ForcePolicyAcknowledgment { .. } => Vec::new(),
    }
}

/// Home keyserver entry after logout: same endpoint, no session.
fn reset_home(
    state: &KeyserverStore,
    home_keyserver_id: &str,
    default_calendar_query: &CalendarQuery,
) -> Option<KeyserverStoreOperation> {
    let Some(home) = state.get(home_keyserver_id) else {
        warn!(
            home_keyserver_id,
            "Home keyserver missing from the store during logout"
        );
        return None;
    };
    let info = home
        .clone()
        .with_calendar_query(default_calendar_query.clone())
        .with_cookie(None)
        .map_connection(|c| {
            c.with_connection_issue(None)
                .with_queued_activity_updates(Vec::new())
                .without_late_responses()
        });
    Some(KeyserverStoreOperation::replace(home_keyserver_id, info))
}

/// Appends `incoming` to `queued`, dropping queued updates it supersedes.
///
/// A queued update for the same thread is superseded when both are focus
/// updates, or when the queued one is an unfocus.
pub fn merge_activity_updates(
    queued: &[ActivityUpdate],
    incoming: &[ActivityUpdate],
) -> Vec<ActivityUpdate> {
    queued
        .iter()
        .filter(|existing| {
            !incoming.iter().any(|update| {
                existing.thread_id == update.thread_id && (!existing.focus || update.focus)
            })
        })
        .chain(incoming.iter())
        .cloned()
        .collect()
}

#[cfg(test)]
#[path = "tests/reducer_tests.rs"]
mod tests;
