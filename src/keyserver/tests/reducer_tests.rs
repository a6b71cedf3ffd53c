use super::*;
use crate::keyserver::types::{ConnectionIssue, HANDSHAKE_LATE_ID};
use crate::protocol::{
    CalendarFilter, CurrentUserInfo, IncrementalStateSync, SessionChange, UpdateInfo, UpdateType,
    UpdatesPayload, UpdatesResult,
};
use proptest::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;

const HOME: &str = "256";

fn query_with_threads() -> CalendarQuery {
    CalendarQuery {
        start_date: "2024-01-01".to_string(),
        end_date: "2024-01-31".to_string(),
        filters: vec![
            CalendarFilter::NotDeleted,
            CalendarFilter::ThreadList {
                thread_ids: vec!["1".to_string(), "512|2".to_string()],
            },
        ],
    }
}

fn store_with(ids: &[&str]) -> KeyserverStore {
    let mut store = KeyserverStore::default();
    for id in ids {
        store.keyserver_infos.insert(
            id.to_string(),
            KeyserverInfo::new(format!("https://{}.example", id), query_with_threads())
                .with_cookie(Some(format!("user={}:c", id))),
        );
    }
    store
}

fn reduce(store: &KeyserverStore, action: Action) -> ReducedStore {
    reduce_keyserver_store(store, &action, HOME)
}

fn activity(thread: &str, focus: bool) -> ActivityUpdate {
    ActivityUpdate {
        thread_id: thread.to_string(),
        focus,
        latest_message: None,
    }
}

fn updates(current_as_of: i64) -> UpdatesPayload {
    UpdatesPayload {
        updates_result: UpdatesResult {
            new_updates: vec![],
            current_as_of,
        },
        user_infos: Value::Null,
    }
}

#[test]
fn test_missing_keyserver_yields_no_operations() {
    let store = store_with(&[HOME]);
    let result = reduce(
        &store,
        Action::UpdateConnectionStatus {
            keyserver_id: "999".to_string(),
            status: ConnectionStatus::Connected,
        },
    );
    assert!(result.operations.is_empty());
    assert_eq!(result.store, store);
}

#[test]
fn test_connection_status_clears_late_responses() {
    let mut store = store_with(&[HOME]);
    store = reduce(
        &store,
        Action::SetLateResponse {
            keyserver_id: HOME.to_string(),
            message_id: HANDSHAKE_LATE_ID,
            is_late: true,
        },
    )
    .store;
    assert_eq!(store.connection(HOME).unwrap().late_responses, vec![-1]);

    let result = reduce(
        &store,
        Action::UpdateConnectionStatus {
            keyserver_id: HOME.to_string(),
            status: ConnectionStatus::Connected,
        },
    );
    let connection = result.store.connection(HOME).unwrap();
    assert_eq!(connection.status, ConnectionStatus::Connected);
    assert!(connection.late_responses.is_empty());
    assert_eq!(result.operations.len(), 1);
}

#[test]
fn test_late_response_set_semantics() {
    let store = store_with(&[HOME]);
    let late = |store: &KeyserverStore, id: i64, is_late: bool| {
        reduce(
            store,
            Action::SetLateResponse {
                keyserver_id: HOME.to_string(),
                message_id: id,
                is_late,
            },
        )
        .store
    };
    let store = late(&store, 4, true);
    let store = late(&store, 4, true);
    let store = late(&store, 2, true);
    assert_eq!(store.connection(HOME).unwrap().late_responses, vec![2, 4]);
    let store = late(&store, 4, false);
    assert_eq!(store.connection(HOME).unwrap().late_responses, vec![2]);
}

#[test]
fn test_incremental_sync_uses_server_checkpoint_and_clears_bad_token() {
    let mut store = store_with(&[HOME]);
    store = reduce(
        &store,
        Action::ProcessUpdates {
            keyserver_id: HOME.to_string(),
            payload: updates(500),
        },
    )
    .store;
    store = reduce(
        &store,
        Action::SetDeviceTokens {
            device_tokens: BTreeMap::from([(HOME.to_string(), Some("tok".to_string()))]),
        },
    )
    .store;

    let payload = IncrementalStateSync {
        updates_result: UpdatesResult {
            new_updates: vec![UpdateInfo {
                kind: UpdateType::BadDeviceToken,
                device_token: Some("tok".to_string()),
                details: serde_json::Map::new(),
            }],
            current_as_of: 300,
        },
        delta_entry_infos: Value::Null,
        delete_entry_ids: vec![],
        user_infos: Value::Null,
        calendar_query: None,
    };
    let result = reduce(
        &store,
        Action::IncrementalStateSync {
            keyserver_id: HOME.to_string(),
            payload,
        },
    );
    let info = result.store.get(HOME).unwrap();
    assert_eq!(info.updates_current_as_of, 300);
    assert_eq!(info.device_token, None);
}

#[test]
fn test_set_new_session_with_invalidated_cookie() {
    let mut store = store_with(&[HOME]);
    store = reduce(
        &store,
        Action::QueueActivityUpdates {
            keyserver_id: HOME.to_string(),
            activity_updates: vec![activity("1", true)],
        },
    )
    .store;
    store = reduce(
        &store,
        Action::SetSessionRecoveryInProgress {
            keyserver_id: HOME.to_string(),
            in_progress: true,
        },
    )
    .store;

    let result = reduce(
        &store,
        Action::SetNewSession {
            keyserver_id: HOME.to_string(),
            session_change: SessionChange {
                cookie_invalidated: true,
                cookie: Some("anonymous=9:x".to_string()),
                current_user_info: Some(CurrentUserInfo::anonymous()),
                session_id: None,
            },
            pre_request_user_state: None,
            error: None,
            source: None,
        },
    );
    let info = result.store.get(HOME).unwrap();
    assert_eq!(info.cookie.as_deref(), Some("anonymous=9:x"));
    assert_eq!(info.actualized_calendar_query.filters, vec![CalendarFilter::NotDeleted]);
    assert!(info.connection.queued_activity_updates.is_empty());
    assert!(!info.connection.session_recovery_in_progress);
}

#[test]
fn test_set_new_session_without_changes_emits_nothing() {
    let store = store_with(&[HOME]);
    let result = reduce(
        &store,
        Action::SetNewSession {
            keyserver_id: HOME.to_string(),
            session_change: SessionChange {
                cookie_invalidated: false,
                cookie: None,
                current_user_info: None,
                session_id: Some("s".to_string()),
            },
            pre_request_user_state: None,
            error: None,
            source: None,
        },
    );
    assert!(result.operations.is_empty());
}

#[test]
fn test_reset_user_state_keeps_anonymous_cookies() {
    let mut store = store_with(&[HOME, "512"]);
    store
        .keyserver_infos
        .get_mut("512")
        .unwrap()
        .cookie = Some("anonymous=1:a".to_string());

    let result = reduce(&store, Action::ResetUserState);
    assert_eq!(result.operations.len(), 1);
    assert_eq!(result.store.get(HOME).unwrap().cookie, None);
    assert_eq!(
        result.store.get("512").unwrap().cookie.as_deref(),
        Some("anonymous=1:a")
    );
}

#[test]
fn test_log_out_keeps_only_reset_home() {
    let mut store = store_with(&[HOME, "512", "1024"]);
    store = reduce(
        &store,
        Action::SetConnectionIssue {
            keyserver_id: HOME.to_string(),
            connection_issue: Some(ConnectionIssue::NotLoggedInError),
        },
    )
    .store;
    let default_query = CalendarQuery::new("2024-02-01", "2024-02-29");

    let result = reduce(
        &store,
        Action::LogOut {
            default_calendar_query: default_query.clone(),
        },
    );

    assert_eq!(result.operations[0], KeyserverStoreOperation::RemoveAllKeyservers);
    assert_eq!(result.store.keyserver_infos.len(), 1);
    let home = result.store.get(HOME).unwrap();
    assert_eq!(home.cookie, None);
    assert_eq!(home.url_prefix, "https://256.example");
    assert_eq!(home.actualized_calendar_query, default_query);
    assert_eq!(home.connection.connection_issue, None);
}

#[test]
fn test_delete_keyserver_account_reseeds_home_only_when_included() {
    let store = store_with(&[HOME, "512"]);
    let query = CalendarQuery::new("2024-02-01", "2024-02-29");

    let without_home = reduce(
        &store,
        Action::DeleteKeyserverAccount {
            keyserver_ids: vec!["512".to_string()],
            default_calendar_query: query.clone(),
        },
    );
    assert_eq!(without_home.operations.len(), 1);
    assert!(!without_home.store.contains("512"));
    assert_eq!(without_home.store.get(HOME), store.get(HOME));

    let with_home = reduce(
        &store,
        Action::DeleteKeyserverAccount {
            keyserver_ids: vec![HOME.to_string(), "512".to_string()],
            default_calendar_query: query,
        },
    );
    assert_eq!(with_home.store.keyserver_infos.len(), 1);
    assert_eq!(with_home.store.get(HOME).unwrap().cookie, None);
}

#[test]
fn test_auth_success_filters_calendar_query_per_keyserver() {
    let store = store_with(&[HOME, "512"]);
    let result = reduce(
        &store,
        Action::KeyserverAuthSuccess {
            updates_current_as_of: BTreeMap::from([
                (HOME.to_string(), 10),
                ("512".to_string(), 20),
            ]),
            calendar_query: query_with_threads(),
            platform_details: None,
        },
    );
    let other = result.store.get("512").unwrap();
    assert_eq!(other.updates_current_as_of, 20);
    assert_eq!(
        other.actualized_calendar_query.filters[1],
        CalendarFilter::ThreadList {
            thread_ids: vec!["512|2".to_string()]
        }
    );
}

#[test]
fn test_activity_success_removes_acknowledged_updates() {
    let mut store = store_with(&[HOME]);
    store = reduce(
        &store,
        Action::QueueActivityUpdates {
            keyserver_id: HOME.to_string(),
            activity_updates: vec![activity("1", true), activity("2", false)],
        },
    )
    .store;

    let result = reduce(
        &store,
        Action::UpdateActivitySuccess {
            activity_updates: BTreeMap::from([(HOME.to_string(), vec![activity("1", true)])]),
            result: Default::default(),
        },
    );
    assert_eq!(
        result.store.connection(HOME).unwrap().queued_activity_updates,
        vec![activity("2", false)]
    );
}

#[test]
fn test_merge_activity_updates_dedup_rule() {
    let queued = vec![activity("a", true), activity("b", false), activity("c", true)];
    let incoming = vec![activity("a", true), activity("b", true), activity("c", false)];

    let merged = merge_activity_updates(&queued, &incoming);

    // "c" focus survives an incoming unfocus; the rest are superseded.
    assert_eq!(
        merged,
        vec![
            activity("c", true),
            activity("a", true),
            activity("b", true),
            activity("c", false)
        ]
    );
}

#[test]
fn test_unsupervised_background_disconnects() {
    let store = store_with(&[HOME]);
    let result = reduce(
        &store,
        Action::UnsupervisedBackground {
            keyserver_id: HOME.to_string(),
        },
    );
    assert_eq!(
        result.store.connection(HOME).unwrap().status,
        ConnectionStatus::Disconnected
    );
}

#[test]
fn test_forwarded_actions_do_not_touch_store() {
    let store = store_with(&[HOME]);
    let result = reduce(
        &store,
        Action::ForcePolicyAcknowledgment {
            keyserver_id: HOME.to_string(),
        },
    );
    assert!(result.operations.is_empty());
}

proptest! {
    #[test]
    fn checkpoint_never_regresses_through_process_updates(
        checkpoints in proptest::collection::vec(0i64..10_000, 1..20)
    ) {
        let mut store = store_with(&[HOME]);
        let mut previous = store.get(HOME).unwrap().updates_current_as_of;
        for checkpoint in checkpoints {
            store = reduce(
                &store,
                Action::ProcessUpdates {
                    keyserver_id: HOME.to_string(),
                    payload: updates(checkpoint),
                },
            )
            .store;
            let current = store.get(HOME).unwrap().updates_current_as_of;
            prop_assert!(current >= previous);
            prop_assert!(current >= checkpoint);
            previous = current;
        }
    }
}
