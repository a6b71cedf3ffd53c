//! Operation log primitives for the keyserver store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::types::{ConnectionInfo, KeyserverInfo};

/// Materialized per-keyserver metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyserverStore {
    pub keyserver_infos: BTreeMap<String, KeyserverInfo>,
}

impl KeyserverStore {
    pub fn get(&self, keyserver_id: &str) -> Option<&KeyserverInfo> {
        self.keyserver_infos.get(keyserver_id)
    }

    pub fn connection(&self, keyserver_id: &str) -> Option<&ConnectionInfo> {
        self.get(keyserver_id).map(|info| &info.connection)
    }

    pub fn contains(&self, keyserver_id: &str) -> bool {
        self.keyserver_infos.contains_key(keyserver_id)
    }
}

/// The only way the store changes. Persisted verbatim by the ops log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum KeyserverStoreOperation {
    ReplaceKeyserver {
        id: String,
        keyserver_info: KeyserverInfo,
    },
    RemoveKeyservers {
        ids: Vec<String>,
    },
    RemoveAllKeyservers,
}

impl KeyserverStoreOperation {
    pub fn replace(id: impl Into<String>, keyserver_info: KeyserverInfo) -> Self {
        KeyserverStoreOperation::ReplaceKeyserver {
            id: id.into(),
            keyserver_info,
        }
    }
}

/// Applies `ops` in order. Replace stores the payload as-is; removing an
/// absent id does nothing.
pub fn process_store_operations(
    store: &KeyserverStore,
    ops: &[KeyserverStoreOperation],
) -> KeyserverStore {
    if ops.is_empty() {
        return store.clone();
    }
    let mut infos = store.keyserver_infos.clone();
    for op in ops {
        match op {
            KeyserverStoreOperation::ReplaceKeyserver { id, keyserver_info } => {
                infos.insert(id.clone(), keyserver_info.clone());
            }
            KeyserverStoreOperation::RemoveKeyservers { ids } => {
                for id in ids {
                    infos.remove(id);
                }
            }
            KeyserverStoreOperation::RemoveAllKeyservers => infos.clear(),
        }
    }
    KeyserverStore {
        keyserver_infos: infos,
    }
}

#[cfg(test)]
#[path = "tests/store_ops_tests.rs"]
mod tests;
