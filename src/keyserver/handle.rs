use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::actions::Action;
use super::reducer::reduce_keyserver_store;
use super::store_ops::{KeyserverStore, KeyserverStoreOperation};
use super::types::{ConnectionInfo, KeyserverInfo};

/// Receives every batch of operations the store applies.
pub trait StoreOpsPersistence: Send + Sync {
    fn persist(&self, ops: &[KeyserverStoreOperation], store: &KeyserverStore)
        -> anyhow::Result<()>;
}

struct Shared {
    state: KeyserverStore,
    last_action_at: Option<Instant>,
}

struct Inner {
    home_keyserver_id: String,
    shared: Mutex<Shared>,
    snapshot_tx: watch::Sender<KeyserverStore>,
    actions_tx: broadcast::Sender<Action>,
    persistence: Option<Arc<dyn StoreOpsPersistence>>,
}

/// Thread-safe owner of the keyserver store.
///
/// Every mutation goes through [`KeyserverStoreHandle::dispatch`], which
/// reduces the action, persists the resulting operations, publishes the new
/// snapshot, and rebroadcasts the action to subscribers.
#[derive(Clone)]
pub struct KeyserverStoreHandle {
    inner: Arc<Inner>,
}

impl KeyserverStoreHandle {
    pub fn new(initial: KeyserverStore, home_keyserver_id: impl Into<String>, buffer: usize) -> Self {
        Self::build(initial, home_keyserver_id.into(), buffer, None)
    }

    pub fn with_persistence(
        initial: KeyserverStore,
        home_keyserver_id: impl Into<String>,
        buffer: usize,
        persistence: Arc<dyn StoreOpsPersistence>,
    ) -> Self {
        Self::build(initial, home_keyserver_id.into(), buffer, Some(persistence))
    }

    fn build(
        initial: KeyserverStore,
        home_keyserver_id: String,
        buffer: usize,
        persistence: Option<Arc<dyn StoreOpsPersistence>>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(initial.clone());
        let (actions_tx, _) = broadcast::channel(buffer.max(1));
        Self {
            inner: Arc::new(Inner {
                home_keyserver_id,
                shared: Mutex::new(Shared {
                    state: initial,
                    last_action_at: None,
                }),
                snapshot_tx,
                actions_tx,
                persistence,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `action` and returns the operations it produced.
    pub fn dispatch(&self, action: Action) -> Vec<KeyserverStoreOperation> {
        let operations = {
            let mut shared = self.lock();
            let reduced =
                reduce_keyserver_store(&shared.state, &action, &self.inner.home_keyserver_id);
            if let Some(persistence) = &self.inner.persistence {
                if let Err(e) = persistence.persist(&reduced.operations, &reduced.store) {
                    warn!(action = action.name(), "Failed to persist keyserver store operations: {:#}", e);
                }
            }
            if !reduced.operations.is_empty() {
                self.inner.snapshot_tx.send_replace(reduced.store.clone());
            }
            shared.state = reduced.store;
            shared.last_action_at = Some(Instant::now());
            reduced.operations
        };
        debug!(
            action = action.name(),
            keyserver_id = action.keyserver_id().unwrap_or("-"),
            operations = operations.len(),
            "Dispatched action"
        );
        // No subscribers is fine.
        let _ = self.inner.actions_tx.send(action);
        operations
    }

    pub fn state(&self) -> KeyserverStore {
        self.lock().state.clone()
    }

    pub fn keyserver_info(&self, keyserver_id: &str) -> Option<KeyserverInfo> {
        self.lock().state.get(keyserver_id).cloned()
    }

    pub fn connection(&self, keyserver_id: &str) -> Option<ConnectionInfo> {
        self.lock().state.connection(keyserver_id).cloned()
    }

    /// When the last action was dispatched, if any.
    pub fn last_action_at(&self) -> Option<Instant> {
        self.lock().last_action_at
    }

    pub fn home_keyserver_id(&self) -> &str {
        &self.inner.home_keyserver_id
    }

    pub fn watch(&self) -> watch::Receiver<KeyserverStore> {
        self.inner.snapshot_tx.subscribe()
    }

    pub fn subscribe_actions(&self) -> broadcast::Receiver<Action> {
        self.inner.actions_tx.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/handle_tests.rs"]
mod tests;
