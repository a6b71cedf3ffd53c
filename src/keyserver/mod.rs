//! Per-keyserver connection and session metadata.
//!
//! The store is mutated only through [`KeyserverStoreOperation`]s, which
//! the reducer derives from application [`Action`]s.

pub mod actions;
pub mod handle;
pub mod ops_log;
pub mod reducer;
pub mod store_ops;
pub mod types;

pub use actions::Action;
pub use handle::{KeyserverStoreHandle, StoreOpsPersistence};
pub use ops_log::FileOpsLog;
pub use reducer::{merge_activity_updates, reduce_keyserver_store, ReducedStore};
pub use store_ops::{process_store_operations, KeyserverStore, KeyserverStoreOperation};
pub use types::{
    ConnectionInfo, ConnectionIssue, ConnectionStatus, KeyserverInfo, HANDSHAKE_LATE_ID,
};
