//! Client-side connection engine for keyservers.
//!
//! Each keyserver gets one [`socket::ConnectionHandle`] that owns its
//! socket lifecycle: the initial state sync, heartbeats, request
//! tracking, session recovery and reconnects. Per-keyserver metadata lives
//! in the [`keyserver::KeyserverStoreHandle`].

pub mod compression;
pub mod config;
pub mod error;
pub mod keyserver;
pub mod protocol;
pub mod socket;
pub mod transport;

pub use config::{ConnectionConfig, Timeouts};
pub use error::SocketError;
pub use keyserver::{Action, ConnectionStatus, KeyserverInfo, KeyserverStore, KeyserverStoreHandle};
pub use socket::{ConnectionDeps, ConnectionEvent, ConnectionHandle, StaticClientContext};
pub use transport::{ChannelTransportFactory, WebSocketTransportFactory};
