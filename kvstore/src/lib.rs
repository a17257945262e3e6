//! Coordination client for an etcd-like store.
//!
//! [`connect`] establishes a [`Client`] which offers:
//! - key operations, plain and lock-qualified (`*_if_locked`), all admitted by a rate limiter
//! - list-and-watch of key prefixes as streams of [`KeyValueEvent`]s
//! - distributed locks ([`Client::lock_path`]) bound to lease sessions
//! - leases shared by many keys and renewed in the background
//! - a periodic status check exposed through [`Client::status`]
//!
//! The store itself is reached through [`kvstore_shared::store::RemoteStore`], opened by a
//! [`Connector`].

mod client;
mod error;
mod heartbeat;
mod lease;
mod lock;
mod status;
mod watch;

pub mod config;
pub mod connect;
pub mod metrics;
pub mod tls;
pub mod types;

pub use crate::client::Client;
pub use crate::config::{ClientOptions, ConfigFile, ExtraOptions};
pub use crate::connect::{ConnectTarget, Connector, connect};
pub use crate::error::{Error, Result};
pub use crate::heartbeat::run_heartbeat_writer;
pub use crate::lease::{ExpiredObserver, Session};
pub use crate::lock::{Lock, LockComparator};
pub use crate::metrics::KvStoreMetrics;
pub use crate::types::{
    ConnectionStatus, EventType, KeyValueEvent, KeyValuePairs, StatusState, Value,
};
pub use crate::watch::EventStream;
