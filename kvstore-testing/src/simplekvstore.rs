//! In-memory coordination store for tests.
//!
//! [`SimpleKVStore`] implements [`RemoteStore`](kvstore_shared::store::RemoteStore) with the
//! semantics the client relies on: a global revision bumped once per write or transaction,
//! create/mod revisions and versions per key, revisioned and paginated prefix scans, watch
//! replay from a revision with compaction, TTL leases whose expiry deletes attached keys, and
//! compare-and-swap transactions. Clones share the same state, so two clients built on clones of
//! one store observe each other like two agents on one cluster.
//!
//! # Example
//! ```ignore
//! let store = SimpleKVStore::new(["127.0.0.1:2379"]);
//! store.put("a", Bytes::from("1"), None).await?;
//!
//! // fail the next range call
//! store.error_injector().fail_ranges(1);
//! // drop every live watch stream as if the server reported a compaction
//! store.error_injector().break_watch_streams(StoreError::Compacted { compact_revision: 5 });
//! ```

/// Error injection controller.
mod error_injector;
/// Revisioned key space, leases and transaction evaluation.
mod state;
/// Store facade implementing the remote store trait.
mod store;
/// Watch streams.
mod watch;

pub use error_injector::{KVErrorInjector, WatchSignal};
pub use state::KVState;
pub use store::{CallCounters, SimpleKVStore};
