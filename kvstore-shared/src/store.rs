//! Remote coordination store abstraction.
//!
//! The client treats the store as an opaque linearizable key-value service with a global
//! revision counter, revisioned reads, paginated prefix scans, prefix change subscriptions,
//! single-round compare-and-swap transactions and TTL leases. Any backend (an etcd v3 gRPC
//! client, the in-memory test store, ...) plugs in by implementing [`RemoteStore`].
//!
//! The trait uses `async_trait` so it stays object safe and can be shared as
//! `Arc<dyn RemoteStore>` between the watch, lease, lock and status tasks.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::error::Result;

pub mod txn;

pub use txn::{Compare, TxnOp, TxnOpResponse, TxnRequest, TxnResponse};

/// Remote lease identifier. [`NO_LEASE`] means the key is not bound to any lease.
pub type LeaseId = i64;

pub const NO_LEASE: LeaseId = 0;

/// A key as stored remotely, with its revision metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    /// Revision of the put that created the key. Survives updates, reset by a delete.
    pub create_revision: u64,
    /// Revision of the last modification.
    pub mod_revision: u64,
    /// Number of modifications since creation.
    pub version: u64,
    pub lease: LeaseId,
}

/// Result of a single key read.
#[derive(Debug, Clone)]
pub struct GetResponse {
    pub kv: Option<KeyValue>,
    /// Store revision at the time of the read.
    pub revision: u64,
}

/// Paginated, key-ordered scan of a prefix.
#[derive(Debug, Clone)]
pub struct RangeRequest {
    pub prefix: String,
    /// First key (inclusive) of this page. Must sort at or after `prefix`.
    pub start_key: String,
    /// Page size, 0 means unbounded.
    pub limit: usize,
    /// Read the prefix as of this revision. `None` reads the latest state.
    pub revision: Option<u64>,
}

impl RangeRequest {
    pub fn new(prefix: impl Into<String>, limit: usize) -> Self {
        let prefix = prefix.into();
        Self {
            start_key: prefix.clone(),
            prefix,
            limit,
            revision: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RangePage {
    pub kvs: Vec<KeyValue>,
    /// More keys exist after the last key of this page.
    pub more: bool,
    /// Store revision reported with this page.
    pub revision: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    /// For deletes only `key` and `mod_revision` are meaningful.
    pub kv: KeyValue,
}

/// Changes delivered together, all at or below `revision`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchBatch {
    pub events: Vec<WatchEvent>,
    pub revision: u64,
}

/// Stream of change batches. It ends with `None` on a clean close (e.g. idle transport
/// recycling) or yields an `Err` when the subscription is broken (compaction, server errors).
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchBatch>> + Send>>;

/// Version information reported by a single endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
    pub version: String,
    pub is_leader: bool,
}

/// A remote, linearizable coordination store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<GetResponse>;

    /// Writes `value`, optionally bound to `lease`. Returns the new store revision.
    async fn put(&self, key: &str, value: Bytes, lease: Option<LeaseId>) -> Result<u64>;

    /// Deletes a single key. Returns the store revision after the delete.
    async fn delete(&self, key: &str) -> Result<u64>;

    /// Deletes every key starting with `prefix`. Returns the store revision after the delete.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    async fn range(&self, request: RangeRequest) -> Result<RangePage>;

    /// Subscribes to changes under `prefix` starting at `from_revision` (inclusive). Fails
    /// with [`crate::error::StoreError::Compacted`] when that revision is no longer available, either
    /// immediately or as the first item of the stream.
    async fn watch(&self, prefix: &str, from_revision: u64) -> Result<WatchStream>;

    async fn txn(&self, request: TxnRequest) -> Result<TxnResponse>;

    /// Grants a lease with the given TTL in seconds.
    async fn lease_grant(&self, ttl_secs: i64) -> Result<LeaseId>;

    async fn lease_revoke(&self, id: LeaseId) -> Result<()>;

    /// Refreshes a lease once, returns the remaining TTL in seconds. Fails with
    /// [`crate::error::StoreError::LeaseNotFound`] once the lease has expired.
    async fn lease_keep_alive(&self, id: LeaseId) -> Result<i64>;

    fn endpoints(&self) -> Vec<String>;

    async fn endpoint_status(&self, endpoint: &str) -> Result<EndpointStatus>;

    /// Releases the transport. Calls made afterwards fail with [`crate::error::StoreError::Closed`].
    async fn close(&self);
}

/// Smallest key sorting strictly after `key`, used to continue a paginated
/// scan right after the last key of the previous page.
pub fn key_successor(key: &str) -> String {
    let mut next = String::with_capacity(key.len() + 1);
    next.push_str(key);
    next.push('\0');
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successor_sorts_right_after_key() {
        let next = key_successor("agents/state/a");
        assert!(next.as_str() > "agents/state/a");
        assert!(next.as_str() < "agents/state/a0");
        assert!(next.as_str() < "agents/state/b");
    }

    #[test]
    fn range_request_starts_at_prefix() {
        let request = RangeRequest::new("nodes/", 256);
        assert_eq!(request.start_key, "nodes/");
        assert_eq!(request.revision, None);
    }
}
