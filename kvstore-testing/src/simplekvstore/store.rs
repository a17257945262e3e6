//! Store facade implementing the remote store trait.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use kvstore_shared::error::{Result, StoreError};
use kvstore_shared::store::{
    EndpointStatus, GetResponse, LeaseId, RangePage, RangeRequest, RemoteStore, TxnRequest,
    TxnResponse, WatchBatch, WatchStream,
};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use super::error_injector::KVErrorInjector;
use super::state::KVState;
use super::watch::WatchCursor;

const DEFAULT_MAX_HISTORY: usize = 10_000;
const STORE_VERSION: &str = "3.5.17";

/// Number of calls per remote operation, for asserting on client behaviour.
#[derive(Debug, Default)]
pub struct CallCounters {
    ranges: AtomicUsize,
    watches: AtomicUsize,
    txns: AtomicUsize,
    puts: AtomicUsize,
    lease_grants: AtomicUsize,
    lease_revokes: AtomicUsize,
    keep_alives: AtomicUsize,
}

impl CallCounters {
    pub fn ranges(&self) -> usize {
        self.ranges.load(Ordering::SeqCst)
    }

    pub fn watches(&self) -> usize {
        self.watches.load(Ordering::SeqCst)
    }

    pub fn txns(&self) -> usize {
        self.txns.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn lease_grants(&self) -> usize {
        self.lease_grants.load(Ordering::SeqCst)
    }

    pub fn lease_revokes(&self) -> usize {
        self.lease_revokes.load(Ordering::SeqCst)
    }

    pub fn keep_alives(&self) -> usize {
        self.keep_alives.load(Ordering::SeqCst)
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-memory coordination store. Clones share state.
#[derive(Clone)]
pub struct SimpleKVStore {
    state: Arc<RwLock<KVState>>,
    endpoints: Arc<Vec<String>>,
    error_injector: Arc<KVErrorInjector>,
    calls: Arc<CallCounters>,
    /// Batches are sent while the state lock is held so a watcher subscribing under the same
    /// lock sees neither gaps nor duplicates between replay and live updates.
    watch_sender: broadcast::Sender<WatchBatch>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for SimpleKVStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleKVStore")
            .field("endpoints", &self.endpoints)
            .field("state", &self.state)
            .finish()
    }
}

impl SimpleKVStore {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_history_limit(endpoints, DEFAULT_MAX_HISTORY)
    }

    /// Keeps at most `max_history` changes for watch replay, older ones are compacted.
    pub fn with_history_limit<I, S>(endpoints: I, max_history: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (watch_sender, _) = broadcast::channel(4096);
        Self {
            state: Arc::new(RwLock::new(KVState::new(max_history))),
            endpoints: Arc::new(endpoints.into_iter().map(Into::into).collect()),
            error_injector: Arc::new(KVErrorInjector::new()),
            calls: Arc::new(CallCounters::default()),
            watch_sender,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn error_injector(&self) -> &Arc<KVErrorInjector> {
        &self.error_injector
    }

    pub fn calls(&self) -> &CallCounters {
        &self.calls
    }

    pub fn revision(&self) -> u64 {
        self.state.read().revision()
    }

    pub fn lease_count(&self) -> usize {
        self.state.read().lease_count()
    }

    pub fn keys_of_lease(&self, id: LeaseId) -> Vec<String> {
        self.state.read().keys_of_lease(id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Every key with its value.
    pub fn snapshot(&self) -> BTreeMap<String, Bytes> {
        let state = self.state.read();
        let all = RangeRequest::new("", 0);
        state
            .range(&all)
            .map(|page| page.kvs.into_iter().map(|kv| (kv.key, kv.value)).collect())
            .unwrap_or_default()
    }

    /// Forgets history at or below `revision`. Live watchers are not affected, new watches and
    /// revisioned reads from before `revision` fail with a compaction error.
    pub fn compact(&self, revision: u64) {
        self.state.write().compact(revision);
    }

    /// Expires a lease right away, as if its TTL had run out without renewal.
    pub fn expire_lease(&self, id: LeaseId) {
        let mut state = self.state.write();
        if let Ok(Some(batch)) = state.lease_revoke(id) {
            let _ = self.watch_sender.send(batch);
        }
        debug!(lease = id, "Expired lease");
    }

    /// Runs `op` under the write lock after expiring due leases, publishing every batch it
    /// produces before the lock is released.
    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut KVState) -> Result<(T, Option<WatchBatch>)>,
    ) -> Result<T> {
        let mut state = self.state.write();
        for batch in state.expire_due_leases(Instant::now()) {
            let _ = self.watch_sender.send(batch);
        }
        let (out, batch) = op(&mut state)?;
        if let Some(batch) = batch {
            let _ = self.watch_sender.send(batch);
        }
        Ok(out)
    }

    async fn enter(&self, should_fail: bool) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        self.error_injector.apply_latency().await;
        if should_fail {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for SimpleKVStore {
    async fn get(&self, key: &str) -> Result<GetResponse> {
        self.enter(self.error_injector.should_fail_get()).await?;
        self.mutate(|state| {
            Ok((
                GetResponse {
                    kv: state.get(key),
                    revision: state.revision(),
                },
                None,
            ))
        })
    }

    async fn put(&self, key: &str, value: Bytes, lease: Option<LeaseId>) -> Result<u64> {
        CallCounters::bump(&self.calls.puts);
        self.enter(self.error_injector.should_fail_put()).await?;
        self.mutate(|state| {
            let batch = state.put(key, value, lease)?;
            Ok((batch.revision, Some(batch)))
        })
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        self.enter(self.error_injector.should_fail_delete()).await?;
        self.mutate(|state| {
            let batch = state.delete(key, false);
            Ok((state.revision(), batch))
        })
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        self.enter(self.error_injector.should_fail_delete()).await?;
        self.mutate(|state| {
            let batch = state.delete(prefix, true);
            Ok((state.revision(), batch))
        })
    }

    async fn range(&self, request: RangeRequest) -> Result<RangePage> {
        CallCounters::bump(&self.calls.ranges);
        self.enter(self.error_injector.should_fail_range()).await?;
        self.mutate(|state| Ok((state.range(&request)?, None)))
    }

    async fn watch(&self, prefix: &str, from_revision: u64) -> Result<WatchStream> {
        CallCounters::bump(&self.calls.watches);
        self.enter(self.error_injector.should_fail_watch()).await?;
        let cursor = self.mutate(|state| {
            let replay = state.replay(prefix, from_revision)?;
            Ok((
                WatchCursor::new(
                    prefix,
                    from_revision,
                    replay,
                    self.watch_sender.subscribe(),
                    self.error_injector.watch_signals(),
                    self.error_injector.close_after(),
                ),
                None,
            ))
        })?;
        Ok(cursor.into_stream())
    }

    async fn txn(&self, request: TxnRequest) -> Result<TxnResponse> {
        CallCounters::bump(&self.calls.txns);
        self.enter(self.error_injector.should_fail_txn()).await?;
        self.mutate(|state| state.txn(request))
    }

    async fn lease_grant(&self, ttl_secs: i64) -> Result<LeaseId> {
        CallCounters::bump(&self.calls.lease_grants);
        self.enter(self.error_injector.should_fail_lease_grant())
            .await?;
        self.mutate(|state| Ok((state.lease_grant(ttl_secs, Instant::now()), None)))
    }

    async fn lease_revoke(&self, id: LeaseId) -> Result<()> {
        CallCounters::bump(&self.calls.lease_revokes);
        self.enter(false).await?;
        self.mutate(|state| Ok(((), state.lease_revoke(id)?)))
    }

    async fn lease_keep_alive(&self, id: LeaseId) -> Result<i64> {
        CallCounters::bump(&self.calls.keep_alives);
        self.enter(self.error_injector.should_fail_keep_alive())
            .await?;
        self.mutate(|state| Ok((state.lease_keep_alive(id, Instant::now())?, None)))
    }

    fn endpoints(&self) -> Vec<String> {
        self.endpoints.to_vec()
    }

    async fn endpoint_status(&self, endpoint: &str) -> Result<EndpointStatus> {
        self.enter(false).await?;
        if !self.error_injector.is_endpoint_reachable(endpoint) {
            return Err(StoreError::Unavailable(format!(
                "connection refused: {endpoint}"
            )));
        }
        Ok(EndpointStatus {
            version: STORE_VERSION.to_string(),
            is_leader: self.endpoints.first().is_some_and(|e| e == endpoint),
        })
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.error_injector.close_watch_streams();
        }
    }
}
