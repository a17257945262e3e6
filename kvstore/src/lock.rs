//! Distributed mutex on top of lock sessions.
//!
//! Every contender creates `<path>/<lease>` bound to its session lease. The owner is the
//! contender whose key has the lowest create revision, the others wait for the deletion of the
//! key created right before theirs. Locks of the same path taken through the same client are
//! additionally serialized locally, they would otherwise share the contender key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use kvstore_shared::error::StoreError;
use kvstore_shared::store::{
    Compare, KeyValue, RangeRequest, RemoteStore, TxnOp, TxnRequest, WatchEventKind,
};
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lease::{LeaseManager, Session};

/// Proof that a transaction runs while a lock is still held. Can only be attached to a
/// transaction, the lock-qualified operations of the client do so.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockComparator {
    compare: Compare,
}

impl LockComparator {
    pub(crate) fn attach_to(&self, txn: TxnRequest) -> TxnRequest {
        txn.when(self.compare.clone())
    }

    /// A comparator that never holds.
    #[cfg(test)]
    pub(crate) fn always_failing() -> Self {
        Self {
            compare: Compare::create_revision("kvstore/.never", u64::MAX),
        }
    }
}

/// Per-path mutexes serializing local contenders.
#[derive(Clone, Default)]
struct LocalPathLocks {
    paths: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl LocalPathLocks {
    fn path_lock(&self, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.paths.lock().entry(path.to_string()).or_default())
    }

    /// Forgets mutexes nobody holds or waits for.
    fn prune(&self) {
        self.paths
            .lock()
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

#[derive(Clone)]
pub(crate) struct LockManager {
    store: Arc<dyn RemoteStore>,
    leases: LeaseManager,
    local: LocalPathLocks,
    timeout: Duration,
}

impl LockManager {
    pub(crate) fn new(store: Arc<dyn RemoteStore>, leases: LeaseManager, timeout: Duration) -> Self {
        Self {
            store,
            leases,
            local: LocalPathLocks::default(),
            timeout,
        }
    }

    pub(crate) fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// Acquires the lock at `path`, giving up after the lock timeout. The time spent obtaining a
    /// session counts against the timeout.
    pub(crate) async fn lock_path(&self, cancel: &CancellationToken, path: &str) -> Result<Lock> {
        self.lock_path_until(cancel, path, Instant::now() + self.timeout)
            .await
    }

    /// Like [`LockManager::lock_path`] with a caller chosen deadline. A lock that is not acquired
    /// by then leaves neither a contender key nor a session reference behind.
    pub(crate) async fn lock_path_until(
        &self,
        cancel: &CancellationToken,
        path: &str,
        deadline: Instant,
    ) -> Result<Lock> {
        let local = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(Error::Timeout),
            guard = self.local.path_lock(path).lock_owned() => guard,
        };

        let session = match tokio::time::timeout_at(deadline, self.leases.get_session(cancel, path))
            .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => {
                drop(local);
                self.local.prune();
                return Err(err.hint());
            }
            Err(elapsed) => {
                drop(local);
                self.local.prune();
                return Err(elapsed.into());
            }
        };
        let key = format!("{path}/{:x}", session.lease());

        let acquired = match tokio::time::timeout_at(
            deadline,
            self.acquire(cancel, &session, path, &key),
        )
        .await
        {
            Ok(acquired) => acquired,
            Err(elapsed) => Err(elapsed.into()),
        };

        match acquired {
            Ok(revision) => {
                debug!(path, key, revision, "Acquired lock");
                Ok(Lock {
                    path: path.to_string(),
                    key,
                    revision,
                    session,
                    manager: self.clone(),
                    _local: local,
                })
            }
            Err(err) => {
                if let Err(del) = self.store.delete(&key).await {
                    debug!(path, key, ?del, "Failed to remove lock contender key");
                }
                self.leases.cancel_if_expired(&err, session.lease());
                self.leases.release(path);
                drop(local);
                self.local.prune();
                Err(err.hint())
            }
        }
    }

    /// Registers as contender and waits for ownership. Returns the create revision of the
    /// contender key.
    async fn acquire(
        &self,
        cancel: &CancellationToken,
        session: &Session,
        path: &str,
        key: &str,
    ) -> Result<u64> {
        let prefix = format!("{path}/");
        let txn = TxnRequest::new()
            .when(Compare::create_revision(key, 0))
            .and_then(TxnOp::put(key, Bytes::new(), Some(session.lease())))
            .and_then(TxnOp::get_prefix(&prefix))
            .or_else(TxnOp::get(key))
            .or_else(TxnOp::get_prefix(&prefix));
        let response = self.cancellable(cancel, session, self.store.txn(txn)).await?;

        let my_revision = if response.succeeded {
            response.revision
        } else {
            response
                .range(0)
                .and_then(|kvs| kvs.first())
                .map(|kv| kv.create_revision)
                .ok_or_else(|| Error::Lock(format!("contender key {key} vanished")))?
        };
        let mut contenders = response.range(1).map(<[KeyValue]>::to_vec).unwrap_or_default();
        let mut revision = response.revision;

        while let Some(predecessor) = predecessor_of(&contenders, my_revision) {
            let predecessor = predecessor.key.clone();
            debug!(path, waiting_for = predecessor, "Waiting for lock holder to release");
            self.wait_for_delete(cancel, session, &predecessor, revision + 1)
                .await?;

            let page = self
                .cancellable(cancel, session, self.store.range(RangeRequest::new(&prefix, 0)))
                .await?;
            contenders = page.kvs;
            revision = page.revision;
        }

        // the session may have expired while waiting
        let current = self.cancellable(cancel, session, self.store.get(key)).await?;
        match current.kv {
            Some(kv) if kv.create_revision == my_revision => Ok(my_revision),
            _ => Err(Error::Lock("session expired".to_string())),
        }
    }

    async fn wait_for_delete(
        &self,
        cancel: &CancellationToken,
        session: &Session,
        key: &str,
        from_revision: u64,
    ) -> Result<()> {
        let mut feed = self
            .cancellable(cancel, session, self.store.watch(key, from_revision))
            .await?;
        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = session.expired() => return Err(Error::Lock("session expired".to_string())),
                batch = feed.next() => batch,
            };
            match batch {
                Some(Ok(batch)) => {
                    let deleted = batch
                        .events
                        .iter()
                        .any(|e| e.kind == WatchEventKind::Delete && e.kv.key == key);
                    if deleted {
                        return Ok(());
                    }
                }
                // contenders are listed again by the caller
                None | Some(Err(StoreError::Compacted { .. })) => return Ok(()),
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }

    async fn cancellable<T>(
        &self,
        cancel: &CancellationToken,
        session: &Session,
        call: impl Future<Output = kvstore_shared::error::Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = session.expired() => Err(Error::Lock("session expired".to_string())),
            result = call => Ok(result?),
        }
    }
}

/// Contender created right before `revision`, if any.
fn predecessor_of(contenders: &[KeyValue], revision: u64) -> Option<&KeyValue> {
    contenders
        .iter()
        .filter(|kv| kv.create_revision < revision)
        .max_by_key(|kv| kv.create_revision)
}

/// A held distributed lock. Must be released with [`Lock::unlock`], dropping it only releases
/// the local serialization and leaves the remote lock to session expiry.
pub struct Lock {
    path: String,
    key: String,
    revision: u64,
    session: Session,
    manager: LockManager,
    _local: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("path", &self.path)
            .field("key", &self.key)
            .field("revision", &self.revision)
            .field("lease", &self.session.lease())
            .finish()
    }
}

impl Lock {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn comparator(&self) -> LockComparator {
        LockComparator {
            compare: Compare::create_revision(&self.key, self.revision),
        }
    }

    /// Drops the session reference held for the path and deletes the contender key.
    pub async fn unlock(self, cancel: &CancellationToken) -> Result<()> {
        let Lock {
            path,
            key,
            manager,
            _local,
            ..
        } = self;
        manager.leases.release(&path);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = manager.store.delete(&key) => result.map(|_| ()).map_err(Error::from),
        };
        drop(_local);
        manager.local.prune();
        if let Err(err) = &result {
            warn!(path, ?err, "Failed to delete lock key, it will vanish with the session");
        }
        result.map_err(Error::hint)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use kvstore_shared::store::TxnOp;
    use kvstore_testing::simplekvstore::SimpleKVStore;

    use super::*;

    fn lock_manager(store: &SimpleKVStore, timeout: Duration) -> LockManager {
        let store: Arc<dyn RemoteStore> = Arc::new(store.clone());
        let leases = LeaseManager::new(
            "lock",
            Arc::clone(&store),
            Duration::from_secs(25),
            1000,
            None,
            CancellationToken::new(),
        );
        LockManager::new(store, leases, timeout)
    }

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let store = SimpleKVStore::new(["a:2379"]);
        let locks = lock_manager(&store, Duration::from_secs(5));
        let cancel = CancellationToken::new();

        let lock = locks.lock_path(&cancel, "locks/x").await.unwrap();
        let key = format!("locks/x/{:x}", lock.session().lease());
        assert!(store.snapshot().contains_key(&key));
        assert_eq!(lock.path(), "locks/x");

        lock.unlock(&cancel).await.unwrap();
        assert!(!store.snapshot().contains_key(&key));
        assert_eq!(locks.leases().total_leases(), 0);
        assert!(locks.local.paths.lock().is_empty());
    }

    #[tokio::test]
    async fn test_two_agents_never_hold_lock_together() {
        let store = SimpleKVStore::new(["a:2379"]);
        let first = lock_manager(&store, Duration::from_secs(5));
        let second = lock_manager(&store, Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let held = Arc::new(AtomicBool::new(false));

        let lock = first.lock_path(&cancel, "locks/x").await.unwrap();
        held.store(true, Ordering::SeqCst);

        let contender = {
            let cancel = cancel.clone();
            let held = Arc::clone(&held);
            tokio::spawn(async move {
                let lock = second.lock_path(&cancel, "locks/x").await.unwrap();
                assert!(!held.load(Ordering::SeqCst));
                lock.unlock(&cancel).await.unwrap();
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!contender.is_finished());

        held.store(false, Ordering::SeqCst);
        lock.unlock(&cancel).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_local_contenders_are_serialized() {
        let store = SimpleKVStore::new(["a:2379"]);
        let locks = lock_manager(&store, Duration::from_secs(5));
        let cancel = CancellationToken::new();

        let lock = locks.lock_path(&cancel, "locks/x").await.unwrap();
        let contender = {
            let locks = locks.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { locks.lock_path(&cancel, "locks/x").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        lock.unlock(&cancel).await.unwrap();
        let lock = contender.await.unwrap().unwrap();
        lock.unlock(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_timeout_removes_contender_key() {
        let store = SimpleKVStore::new(["a:2379"]);
        let first = lock_manager(&store, Duration::from_secs(5));
        let second = lock_manager(&store, Duration::from_millis(100));
        let cancel = CancellationToken::new();

        let lock = first.lock_path(&cancel, "locks/x").await.unwrap();
        let err = second.lock_path(&cancel, "locks/x").await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(err.to_string(), "kvstore client timeout exceeded");

        let contenders: Vec<String> = store
            .snapshot()
            .into_keys()
            .filter(|k| k.starts_with("locks/x/"))
            .collect();
        assert_eq!(contenders, vec![lock.key.clone()]);
        assert_eq!(second.leases().total_leases(), 0);
    }

    #[tokio::test]
    async fn test_deadline_on_slow_store_cleans_up() {
        let store = SimpleKVStore::new(["a:2379"]);
        let locks = lock_manager(&store, Duration::from_secs(5));
        let cancel = CancellationToken::new();
        store.error_injector().set_latency(30);

        let deadline = Instant::now() + Duration::from_millis(50);
        let err = locks
            .lock_path_until(&cancel, "locks/x", deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(locks.leases().total_leases(), 0);
        assert!(locks.local.paths.lock().is_empty());
        assert!(
            store
                .snapshot()
                .keys()
                .all(|k| !k.starts_with("locks/x/"))
        );

        store.error_injector().set_latency(0);
        let lock = locks.lock_path(&cancel, "locks/x").await.unwrap();
        lock.unlock(&cancel).await.unwrap();
        assert_eq!(locks.leases().total_leases(), 0);
    }

    #[tokio::test]
    async fn test_comparator_fails_after_session_expiry() {
        let store = SimpleKVStore::new(["a:2379"]);
        let locks = lock_manager(&store, Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let lock = locks.lock_path(&cancel, "locks/x").await.unwrap();

        let guarded = |value: &'static str| {
            lock.comparator()
                .attach_to(TxnRequest::new())
                .and_then(TxnOp::put("guarded", Bytes::from_static(value.as_bytes()), None))
        };
        assert!(store.txn(guarded("1")).await.unwrap().succeeded);

        store.expire_lease(lock.session().lease());
        let response = store.txn(guarded("2")).await.unwrap();
        assert!(!response.succeeded);
        assert_eq!(
            store.snapshot().get("guarded"),
            Some(&Bytes::from_static(b"1"))
        );
    }

    #[tokio::test]
    async fn test_always_failing_comparator() {
        let store = SimpleKVStore::new(["a:2379"]);
        let txn = LockComparator::always_failing()
            .attach_to(TxnRequest::new())
            .and_then(TxnOp::put("k", Bytes::from_static(b"v"), None));
        assert!(!store.txn(txn).await.unwrap().succeeded);
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_predecessor_of() {
        let kv = |key: &str, create_revision: u64| KeyValue {
            key: key.to_string(),
            value: Bytes::new(),
            create_revision,
            mod_revision: create_revision,
            version: 1,
            lease: 1,
        };
        let contenders = vec![kv("l/a", 3), kv("l/b", 7), kv("l/c", 9)];
        assert_eq!(predecessor_of(&contenders, 9).map(|kv| kv.key.as_str()), Some("l/b"));
        assert_eq!(predecessor_of(&contenders, 3), None);
    }
}
