//! Key operations. Every call goes through the limiter and records its duration.
//!
//! The `*_if_locked` variants run as a single transaction guarded by the lock's comparator and
//! fail with [`Error::LockLeaseExpired`] when the lock is no longer held.

use bytes::Bytes;
use kvstore_shared::store::{Compare, KeyValue, LeaseId, RangeRequest, TxnOp, TxnRequest};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Client;
use crate::error::{Error, Result};
use crate::lock::Lock;
use crate::metrics::{OUTCOME_FAILURE, OUTCOME_SUCCESS};
use crate::types::{KeyValuePairs, Value};

const KIND_READ: &str = "read";
const KIND_SET: &str = "set";
const KIND_DELETE: &str = "delete";

impl Client {
    fn observe<T>(&self, key: &str, kind: &str, action: &str, started: Instant, result: &Result<T>) {
        let outcome = if result.is_ok() {
            OUTCOME_SUCCESS
        } else {
            OUTCOME_FAILURE
        };
        self.inner
            .extra
            .metrics
            .observe_operation(key, kind, action, outcome, started.elapsed());
    }

    /// Lease to bind `key` to, when requested.
    async fn lease_for(
        &self,
        cancel: &CancellationToken,
        key: &str,
        lease: bool,
    ) -> Result<Option<LeaseId>> {
        if !lease {
            return Ok(None);
        }
        self.inner
            .leases
            .get_lease_id(cancel, key)
            .await
            .map(Some)
    }

    fn forget_expired(&self, err: &Error, lease: Option<LeaseId>) {
        if let Some(lease) = lease {
            self.inner.leases.cancel_if_expired(err, lease);
        }
    }

    async fn txn(&self, cancel: &CancellationToken, txn: TxnRequest) -> Result<kvstore_shared::store::TxnResponse> {
        self.inner.limited(cancel, self.inner.store.txn(txn)).await
    }

    /// Value of `key`, `None` if it does not exist.
    pub async fn get(&self, cancel: &CancellationToken, key: &str) -> Result<Option<Bytes>> {
        let started = Instant::now();
        let result = self
            .inner
            .limited(cancel, self.inner.store.get(key))
            .await
            .map(|response| response.kv.map(|kv| kv.value));
        self.observe(key, KIND_READ, "get", started, &result);
        result.map_err(Error::hint)
    }

    pub async fn get_if_locked(
        &self,
        cancel: &CancellationToken,
        key: &str,
        lock: &Lock,
    ) -> Result<Option<Bytes>> {
        let started = Instant::now();
        let txn = lock
            .comparator()
            .attach_to(TxnRequest::new())
            .and_then(TxnOp::get(key));
        let result = self.txn(cancel, txn).await.and_then(|response| {
            if !response.succeeded {
                return Err(Error::LockLeaseExpired);
            }
            Ok(first_kv(response.range(0)).map(|kv| kv.value.clone()))
        });
        self.observe(key, KIND_READ, "get_locked", started, &result);
        result.map_err(Error::hint)
    }

    pub async fn delete(&self, cancel: &CancellationToken, key: &str) -> Result<()> {
        let started = Instant::now();
        let result = self
            .inner
            .limited(cancel, self.inner.store.delete(key))
            .await
            .map(|_| ());
        if result.is_ok() {
            self.inner.leases.release(key);
        }
        self.observe(key, KIND_DELETE, "delete", started, &result);
        result.map_err(Error::hint)
    }

    pub async fn delete_if_locked(
        &self,
        cancel: &CancellationToken,
        key: &str,
        lock: &Lock,
    ) -> Result<()> {
        let started = Instant::now();
        let txn = lock
            .comparator()
            .attach_to(TxnRequest::new())
            .and_then(TxnOp::delete(key));
        let result = self.txn(cancel, txn).await.and_then(|response| {
            if response.succeeded {
                Ok(())
            } else {
                Err(Error::LockLeaseExpired)
            }
        });
        if result.is_ok() {
            self.inner.leases.release(key);
        }
        self.observe(key, KIND_DELETE, "delete_locked", started, &result);
        result.map_err(Error::hint)
    }

    /// Deletes every key under `path` and forgets their leases.
    pub async fn delete_prefix(&self, cancel: &CancellationToken, path: &str) -> Result<()> {
        let started = Instant::now();
        let result = self
            .inner
            .limited(cancel, self.inner.store.delete_prefix(path))
            .await
            .map(|_| ());
        if result.is_ok() {
            self.inner.leases.release_prefix(path);
        }
        self.observe(path, KIND_DELETE, "delete_prefix", started, &result);
        result.map_err(Error::hint)
    }

    /// Writes `key`. With `lease` the key is bound to a shared lease of this client and vanishes
    /// when the client stops renewing it.
    pub async fn update(
        &self,
        cancel: &CancellationToken,
        key: &str,
        value: Bytes,
        lease: bool,
    ) -> Result<()> {
        let started = Instant::now();
        let result = self.put(cancel, key, value, lease).await;
        self.observe(key, KIND_SET, "update", started, &result);
        result.map_err(Error::hint)
    }

    async fn put(
        &self,
        cancel: &CancellationToken,
        key: &str,
        value: Bytes,
        lease: bool,
    ) -> Result<()> {
        let lease_id = self.lease_for(cancel, key, lease).await?;
        let result = self
            .inner
            .limited(cancel, self.inner.store.put(key, value, lease_id))
            .await
            .map(|_| ());
        if let Err(err) = &result {
            self.forget_expired(err, lease_id);
        }
        result
    }

    pub async fn update_if_locked(
        &self,
        cancel: &CancellationToken,
        key: &str,
        value: Bytes,
        lease: bool,
        lock: &Lock,
    ) -> Result<()> {
        let started = Instant::now();
        let result = self.put_if_locked(cancel, key, value, lease, lock).await;
        self.observe(key, KIND_SET, "update_locked", started, &result);
        result.map_err(Error::hint)
    }

    async fn put_if_locked(
        &self,
        cancel: &CancellationToken,
        key: &str,
        value: Bytes,
        lease: bool,
        lock: &Lock,
    ) -> Result<()> {
        let lease_id = self.lease_for(cancel, key, lease).await?;
        let txn = lock
            .comparator()
            .attach_to(TxnRequest::new())
            .and_then(TxnOp::put(key, value, lease_id));
        match self.txn(cancel, txn).await {
            Ok(response) if response.succeeded => Ok(()),
            Ok(_) => Err(Error::LockLeaseExpired),
            Err(err) => {
                self.forget_expired(&err, lease_id);
                Err(err)
            }
        }
    }

    /// Writes `key` unless it already holds `value` (and a lease of this client when `lease` is
    /// set). Returns whether a write happened. A failed read falls back to writing.
    pub async fn update_if_different(
        &self,
        cancel: &CancellationToken,
        key: &str,
        value: Bytes,
        lease: bool,
    ) -> Result<bool> {
        let started = Instant::now();
        let current = self
            .inner
            .limited(cancel, self.inner.store.get(key))
            .await
            .map(|response| response.kv);
        let result = match current {
            Ok(Some(kv)) if self.is_current(&kv, &value, lease) => Ok(false),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(err) => {
                debug!(key, %err, "Unable to read key before updating it, writing it anyway");
                self.put(cancel, key, value, lease).await.map(|_| true)
            }
            Ok(_) => self.put(cancel, key, value, lease).await.map(|_| true),
        };
        self.observe(key, KIND_SET, "update_if_different", started, &result);
        result.map_err(Error::hint)
    }

    pub async fn update_if_different_if_locked(
        &self,
        cancel: &CancellationToken,
        key: &str,
        value: Bytes,
        lease: bool,
        lock: &Lock,
    ) -> Result<bool> {
        let started = Instant::now();
        let txn = lock
            .comparator()
            .attach_to(TxnRequest::new())
            .and_then(TxnOp::get(key));
        let result = match self.txn(cancel, txn).await {
            Ok(response) if !response.succeeded => Err(Error::LockLeaseExpired),
            Ok(response) => match first_kv(response.range(0)) {
                Some(kv) if self.is_current(kv, &value, lease) => Ok(false),
                _ => self
                    .put_if_locked(cancel, key, value, lease, lock)
                    .await
                    .map(|_| true),
            },
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(err) => {
                debug!(key, %err, "Unable to read key before updating it, writing it anyway");
                self.put_if_locked(cancel, key, value, lease, lock)
                    .await
                    .map(|_| true)
            }
        };
        self.observe(key, KIND_SET, "update_if_different_locked", started, &result);
        result.map_err(Error::hint)
    }

    fn is_current(&self, kv: &KeyValue, value: &Bytes, lease: bool) -> bool {
        (!lease || self.inner.leases.key_has_lease(&kv.key, kv.lease)) && kv.value == *value
    }

    /// Creates `key` only if it does not exist. Returns whether it was created.
    pub async fn create_only(
        &self,
        cancel: &CancellationToken,
        key: &str,
        value: Bytes,
        lease: bool,
    ) -> Result<bool> {
        let started = Instant::now();
        let result = self.create(cancel, key, value, lease).await;
        self.observe(key, KIND_SET, "create_only", started, &result);
        result.map_err(Error::hint)
    }

    async fn create(
        &self,
        cancel: &CancellationToken,
        key: &str,
        value: Bytes,
        lease: bool,
    ) -> Result<bool> {
        let lease_id = self.lease_for(cancel, key, lease).await?;
        let txn = TxnRequest::new()
            .when(Compare::absent(key))
            .and_then(TxnOp::put(key, value, lease_id));
        match self.txn(cancel, txn).await {
            Ok(response) => Ok(response.succeeded),
            Err(err) => {
                self.forget_expired(&err, lease_id);
                Err(err)
            }
        }
    }

    /// Creates `key` only if it does not exist and the lock is held. Returns `Ok(false)` when
    /// the key exists.
    pub async fn create_only_if_locked(
        &self,
        cancel: &CancellationToken,
        key: &str,
        value: Bytes,
        lease: bool,
        lock: &Lock,
    ) -> Result<bool> {
        let started = Instant::now();
        let result = self
            .create_if_locked(cancel, key, value, lease, lock)
            .await;
        self.observe(key, KIND_SET, "create_only_locked", started, &result);
        result.map_err(Error::hint)
    }

    async fn create_if_locked(
        &self,
        cancel: &CancellationToken,
        key: &str,
        value: Bytes,
        lease: bool,
        lock: &Lock,
    ) -> Result<bool> {
        let lease_id = self.lease_for(cancel, key, lease).await?;
        let txn = lock
            .comparator()
            .attach_to(TxnRequest::new().when(Compare::absent(key)))
            .and_then(TxnOp::put(key, value, lease_id))
            .or_else(TxnOp::get(key));
        let response = match self.txn(cancel, txn).await {
            Ok(response) => response,
            Err(err) => {
                self.forget_expired(&err, lease_id);
                return Err(err);
            }
        };
        if response.succeeded {
            return Ok(true);
        }
        // an existing key explains the failure, otherwise the lock is gone
        match first_kv(response.range(0)) {
            Some(kv) if kv.version != 0 => Ok(false),
            _ => Err(Error::LockLeaseExpired),
        }
    }

    /// Every key under `path` with its value, revision and lease.
    pub async fn list_prefix(
        &self,
        cancel: &CancellationToken,
        path: &str,
    ) -> Result<KeyValuePairs> {
        let started = Instant::now();
        let result = self
            .inner
            .limited(cancel, self.inner.store.range(RangeRequest::new(path, 0)))
            .await
            .map(|page| {
                page.kvs
                    .into_iter()
                    .map(|kv| (kv.key.clone(), Value::from(kv)))
                    .collect()
            });
        self.observe(path, KIND_READ, "list_prefix", started, &result);
        result.map_err(Error::hint)
    }

    /// Like [`Client::list_prefix`] but leases are not reported.
    pub async fn list_prefix_if_locked(
        &self,
        cancel: &CancellationToken,
        path: &str,
        lock: &Lock,
    ) -> Result<KeyValuePairs> {
        let started = Instant::now();
        let txn = lock
            .comparator()
            .attach_to(TxnRequest::new())
            .and_then(TxnOp::get_prefix(path));
        let result = self.txn(cancel, txn).await.and_then(|response| {
            if !response.succeeded {
                return Err(Error::LockLeaseExpired);
            }
            Ok(response
                .range(0)
                .unwrap_or_default()
                .iter()
                .map(|kv| (kv.key.clone(), Value::without_lease(kv.clone())))
                .collect())
        });
        self.observe(path, KIND_READ, "list_prefix_locked", started, &result);
        result.map_err(Error::hint)
    }
}

fn first_kv(kvs: Option<&[KeyValue]>) -> Option<&KeyValue> {
    kvs.and_then(<[KeyValue]>::first)
}
