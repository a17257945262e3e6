//! Multiplexing of keys onto remote leases.
//!
//! A [`LeaseManager`] attaches every key it is asked about to one of a small number of remote
//! leases, allocating a new lease only once the current one holds `max_keys_per_lease` keys. Each
//! lease is kept alive by its own task, the tasks live in a [`TaskTracker`] so that shutdown can
//! wait for every one of them before the transport goes away.
//!
//! Two managers exist per client: one for data keys with a long TTL and one for lock sessions
//! with a short TTL, so that losing a lock never prolongs the life of data leases.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kvstore_shared::error::StoreError;
use kvstore_shared::store::{LeaseId, RemoteStore};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Called with every key whose lease was found expired.
pub type ExpiredObserver = Arc<dyn Fn(&str) + Send + Sync>;

/// Observers keyed by the key prefix they are interested in.
#[derive(Clone, Default)]
pub(crate) struct ExpiredObservers {
    observers: Arc<RwLock<HashMap<String, ExpiredObserver>>>,
}

impl ExpiredObservers {
    /// `None` removes the observer for `prefix`.
    pub(crate) fn register(&self, prefix: &str, observer: Option<ExpiredObserver>) {
        let mut observers = self.observers.write();
        match observer {
            Some(observer) => {
                observers.insert(prefix.to_string(), observer);
            }
            None => {
                observers.remove(prefix);
            }
        }
    }

    pub(crate) fn notify(&self, key: &str) {
        // collected first, an observer may register another one
        let matching: Vec<ExpiredObserver> = self
            .observers
            .read()
            .iter()
            .filter(|(prefix, _)| key.starts_with(prefix.as_str()))
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in matching {
            observer(key);
        }
    }
}

/// A lease used for locking, together with a token cancelled once the lease is gone.
#[derive(Debug, Clone)]
pub struct Session {
    lease: LeaseId,
    ttl: Duration,
    done: CancellationToken,
}

impl Session {
    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The lease expired, was revoked or the manager stopped.
    pub fn is_expired(&self) -> bool {
        self.done.is_cancelled()
    }

    pub async fn expired(&self) {
        self.done.cancelled().await
    }
}

struct LeaseInfo {
    attached: usize,
    session: Session,
}

#[derive(Default)]
struct LeaseTable {
    /// Lease new keys are attached to.
    current: Option<LeaseId>,
    leases: HashMap<LeaseId, LeaseInfo>,
    keys: HashMap<String, LeaseId>,
}

impl LeaseTable {
    fn session_of(&self, key: &str) -> Option<Session> {
        let id = self.keys.get(key)?;
        self.leases.get(id).map(|info| info.session.clone())
    }

    fn attach_to_current(&mut self, key: &str, max_keys: usize) -> Option<Session> {
        let id = self.current?;
        let info = self.leases.get_mut(&id)?;
        if info.attached >= max_keys {
            return None;
        }
        info.attached += 1;
        self.keys.insert(key.to_string(), id);
        Some(info.session.clone())
    }

    fn insert(&mut self, key: &str, session: Session) {
        self.current = Some(session.lease);
        self.keys.insert(key.to_string(), session.lease);
        self.leases.insert(
            session.lease,
            LeaseInfo {
                attached: 1,
                session,
            },
        );
    }

    /// Detaches `key`, returns the lease if it just lost its last key.
    fn detach(&mut self, key: &str) -> Option<LeaseInfo> {
        let id = self.keys.remove(key)?;
        let info = self.leases.get_mut(&id)?;
        info.attached = info.attached.saturating_sub(1);
        if info.attached > 0 {
            return None;
        }
        if self.current == Some(id) {
            self.current = None;
        }
        self.leases.remove(&id)
    }

    /// Forgets a lease and returns the keys that were attached to it.
    fn discard(&mut self, id: LeaseId) -> Option<(LeaseInfo, Vec<String>)> {
        let info = self.leases.remove(&id)?;
        if self.current == Some(id) {
            self.current = None;
        }
        let mut keys = Vec::with_capacity(info.attached);
        self.keys.retain(|key, lease| {
            if *lease == id {
                keys.push(key.clone());
                false
            } else {
                true
            }
        });
        Some((info, keys))
    }
}

struct Inner {
    name: &'static str,
    store: Arc<dyn RemoteStore>,
    ttl: Duration,
    max_keys_per_lease: usize,
    table: Mutex<LeaseTable>,
    /// Serializes lease allocation so that concurrent callers share the new lease.
    acquiring: tokio::sync::Mutex<()>,
    observers: Option<ExpiredObservers>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

/// Hands out leases to keys. Cheap to clone.
#[derive(Clone)]
pub struct LeaseManager {
    inner: Arc<Inner>,
}

impl LeaseManager {
    /// `cancel` stops every keepalive task of the manager.
    pub(crate) fn new(
        name: &'static str,
        store: Arc<dyn RemoteStore>,
        ttl: Duration,
        max_keys_per_lease: usize,
        observers: Option<ExpiredObservers>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                store,
                ttl,
                max_keys_per_lease: max_keys_per_lease.max(1),
                table: Mutex::new(LeaseTable::default()),
                acquiring: tokio::sync::Mutex::new(()),
                observers,
                tasks: TaskTracker::new(),
                cancel,
            }),
        }
    }

    /// Lease `key` is, or now gets, attached to.
    pub async fn get_lease_id(&self, cancel: &CancellationToken, key: &str) -> Result<LeaseId> {
        Ok(self.get_session(cancel, key).await?.lease())
    }

    /// Session of the lease `key` is, or now gets, attached to.
    pub async fn get_session(&self, cancel: &CancellationToken, key: &str) -> Result<Session> {
        if let Some(session) = self.inner.table.lock().session_of(key) {
            return Ok(session);
        }

        let _acquiring = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            guard = self.inner.acquiring.lock() => guard,
        };

        {
            let mut table = self.inner.table.lock();
            if let Some(session) = table.session_of(key) {
                return Ok(session);
            }
            if let Some(session) = table.attach_to_current(key, self.inner.max_keys_per_lease) {
                return Ok(session);
            }
        }

        let ttl_secs = i64::try_from(self.inner.ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        let lease = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            lease = self.inner.store.lease_grant(ttl_secs) => lease?,
        };
        let session = Session {
            lease,
            ttl: self.inner.ttl,
            done: self.inner.cancel.child_token(),
        };
        self.inner.table.lock().insert(key, session.clone());
        info!(manager = self.inner.name, lease, ttl = ?self.inner.ttl, "Acquired new lease");

        let manager = self.clone();
        let keepalive = session.clone();
        self.inner
            .tasks
            .spawn(async move { manager.keep_alive(keepalive).await });
        Ok(session)
    }

    /// Detaches `key`, revoking its lease when no other key uses it.
    pub fn release(&self, key: &str) {
        let released = self.inner.table.lock().detach(key);
        if let Some(info) = released {
            self.revoke(info.session);
        }
    }

    /// Detaches every key starting with `prefix`.
    pub fn release_prefix(&self, prefix: &str) {
        let keys: Vec<String> = self
            .inner
            .table
            .lock()
            .keys
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        for key in keys {
            self.release(&key);
        }
    }

    /// Forgets `lease` if `err` says it no longer exists remotely.
    pub fn cancel_if_expired(&self, err: &Error, lease: LeaseId) {
        if err.is_lease_not_found() {
            warn!(manager = self.inner.name, lease, "Lease not found, discarding it");
            if let Some(keys) = self.discard(lease) {
                let manager = self.clone();
                self.inner.tasks.spawn(async move {
                    manager.notify_expired(&keys);
                });
            }
        }
    }

    pub fn key_has_lease(&self, key: &str, lease: LeaseId) -> bool {
        self.inner.table.lock().keys.get(key) == Some(&lease)
    }

    pub fn total_leases(&self) -> usize {
        self.inner.table.lock().leases.len()
    }

    /// Stops every keepalive task. Leases are left to expire remotely.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    /// Waits until every task spawned by the manager has finished.
    pub async fn wait(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    fn discard(&self, lease: LeaseId) -> Option<Vec<String>> {
        let (info, keys) = self.inner.table.lock().discard(lease)?;
        info.session.done.cancel();
        Some(keys)
    }

    fn notify_expired(&self, keys: &[String]) {
        if let Some(observers) = &self.inner.observers {
            for key in keys {
                observers.notify(key);
            }
        }
    }

    fn revoke(&self, session: Session) {
        session.done.cancel();
        let store = Arc::clone(&self.inner.store);
        let cancel = self.inner.cancel.clone();
        let name = self.inner.name;
        self.inner.tasks.spawn(async move {
            let lease = session.lease;
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = store.lease_revoke(lease) => match result {
                    Ok(()) => debug!(manager = name, lease, "Revoked lease"),
                    Err(StoreError::LeaseNotFound) => {}
                    Err(err) => warn!(manager = name, lease, ?err, "Failed to revoke lease"),
                },
            }
        });
    }

    async fn keep_alive(&self, session: Session) {
        let period = self.inner.ttl / 3;
        loop {
            tokio::select! {
                _ = session.done.cancelled() => return,
                _ = tokio::time::sleep(period) => {}
            }
            let result = tokio::select! {
                _ = session.done.cancelled() => return,
                result = self.inner.store.lease_keep_alive(session.lease) => result,
            };
            match result {
                Ok(_) => {}
                Err(StoreError::LeaseNotFound) => {
                    warn!(
                        manager = self.inner.name,
                        lease = session.lease,
                        "Lease expired remotely"
                    );
                    if let Some(keys) = self.discard(session.lease) {
                        self.notify_expired(&keys);
                    }
                    return;
                }
                Err(err) => {
                    warn!(
                        manager = self.inner.name,
                        lease = session.lease,
                        ?err,
                        "Failed to renew lease, will retry"
                    );
                }
            }
        }
    }
}
