//! The coordination client handed out by [`crate::connect`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use kvstore_shared::store::RemoteStore;
use kvstore_throttling::{ApiLimiter, RateLimiter};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::config::{ClientOptions, ExtraOptions};
use crate::error::{Error, Result};
use crate::lease::{ExpiredObserver, ExpiredObservers, LeaseManager};
use crate::lock::{Lock, LockManager};
use crate::types::ConnectionStatus;
use crate::watch::{EventStream, spawn_watcher};

mod ops;

/// Capacity of the status error channel, errors are dropped when it is full.
const STATUS_ERRORS_BUFFER: usize = 128;

pub(crate) struct ClientInner {
    pub(crate) store: Arc<dyn RemoteStore>,
    pub(crate) limiter: ApiLimiter,
    /// Leases of data keys.
    pub(crate) leases: LeaseManager,
    pub(crate) locks: LockManager,
    observers: ExpiredObservers,
    pub(crate) options: ClientOptions,
    pub(crate) extra: ExtraOptions,
    status: RwLock<ConnectionStatus>,
    pub(crate) last_heartbeat: RwLock<Option<Instant>>,
    status_errors_tx: Mutex<Option<mpsc::Sender<Error>>>,
    status_errors_rx: Mutex<Option<mpsc::Receiver<Error>>>,
    /// Cancelled when the client closes, parent of every other token of the client.
    pub(crate) cancel: CancellationToken,
    pub(crate) status_cancel: CancellationToken,
    /// Watchers, the heartbeat watcher and the status monitor.
    pub(crate) tasks: TaskTracker,
    closed: AtomicBool,
}

impl ClientInner {
    /// Runs `call` once admitted by the limiter and resolves the admission with its outcome.
    pub(crate) async fn limited<T>(
        &self,
        cancel: &CancellationToken,
        call: impl Future<Output = kvstore_shared::error::Result<T>>,
    ) -> Result<T> {
        let admission = self.limiter.wait(cancel).await?;
        self.extra
            .metrics
            .limiter_waited(self.limiter.name(), admission.waited());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                admission.error(&Error::Cancelled, None);
                Err(Error::Cancelled)
            }
            result = call => match result {
                Ok(value) => {
                    admission.done();
                    Ok(value)
                }
                Err(err) => {
                    admission.error(&err, None);
                    Err(err.into())
                }
            },
        }
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        *self.status.write() = status;
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.status.read().clone()
    }

    /// Sender of the status error channel, taken once by the status monitor.
    pub(crate) fn take_status_errors_sender(&self) -> Option<mpsc::Sender<Error>> {
        self.status_errors_tx.lock().take()
    }
}

/// Handle on a connected coordination client. Clones share the connection.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoints", &self.inner.store.endpoints())
            .field("status", &self.inner.status())
            .finish()
    }
}

impl Client {
    /// Wires the limiter, lease managers and lock manager around an established transport.
    pub(crate) fn build(
        store: Arc<dyn RemoteStore>,
        options: ClientOptions,
        mut extra: ExtraOptions,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let bootstrap_complete = extra.bootstrap_complete.take();
        let limiter = ApiLimiter::new(
            extra.session_name(),
            options.limiter_config(bootstrap_complete.is_some()),
        )?;
        if let Some(signal) = bootstrap_complete {
            // ends by itself once the client is closed
            let _ = limiter.finish_bootstrap_on(signal, cancel.clone());
        }

        let observers = ExpiredObservers::default();
        let leases = LeaseManager::new(
            "data",
            Arc::clone(&store),
            extra.lease_ttl,
            extra.max_keys_per_lease,
            Some(observers.clone()),
            cancel.child_token(),
        );
        let lock_leases = LeaseManager::new(
            "lock",
            Arc::clone(&store),
            extra.lock_lease_ttl,
            extra.max_keys_per_lease,
            None,
            cancel.child_token(),
        );
        let locks = LockManager::new(Arc::clone(&store), lock_leases, extra.lock_timeout);
        let (status_errors_tx, status_errors_rx) = mpsc::channel(STATUS_ERRORS_BUFFER);

        Ok(Client {
            inner: Arc::new(ClientInner {
                store,
                limiter,
                leases,
                locks,
                observers,
                options,
                extra,
                status: RwLock::new(ConnectionStatus::warning(
                    "Waiting for initial connection to be established",
                )),
                last_heartbeat: RwLock::new(None),
                status_errors_tx: Mutex::new(Some(status_errors_tx)),
                status_errors_rx: Mutex::new(Some(status_errors_rx)),
                status_cancel: cancel.child_token(),
                cancel,
                tasks: TaskTracker::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Latest connectivity snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status()
    }

    /// Errors found by the status monitor. Only the first caller gets the stream, it ends when
    /// the client is closed.
    pub fn status_check_errors(&self) -> Option<ReceiverStream<Error>> {
        self.inner
            .status_errors_rx
            .lock()
            .take()
            .map(ReceiverStream::new)
    }

    /// Calls `observer` for every key under `prefix` whose data lease is found expired. `None`
    /// removes the observer.
    pub fn register_lease_expired_observer(&self, prefix: &str, observer: Option<ExpiredObserver>) {
        self.inner.observers.register(prefix, observer);
    }

    /// Lists `prefix` and follows its changes until `cancel` fires or the client is closed.
    pub fn watch(&self, cancel: CancellationToken, prefix: &str) -> EventStream {
        spawn_watcher(&self.inner, cancel, prefix)
    }

    pub fn list_and_watch(&self, cancel: CancellationToken, prefix: &str) -> EventStream {
        self.watch(cancel, prefix)
    }

    /// Acquires the distributed lock at `path`.
    pub async fn lock_path(&self, cancel: &CancellationToken, path: &str) -> Result<Lock> {
        self.inner.locks.lock_path(cancel, path).await
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.inner.store.endpoints()
    }

    /// Number of data leases currently in use.
    pub fn total_leases(&self) -> usize {
        self.inner.leases.total_leases()
    }

    /// Stops the status monitor and every watcher, waits for all background tasks including the
    /// lease keepalives, then releases the transport.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.status_cancel.cancel();
        self.inner.cancel.cancel();
        self.inner.status_errors_tx.lock().take();

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.leases.stop();
        self.inner.locks.leases().stop();
        self.inner.leases.wait().await;
        self.inner.locks.leases().wait().await;

        self.inner.store.close().await;
        info!("Closed kvstore client");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
pub(crate) fn test_client(
    store: &kvstore_testing::simplekvstore::SimpleKVStore,
    options: ClientOptions,
) -> Client {
    test_client_with(store, options, ExtraOptions::default())
}

#[cfg(test)]
pub(crate) fn test_client_with(
    store: &kvstore_testing::simplekvstore::SimpleKVStore,
    options: ClientOptions,
    extra: ExtraOptions,
) -> Client {
    let options = ClientOptions {
        endpoint: options.endpoint.or_else(|| Some("a:2379".to_string())),
        ..options
    };
    Client::build(Arc::new(store.clone()), options, extra).expect("valid test client")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use kvstore_testing::simplekvstore::SimpleKVStore;

    use super::*;
    use crate::types::StatusState;

    #[tokio::test]
    async fn test_initial_status_is_warning() {
        let store = SimpleKVStore::new(["a:2379"]);
        let client = test_client(&store, ClientOptions::default());
        let status = client.status();
        assert_eq!(status.state, StatusState::Warning);
        assert_eq!(
            status.message,
            "Waiting for initial connection to be established"
        );
        client.close().await;
    }

    #[tokio::test]
    async fn test_close_waits_for_keepalives_then_closes_store() {
        let store = SimpleKVStore::new(["a:2379"]);
        let client = test_client(&store, ClientOptions::default());
        let cancel = CancellationToken::new();
        client
            .update(&cancel, "agents/state/n1", "v".into(), true)
            .await
            .unwrap();
        let lock = client.lock_path(&cancel, "locks/x").await.unwrap();
        let mut errors = client.status_check_errors().unwrap();
        assert!(client.status_check_errors().is_none());

        tokio::time::timeout(Duration::from_secs(2), client.close())
            .await
            .unwrap();
        assert!(client.is_closed());
        assert!(store.is_closed());
        assert!(lock.session().is_expired());
        assert!(errors.next().await.is_none());

        // idempotent
        client.close().await;
    }

    #[tokio::test]
    async fn test_limited_resolves_admission() {
        let store = SimpleKVStore::new(["a:2379"]);
        let options = ClientOptions {
            max_inflight: Some(1),
            ..ClientOptions::default()
        };
        let client = test_client(&store, options);
        let cancel = CancellationToken::new();

        store.error_injector().fail_gets(1);
        assert!(client.get(&cancel, "k").await.is_err());
        // the failed call gave its slot back
        assert_eq!(client.get(&cancel, "k").await.unwrap(), None);
        client.close().await;
    }
}
