//! Periodic connectivity and quorum check feeding [`crate::Client::status`].

use std::sync::Arc;
use std::time::Duration;

use backoff::strategy::exponential::Exponential;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::ClientInner;
use crate::config::INIT_LOCK_PATH;
use crate::error::{Error, Result};
use crate::types::ConnectionStatus;

const QUORUM_RETRY_MIN: Duration = Duration::from_millis(100);
const QUORUM_RETRY_MAX: Duration = Duration::from_secs(2);

/// Starts the status monitor, it runs until the client is closed.
pub(crate) fn spawn_status_monitor(client: &Arc<ClientInner>) {
    let monitor = StatusMonitor::new(Arc::clone(client));
    let cancel = client.status_cancel.clone();
    client.tasks.spawn(monitor.run(cancel));
}

pub(crate) struct StatusMonitor {
    client: Arc<ClientInner>,
    /// `None` once the channel has been handed to another monitor.
    errors: Option<mpsc::Sender<Error>>,
    consecutive_quorum_errors: u32,
}

impl StatusMonitor {
    pub(crate) fn new(client: Arc<ClientInner>) -> Self {
        let errors = client.take_status_errors_sender();
        {
            // a heartbeat that never shows up is as stale as one that stopped
            let mut last_heartbeat = client.last_heartbeat.write();
            if last_heartbeat.is_none() {
                *last_heartbeat = Some(Instant::now());
            }
        }
        Self {
            client,
            errors,
            consecutive_quorum_errors: 0,
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        loop {
            let all_connected = self.check(&cancel).await;
            let interval = self.client.extra.status_check_interval(all_connected);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("Status monitor stopped");
        // dropping the sender closes the error channel
    }

    /// Runs one check, updates the client status and returns whether every endpoint responded.
    pub(crate) async fn check(&mut self, cancel: &CancellationToken) -> bool {
        let extra = &self.client.extra;
        let endpoints = self.client.store.endpoints();

        let quorum_error = match self.heartbeat_error() {
            Some(err) => Some(err),
            None if extra.no_lock_quorum_check => None,
            None => self.check_quorum(cancel).await.err(),
        };

        let mut ok = 0;
        let mut details = Vec::with_capacity(endpoints.len());
        if extra.no_endpoint_status_checks {
            details.push("endpoint status checks are disabled".to_string());
            if quorum_error.is_none() {
                ok = endpoints.len();
            }
        } else {
            for endpoint in &endpoints {
                let status = tokio::time::timeout(
                    extra.status_check_timeout,
                    self.client.store.endpoint_status(endpoint),
                )
                .await;
                match status {
                    Ok(Ok(status)) => {
                        ok += 1;
                        let leader = if status.is_leader { " (Leader)" } else { "" };
                        details.push(format!("{endpoint} - {}{leader}", status.version));
                    }
                    Ok(Err(err)) => details.push(format!("{endpoint} - {err}")),
                    Err(elapsed) => details.push(format!("{endpoint} - {}", Error::from(elapsed))),
                }
            }
        }

        let quorum = match &quorum_error {
            Some(err) => {
                self.consecutive_quorum_errors += 1;
                extra.metrics.quorum_error(&err.to_string());
                format!(
                    "{err}, consecutive-errors={}",
                    self.consecutive_quorum_errors
                )
            }
            None => {
                self.consecutive_quorum_errors = 0;
                "true".to_string()
            }
        };

        let status = match quorum_error {
            Some(err) if self.consecutive_quorum_errors > extra.max_consecutive_quorum_errors => {
                let err = Error::Quorum(format!(
                    "quorum check failed {} times in a row: {err}",
                    self.consecutive_quorum_errors
                ));
                self.report(err.clone());
                ConnectionStatus::failure(err)
            }
            _ if !endpoints.is_empty() && ok == 0 => {
                let err =
                    Error::Connection("not able to connect to any kvstore endpoints".to_string());
                self.report(err.clone());
                ConnectionStatus::failure(err)
            }
            _ => ConnectionStatus::ok(format!(
                "kvstore: {ok}/{} connected, leases={}, lock leases={}, has-quorum={quorum}: {}",
                endpoints.len(),
                self.client.leases.total_leases(),
                self.client.locks.leases().total_leases(),
                details.join("; ")
            )),
        };
        self.client.set_status(status);
        ok == endpoints.len()
    }

    fn heartbeat_error(&self) -> Option<Error> {
        let last = (*self.client.last_heartbeat.read())?;
        let since = last.elapsed();
        let max_silence = self.client.extra.heartbeat_write_interval.saturating_mul(2);
        (since > max_silence).then(|| {
            Error::Quorum(format!(
                "{} since last heartbeat update has been received",
                humantime::format_duration(since)
            ))
        })
    }

    /// Takes and releases a lock of its own, which needs a working quorum. Failed attempts are
    /// retried until the status check timeout.
    async fn check_quorum(&self, cancel: &CancellationToken) -> Result<()> {
        let path = format!("{INIT_LOCK_PATH}/{}", uuid::Uuid::new_v4());
        let deadline = Instant::now() + self.client.extra.status_check_timeout;
        let mut backoff = Exponential::bounded(QUORUM_RETRY_MIN, QUORUM_RETRY_MAX);
        loop {
            let err = match self.client.locks.lock_path_until(cancel, &path, deadline).await {
                Ok(lock) => {
                    return match tokio::time::timeout_at(deadline, lock.unlock(cancel)).await {
                        Ok(unlocked) => unlocked.map_err(lock_error),
                        Err(elapsed) => Err(lock_error(elapsed.into())),
                    };
                }
                Err(Error::Cancelled) => return Err(lock_error(Error::Cancelled)),
                Err(err) => err,
            };
            debug!(%err, attempt = backoff.current_attempt(), "Quorum check lock failed");
            let retry = tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => false,
                retry = backoff.wait(cancel) => retry,
            };
            if !retry {
                return Err(lock_error(err));
            }
        }
    }

    fn report(&self, err: Error) {
        let Some(errors) = &self.errors else {
            return;
        };
        match errors.try_send(err) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Status check error channel is full, dropping this error")
            }
        }
    }
}

fn lock_error(err: Error) -> Error {
    match err {
        Error::Lock(_) => err,
        other => Error::Lock(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use kvstore_testing::simplekvstore::SimpleKVStore;

    use super::*;
    use crate::client::{Client, test_client_with};
    use crate::config::{ClientOptions, ExtraOptions};
    use crate::types::StatusState;

    fn client(store: &SimpleKVStore, extra: ExtraOptions) -> Client {
        test_client_with(store, ClientOptions::default(), extra)
    }

    #[tokio::test]
    async fn test_healthy_cluster_reports_ok() {
        let store = SimpleKVStore::new(["a:2379", "b:2379"]);
        let client = client(&store, ExtraOptions::default());
        let mut monitor = StatusMonitor::new(Arc::clone(&client.inner));

        assert!(monitor.check(&CancellationToken::new()).await);
        let status = client.status();
        assert_eq!(status.state, StatusState::Ok);
        assert!(
            status
                .message
                .starts_with("kvstore: 2/2 connected, leases=0, lock leases=0, has-quorum=true: "),
            "{}",
            status.message
        );
        assert!(status.message.contains("a:2379 - "));
        assert!(status.message.contains("(Leader)"));
        // the quorum lock is gone
        assert!(store.snapshot().keys().all(|k| !k.starts_with(INIT_LOCK_PATH)));
        client.close().await;
    }

    #[tokio::test]
    async fn test_unreachable_endpoints() {
        let store = SimpleKVStore::new(["a:2379", "b:2379"]);
        let client = client(&store, ExtraOptions::default());
        let mut monitor = StatusMonitor::new(Arc::clone(&client.inner));
        let mut errors = client.status_check_errors().unwrap();
        let cancel = CancellationToken::new();

        store.error_injector().set_endpoint_reachable("b:2379", false);
        assert!(!monitor.check(&cancel).await);
        let status = client.status();
        assert_eq!(status.state, StatusState::Ok);
        assert!(status.message.starts_with("kvstore: 1/2 connected"));

        store.error_injector().set_endpoint_reachable("a:2379", false);
        assert!(!monitor.check(&cancel).await);
        let status = client.status();
        assert_eq!(status.state, StatusState::Failure);
        assert!(status.message.contains("not able to connect to any kvstore endpoints"));
        assert!(matches!(errors.next().await, Some(Error::Connection(_))));
        client.close().await;
    }

    #[tokio::test]
    async fn test_disabled_endpoint_checks() {
        let store = SimpleKVStore::new(["a:2379"]);
        let extra = ExtraOptions {
            no_endpoint_status_checks: true,
            no_lock_quorum_check: true,
            ..ExtraOptions::default()
        };
        let client = client(&store, extra);
        let mut monitor = StatusMonitor::new(Arc::clone(&client.inner));

        store.error_injector().set_endpoint_reachable("a:2379", false);
        assert!(monitor.check(&CancellationToken::new()).await);
        assert_eq!(
            client.status().message,
            "kvstore: 1/1 connected, leases=0, lock leases=0, has-quorum=true: endpoint status checks are disabled"
        );
        assert_eq!(store.calls().txns(), 0);
        client.close().await;
    }

    #[tokio::test]
    async fn test_stale_heartbeat_fails_after_consecutive_errors() {
        let store = SimpleKVStore::new(["a:2379"]);
        let extra = ExtraOptions {
            heartbeat_write_interval: Duration::from_millis(10),
            no_lock_quorum_check: true,
            ..ExtraOptions::default()
        };
        let client = client(&store, extra);
        let mut monitor = StatusMonitor::new(Arc::clone(&client.inner));
        let mut errors = client.status_check_errors().unwrap();
        let cancel = CancellationToken::new();

        *client.inner.last_heartbeat.write() = Some(Instant::now() - Duration::from_secs(1));
        for attempt in 1..=2 {
            monitor.check(&cancel).await;
            let status = client.status();
            assert_eq!(status.state, StatusState::Ok);
            assert!(status.message.contains("since last heartbeat update has been received"));
            assert!(
                status
                    .message
                    .contains(&format!("consecutive-errors={attempt}"))
            );
        }

        monitor.check(&cancel).await;
        let status = client.status();
        assert_eq!(status.state, StatusState::Failure);
        assert!(status.message.contains("quorum check failed 3 times in a row"));
        assert!(matches!(errors.next().await, Some(Error::Quorum(_))));

        // a fresh heartbeat resets the count
        *client.inner.last_heartbeat.write() = Some(Instant::now());
        monitor.check(&cancel).await;
        assert_eq!(client.status().state, StatusState::Ok);
        assert!(client.status().message.contains("has-quorum=true"));
        client.close().await;
    }

    #[tokio::test]
    async fn test_failed_quorum_lock() {
        let store = SimpleKVStore::new(["a:2379"]);
        let extra = ExtraOptions {
            status_check_timeout: Duration::from_millis(300),
            ..ExtraOptions::default()
        };
        let client = client(&store, extra);
        let mut monitor = StatusMonitor::new(Arc::clone(&client.inner));

        store.error_injector().fail_lease_grants(usize::MAX);
        monitor.check(&CancellationToken::new()).await;
        let message = client.status().message;
        assert!(
            message.contains("has-quorum=unable to acquire lock: "),
            "{message}"
        );
        assert!(message.contains("consecutive-errors=1"));
        assert!(store.calls().lease_grants() > 1);
        client.close().await;
    }

    #[tokio::test]
    async fn test_quorum_lock_retries_transient_failure() {
        let store = SimpleKVStore::new(["a:2379"]);
        let client = client(&store, ExtraOptions::default());
        let mut monitor = StatusMonitor::new(Arc::clone(&client.inner));

        store.error_injector().fail_txns(1);
        monitor.check(&CancellationToken::new()).await;
        let message = client.status().message;
        assert!(message.contains("lock leases=0, has-quorum=true"), "{message}");
        client.close().await;
    }

    #[tokio::test]
    async fn test_timed_out_quorum_lock_releases_lock_lease() {
        let store = SimpleKVStore::new(["a:2379"]);
        let extra = ExtraOptions {
            status_check_timeout: Duration::from_millis(50),
            ..ExtraOptions::default()
        };
        let client = client(&store, extra);
        let mut monitor = StatusMonitor::new(Arc::clone(&client.inner));
        let cancel = CancellationToken::new();

        store.error_injector().set_latency(30);
        monitor.check(&cancel).await;
        assert!(client.status().message.contains("has-quorum=unable to acquire lock: "));
        assert_eq!(client.inner.locks.leases().total_leases(), 0);

        store.error_injector().set_latency(0);
        for _ in 0..3 {
            monitor.check(&cancel).await;
            let message = client.status().message;
            assert!(message.contains("lock leases=0, has-quorum=true"), "{message}");
        }
        assert!(store.snapshot().keys().all(|k| !k.starts_with(INIT_LOCK_PATH)));
        client.close().await;
    }

    #[tokio::test]
    async fn test_missing_heartbeat_fails_quorum() {
        let store = SimpleKVStore::new(["a:2379"]);
        let extra = ExtraOptions {
            heartbeat_write_interval: Duration::from_millis(10),
            max_consecutive_quorum_errors: 0,
            no_lock_quorum_check: true,
            ..ExtraOptions::default()
        };
        let client = client(&store, extra);
        let mut monitor = StatusMonitor::new(Arc::clone(&client.inner));
        let mut errors = client.status_check_errors().unwrap();
        assert!(client.inner.last_heartbeat.read().is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        monitor.check(&CancellationToken::new()).await;
        let status = client.status();
        assert_eq!(status.state, StatusState::Failure);
        assert!(status.message.contains("since last heartbeat update has been received"));
        assert!(matches!(errors.next().await, Some(Error::Quorum(_))));
        client.close().await;
    }

    #[tokio::test]
    async fn test_close_stops_monitor_and_closes_errors() {
        let store = SimpleKVStore::new(["a:2379"]);
        let client = client(&store, ExtraOptions::default());
        let mut errors = client.status_check_errors().unwrap();
        spawn_status_monitor(&client.inner);

        tokio::time::timeout(Duration::from_secs(1), async {
            while client.status().state != StatusState::Ok {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        client.close().await;
        assert!(errors.next().await.is_none());
    }
}
