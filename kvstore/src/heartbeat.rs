//! The heartbeat key proves that writes reach the store. One agent writes it periodically and
//! every client watches it, a stale heartbeat is reported as a quorum problem.

use std::sync::Arc;
use std::time::Duration;

use backoff::retry::{Retry, RetryError};
use backoff::strategy::fixed;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{Client, ClientInner};
use crate::config::HEARTBEAT_PATH;
use crate::error::Error;
use crate::types::EventType;
use crate::watch::spawn_watcher;

/// Quick retries of a failed write before waiting for the next interval.
const WRITE_RETRIES: usize = 2;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Writes the current time to the heartbeat key every heartbeat write interval, bound to a data
/// lease, until `cancel` fires or the client is closed.
pub async fn run_heartbeat_writer(client: Client, cancel: CancellationToken) {
    let interval = client.inner.extra.heartbeat_write_interval;
    let stop = client.inner.cancel.clone();
    loop {
        let now = chrono::Utc::now().to_rfc3339();
        let write = || {
            let client = client.clone();
            let cancel = cancel.clone();
            let now = now.clone();
            async move {
                client
                    .update(&cancel, HEARTBEAT_PATH, now.into(), true)
                    .await
            }
        };
        let retries = fixed::Interval::new(WRITE_RETRY_DELAY).take(WRITE_RETRIES);
        let can_retry = |err: &Error, _: usize| !matches!(err, Error::Cancelled);
        match Retry::new(retries, write, can_retry, cancel.clone()).await {
            Ok(()) => debug!(heartbeat = %now, "Wrote heartbeat"),
            Err(RetryError::Cancelled) => break,
            Err(RetryError::Failed(err)) => warn!(%err, "Unable to update heartbeat key"),
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Follows the heartbeat key and records when it last changed. The returned receiver fires once
/// the initial list of the key has completed.
pub(crate) fn spawn_heartbeat_watcher(client: &Arc<ClientInner>) -> oneshot::Receiver<()> {
    let (synced_tx, synced_rx) = oneshot::channel();
    let mut events = spawn_watcher(client, client.cancel.child_token(), HEARTBEAT_PATH);
    let client = Arc::clone(client);
    client.tasks.clone().spawn(async move {
        let mut synced = Some(synced_tx);
        while let Some(event) = events.next().await {
            match event.typ {
                // a deleted key says nothing about the writer
                EventType::Delete => {}
                EventType::Synced => {
                    if let Some(synced) = synced.take() {
                        let _ = synced.send(());
                    }
                }
                EventType::Create | EventType::Modify => {
                    debug!(key = %event.key, "Received heartbeat update");
                    *client.last_heartbeat.write() = Some(Instant::now());
                }
            }
        }
    });
    synced_rx
}

#[cfg(test)]
mod tests {
    use kvstore_testing::simplekvstore::SimpleKVStore;

    use super::*;
    use crate::client::test_client_with;
    use crate::config::{ClientOptions, ExtraOptions};

    #[tokio::test]
    async fn test_writer_feeds_watcher() {
        let store = SimpleKVStore::new(["a:2379"]);
        let extra = ExtraOptions {
            heartbeat_write_interval: Duration::from_millis(20),
            ..ExtraOptions::default()
        };
        let client = test_client_with(&store, ClientOptions::default(), extra);
        let synced = spawn_heartbeat_watcher(&client.inner);
        tokio::time::timeout(Duration::from_secs(1), synced)
            .await
            .unwrap()
            .unwrap();
        assert!(client.inner.last_heartbeat.read().is_none());

        let cancel = CancellationToken::new();
        let writer = tokio::spawn(run_heartbeat_writer(client.clone(), cancel.clone()));
        tokio::time::timeout(Duration::from_secs(1), async {
            while client.inner.last_heartbeat.read().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let written = store.snapshot()[HEARTBEAT_PATH].clone();
        let written = std::str::from_utf8(&written).unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(written).is_ok());
        assert_eq!(client.total_leases(), 1);

        cancel.cancel();
        writer.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn test_failed_write_is_retried() {
        let store = SimpleKVStore::new(["a:2379"]);
        let extra = ExtraOptions {
            heartbeat_write_interval: Duration::from_secs(60),
            ..ExtraOptions::default()
        };
        let client = test_client_with(&store, ClientOptions::default(), extra);
        store.error_injector().fail_puts(1);

        let cancel = CancellationToken::new();
        let writer = tokio::spawn(run_heartbeat_writer(client.clone(), cancel.clone()));
        tokio::time::timeout(Duration::from_secs(1), async {
            while !store.snapshot().contains_key(HEARTBEAT_PATH) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(store.calls().puts(), 2);

        cancel.cancel();
        writer.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn test_deleted_heartbeat_is_not_a_heartbeat() {
        let store = SimpleKVStore::new(["a:2379"]);
        let client = test_client_with(&store, ClientOptions::default(), ExtraOptions::default());
        let synced = spawn_heartbeat_watcher(&client.inner);
        tokio::time::timeout(Duration::from_secs(1), synced)
            .await
            .unwrap()
            .unwrap();

        let cancel = CancellationToken::new();
        client
            .update(&cancel, HEARTBEAT_PATH, "t".into(), false)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while client.inner.last_heartbeat.read().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let seen = *client.inner.last_heartbeat.read();

        client.delete(&cancel, HEARTBEAT_PATH).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*client.inner.last_heartbeat.read(), seen);
        client.close().await;
    }
}
