//! List and watch of a key prefix.
//!
//! Each watcher is a task driving an explicit state machine:
//!
//! * `List` pages through the prefix at one revision, diffs it against the [`WatcherCache`] and
//!   emits `Synced` the first time it completes.
//! * `Watch` follows the change feed from the cursor, one revision past the last one seen.
//! * `Resync` is entered on a feed error, e.g. compaction. Every cached key is marked for
//!   deletion and the prefix is listed again, keys that are gone get their `Delete`.
//! * `Resubscribe` is entered when the feed ends without an error. The feed is opened again at
//!   the same cursor without touching the cache.
//!
//! The transitions are plain functions over the cache, the task only performs the I/O.

use std::sync::Arc;
use std::time::Duration;

use backoff::strategy::exponential::Exponential;
use bytes::Bytes;
use futures::StreamExt;
use kvstore_shared::store::{KeyValue, RangeRequest, WatchBatch, WatchEventKind, key_successor};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ClientInner;
use crate::error::{Error, Result};
use crate::types::{EventType, KeyValueEvent};

pub(crate) mod cache;

use cache::WatcherCache;

/// Events of one watcher. Ends when the watcher is cancelled or the client is closed.
pub type EventStream = ReceiverStream<KeyValueEvent>;

const EVENT_BUFFER: usize = 64;
const LIST_RETRY_MIN: Duration = Duration::from_millis(50);
const LIST_RETRY_MAX: Duration = Duration::from_secs(60);
/// List failures beyond this many attempts in a row are logged as warnings.
const LIST_RETRY_WARN_ATTEMPTS: u16 = 10;
const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchState {
    List,
    Watch { cursor: u64 },
    Resync,
    Resubscribe { cursor: u64 },
}

/// Events produced by a transition and the state it leads to.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Step {
    pub(crate) events: Vec<KeyValueEvent>,
    pub(crate) next: WatchState,
}

/// A complete list of the prefix at `revision`, in key order.
pub(crate) fn on_listed(
    cache: &mut WatcherCache,
    kvs: Vec<KeyValue>,
    revision: u64,
    emit_synced: bool,
) -> Step {
    let mut events = Vec::with_capacity(kvs.len() + 1);
    for kv in kvs {
        let typ = if cache.exists(&kv.key) {
            EventType::Modify
        } else {
            EventType::Create
        };
        cache.mark_in_use(&kv.key);
        events.push(KeyValueEvent::new(typ, kv.key, kv.value));
    }
    events.extend(
        cache
            .remove_deleted()
            .into_iter()
            .map(|key| KeyValueEvent::new(EventType::Delete, key, Bytes::new())),
    );
    if emit_synced {
        events.push(KeyValueEvent::synced());
    }
    Step {
        events,
        next: WatchState::Watch {
            cursor: revision + 1,
        },
    }
}

pub(crate) fn on_batch(cache: &mut WatcherCache, batch: WatchBatch) -> Step {
    let mut events = Vec::with_capacity(batch.events.len());
    for event in batch.events {
        let key = event.kv.key;
        match event.kind {
            WatchEventKind::Delete => {
                cache.remove(&key);
                events.push(KeyValueEvent::new(EventType::Delete, key, Bytes::new()));
            }
            WatchEventKind::Put => {
                let typ = if cache.exists(&key) {
                    EventType::Modify
                } else {
                    EventType::Create
                };
                cache.mark_in_use(&key);
                events.push(KeyValueEvent::new(typ, key, event.kv.value));
            }
        }
    }
    Step {
        events,
        next: WatchState::Watch {
            cursor: batch.revision + 1,
        },
    }
}

pub(crate) fn on_feed_error() -> Step {
    Step {
        events: Vec::new(),
        next: WatchState::Resync,
    }
}

pub(crate) fn on_feed_closed(cursor: u64) -> Step {
    Step {
        events: Vec::new(),
        next: WatchState::Resubscribe { cursor },
    }
}

/// Keys must be confirmed by the next list or they are reported deleted.
pub(crate) fn resync(cache: &mut WatcherCache) -> WatchState {
    cache.mark_all_for_deletion();
    WatchState::List
}

/// Starts a watcher on `prefix`. It runs until `cancel` fires or the client is closed.
pub(crate) fn spawn_watcher(
    client: &Arc<ClientInner>,
    cancel: CancellationToken,
    prefix: &str,
) -> EventStream {
    let (events, rx) = mpsc::channel(EVENT_BUFFER);
    let engine = WatchEngine {
        prefix: prefix.to_string(),
        client: Arc::clone(client),
        stop: client.cancel.child_token(),
        events,
        cache: WatcherCache::default(),
        synced: false,
    };
    client.tasks.spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = engine.run() => {}
        }
    });
    ReceiverStream::new(rx)
}

struct WatchEngine {
    prefix: String,
    client: Arc<ClientInner>,
    /// Cancelled when the client closes.
    stop: CancellationToken,
    events: mpsc::Sender<KeyValueEvent>,
    cache: WatcherCache,
    synced: bool,
}

impl WatchEngine {
    async fn run(mut self) {
        info!(prefix = %self.prefix, "Starting watcher");
        let mut state = WatchState::List;
        let mut backoff = Exponential::bounded(LIST_RETRY_MIN, LIST_RETRY_MAX);
        loop {
            if self.stop.is_cancelled() {
                break;
            }
            let next = match state {
                WatchState::List => self.list(&mut backoff).await,
                WatchState::Watch { cursor } => self.watch(cursor).await,
                WatchState::Resync => Some(resync(&mut self.cache)),
                WatchState::Resubscribe { cursor } => self.resubscribe(cursor).await,
            };
            match next {
                Some(next) => state = next,
                None => break,
            }
        }
        debug!(prefix = %self.prefix, "Watcher stopped");
    }

    async fn list(&mut self, backoff: &mut Exponential) -> Option<WatchState> {
        loop {
            if self.stop.is_cancelled() {
                return None;
            }
            match self.list_prefix().await {
                Ok((kvs, revision)) => {
                    backoff.reset();
                    let listed = kvs.len();
                    let step = on_listed(&mut self.cache, kvs, revision, !self.synced);
                    debug!(prefix = %self.prefix, listed, cached = self.cache.len(), revision, "Listed prefix");
                    self.synced = true;
                    return self.emit_all(step.events).await.then_some(step.next);
                }
                Err(Error::Cancelled) => return None,
                Err(err) => {
                    let attempt = backoff.current_attempt().saturating_add(1);
                    if attempt < LIST_RETRY_WARN_ATTEMPTS {
                        info!(prefix = %self.prefix, attempt, %err, "Unable to list keys before starting watcher");
                    } else {
                        warn!(prefix = %self.prefix, attempt, %err, "Unable to list keys before starting watcher");
                    }
                    if !backoff.wait(&self.stop).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Pages through the prefix. Pages after the first are read at the first page's revision
    /// so that concurrent writers cannot move the snapshot.
    async fn list_prefix(&self) -> Result<(Vec<KeyValue>, u64)> {
        let mut request = RangeRequest::new(&self.prefix, self.client.options.list_batch_size);
        let mut kvs = Vec::new();
        let mut revision = None;
        loop {
            let page = self
                .client
                .limited(&self.stop, self.client.store.range(request.clone()))
                .await?;
            let snapshot = *revision.get_or_insert(page.revision);
            request.revision = Some(snapshot);
            let next = page.kvs.last().map(|kv| key_successor(&kv.key));
            kvs.extend(page.kvs);
            match next {
                Some(next) if page.more => request.start_key = next,
                _ => return Ok((kvs, snapshot)),
            }
        }
    }

    async fn watch(&mut self, cursor: u64) -> Option<WatchState> {
        let mut cursor = cursor;
        let opened = self
            .client
            .limited(&self.stop, self.client.store.watch(&self.prefix, cursor))
            .await;
        let mut feed = match opened {
            Ok(feed) => feed,
            Err(Error::Cancelled) => return None,
            Err(err) => return Some(self.feed_failed(&err)),
        };
        debug!(prefix = %self.prefix, cursor, "Watching prefix");

        loop {
            let batch = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return None,
                batch = feed.next() => batch,
            };
            match batch {
                Some(Ok(batch)) => {
                    let step = on_batch(&mut self.cache, batch);
                    if let WatchState::Watch { cursor: next } = step.next {
                        cursor = next;
                    }
                    if !self.emit_all(step.events).await {
                        return None;
                    }
                }
                Some(Err(err)) => return Some(self.feed_failed(&err.into())),
                None => {
                    debug!(prefix = %self.prefix, cursor, "Watch channel closed, resubscribing");
                    return Some(on_feed_closed(cursor).next);
                }
            }
        }
    }

    fn feed_failed(&self, err: &Error) -> WatchState {
        if err.is_compacted() {
            info!(
                prefix = %self.prefix,
                "Tried watching on compacted revision, triggering relist of all keys"
            );
        } else {
            warn!(prefix = %self.prefix, %err, "Watch failed, relisting all keys");
        }
        on_feed_error().next
    }

    async fn resubscribe(&self, cursor: u64) -> Option<WatchState> {
        tokio::select! {
            _ = self.stop.cancelled() => None,
            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => Some(WatchState::Watch { cursor }),
        }
    }

    /// False once the watcher has to stop, either cancelled or nobody is listening anymore.
    async fn emit_all(&self, events: Vec<KeyValueEvent>) -> bool {
        for event in events {
            self.client
                .extra
                .metrics
                .watch_event(&self.prefix, &event.typ.to_string());
            let sent = tokio::select! {
                biased;
                _ = self.stop.cancelled() => false,
                sent = self.events.send(event) => sent.is_ok(),
            };
            if !sent {
                return false;
            }
        }
        true
    }
}
