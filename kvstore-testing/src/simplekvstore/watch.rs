use std::collections::VecDeque;

use kvstore_shared::error::{Result, StoreError};
use kvstore_shared::store::{WatchBatch, WatchStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::error_injector::WatchSignal;

/// Replays history, then follows live updates for one prefix.
pub(crate) struct WatchCursor {
    prefix: String,
    from_revision: u64,
    replay: VecDeque<WatchBatch>,
    updates: broadcast::Receiver<WatchBatch>,
    signals: broadcast::Receiver<WatchSignal>,
    /// End after this many batches (0 = never).
    close_after: usize,
    delivered: usize,
    done: bool,
}

impl WatchCursor {
    pub(crate) fn new(
        prefix: &str,
        from_revision: u64,
        replay: Vec<WatchBatch>,
        updates: broadcast::Receiver<WatchBatch>,
        signals: broadcast::Receiver<WatchSignal>,
        close_after: usize,
    ) -> Self {
        Self {
            prefix: prefix.to_string(),
            from_revision,
            replay: replay.into(),
            updates,
            signals,
            close_after,
            delivered: 0,
            done: false,
        }
    }

    pub(crate) fn into_stream(self) -> WatchStream {
        Box::pin(futures::stream::unfold(self, |mut cursor| async move {
            let item = cursor.next_item().await?;
            Some((item, cursor))
        }))
    }

    async fn next_item(&mut self) -> Option<Result<WatchBatch>> {
        if self.done || (self.close_after > 0 && self.delivered >= self.close_after) {
            return None;
        }
        if let Some(batch) = self.replay.pop_front() {
            self.delivered += 1;
            return Some(Ok(batch));
        }

        loop {
            tokio::select! {
                biased;
                signal = self.signals.recv() => match signal {
                    Ok(WatchSignal::Close) | Err(RecvError::Closed) => return None,
                    Ok(WatchSignal::Fail(err)) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                    Err(RecvError::Lagged(_)) => {}
                },
                update = self.updates.recv() => match update {
                    Ok(batch) => {
                        if let Some(batch) = self.relevant(batch) {
                            self.delivered += 1;
                            return Some(Ok(batch));
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        self.done = true;
                        return Some(Err(StoreError::Other(format!(
                            "watcher fell behind by {missed} batches"
                        ))));
                    }
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }

    fn relevant(&self, mut batch: WatchBatch) -> Option<WatchBatch> {
        if batch.revision < self.from_revision {
            return None;
        }
        batch.events.retain(|e| e.kv.key.starts_with(&self.prefix));
        (!batch.events.is_empty()).then_some(batch)
    }
}
