//! Error injection controller for store testing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use kvstore_shared::error::StoreError;
use parking_lot::RwLock;
use tokio::sync::broadcast;

/// Signal delivered to every live watch stream.
#[derive(Debug, Clone)]
pub enum WatchSignal {
    /// End the stream without an error, like an idle transport being recycled.
    Close,
    /// Yield this error and end the stream.
    Fail(StoreError),
}

/// Forces failures, latency and watch interruptions on a [`super::SimpleKVStore`].
#[derive(Debug)]
pub struct KVErrorInjector {
    fail_next_gets: AtomicUsize,
    fail_next_puts: AtomicUsize,
    fail_next_deletes: AtomicUsize,
    fail_next_ranges: AtomicUsize,
    fail_next_watches: AtomicUsize,
    fail_next_txns: AtomicUsize,
    fail_next_lease_grants: AtomicUsize,
    fail_next_keep_alives: AtomicUsize,
    /// End watch streams after N batches (0 = disabled).
    close_watch_after_batches: AtomicUsize,
    /// Artificial latency applied to every call, in milliseconds.
    latency_ms: AtomicU64,
    unreachable_endpoints: RwLock<HashSet<String>>,
    watch_signal: broadcast::Sender<WatchSignal>,
}

impl Default for KVErrorInjector {
    fn default() -> Self {
        let (watch_signal, _) = broadcast::channel(16);
        Self {
            fail_next_gets: AtomicUsize::new(0),
            fail_next_puts: AtomicUsize::new(0),
            fail_next_deletes: AtomicUsize::new(0),
            fail_next_ranges: AtomicUsize::new(0),
            fail_next_watches: AtomicUsize::new(0),
            fail_next_txns: AtomicUsize::new(0),
            fail_next_lease_grants: AtomicUsize::new(0),
            fail_next_keep_alives: AtomicUsize::new(0),
            close_watch_after_batches: AtomicUsize::new(0),
            latency_ms: AtomicU64::new(0),
            unreachable_endpoints: RwLock::new(HashSet::new()),
            watch_signal,
        }
    }
}

impl KVErrorInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_gets(&self, count: usize) {
        self.fail_next_gets.store(count, Ordering::Relaxed);
    }

    pub fn fail_puts(&self, count: usize) {
        self.fail_next_puts.store(count, Ordering::Relaxed);
    }

    pub fn fail_deletes(&self, count: usize) {
        self.fail_next_deletes.store(count, Ordering::Relaxed);
    }

    pub fn fail_ranges(&self, count: usize) {
        self.fail_next_ranges.store(count, Ordering::Relaxed);
    }

    /// Fail the next N watch creations.
    pub fn fail_watches(&self, count: usize) {
        self.fail_next_watches.store(count, Ordering::Relaxed);
    }

    pub fn fail_txns(&self, count: usize) {
        self.fail_next_txns.store(count, Ordering::Relaxed);
    }

    pub fn fail_lease_grants(&self, count: usize) {
        self.fail_next_lease_grants.store(count, Ordering::Relaxed);
    }

    pub fn fail_keep_alives(&self, count: usize) {
        self.fail_next_keep_alives.store(count, Ordering::Relaxed);
    }

    /// End watch streams created from now on after N batches (0 = disabled).
    pub fn close_watch_after(&self, batches: usize) {
        self.close_watch_after_batches
            .store(batches, Ordering::Relaxed);
    }

    /// Cleanly close every live watch stream.
    pub fn close_watch_streams(&self) {
        let _ = self.watch_signal.send(WatchSignal::Close);
    }

    /// Make every live watch stream yield `err` and end.
    pub fn break_watch_streams(&self, err: StoreError) {
        let _ = self.watch_signal.send(WatchSignal::Fail(err));
    }

    pub fn set_latency(&self, ms: u64) {
        self.latency_ms.store(ms, Ordering::Relaxed);
    }

    pub fn set_endpoint_reachable(&self, endpoint: &str, reachable: bool) {
        let mut unreachable = self.unreachable_endpoints.write();
        if reachable {
            unreachable.remove(endpoint);
        } else {
            unreachable.insert(endpoint.to_string());
        }
    }

    pub(crate) fn is_endpoint_reachable(&self, endpoint: &str) -> bool {
        !self.unreachable_endpoints.read().contains(endpoint)
    }

    pub(crate) fn should_fail_get(&self) -> bool {
        Self::decrement_counter(&self.fail_next_gets)
    }

    pub(crate) fn should_fail_put(&self) -> bool {
        Self::decrement_counter(&self.fail_next_puts)
    }

    pub(crate) fn should_fail_delete(&self) -> bool {
        Self::decrement_counter(&self.fail_next_deletes)
    }

    pub(crate) fn should_fail_range(&self) -> bool {
        Self::decrement_counter(&self.fail_next_ranges)
    }

    pub(crate) fn should_fail_watch(&self) -> bool {
        Self::decrement_counter(&self.fail_next_watches)
    }

    pub(crate) fn should_fail_txn(&self) -> bool {
        Self::decrement_counter(&self.fail_next_txns)
    }

    pub(crate) fn should_fail_lease_grant(&self) -> bool {
        Self::decrement_counter(&self.fail_next_lease_grants)
    }

    pub(crate) fn should_fail_keep_alive(&self) -> bool {
        Self::decrement_counter(&self.fail_next_keep_alives)
    }

    pub(crate) fn close_after(&self) -> usize {
        self.close_watch_after_batches.load(Ordering::Relaxed)
    }

    pub(crate) fn watch_signals(&self) -> broadcast::Receiver<WatchSignal> {
        self.watch_signal.subscribe()
    }

    pub(crate) async fn apply_latency(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Decrements the counter, true if it was positive.
    fn decrement_counter(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn countdowns() {
        let injector = KVErrorInjector::new();
        assert!(!injector.should_fail_range());

        injector.fail_ranges(2);
        assert!(injector.should_fail_range());
        assert!(injector.should_fail_range());
        assert!(!injector.should_fail_range());

        injector.fail_txns(1);
        assert!(injector.should_fail_txn());
        assert!(!injector.should_fail_txn());

        injector.fail_keep_alives(1);
        assert!(injector.should_fail_keep_alive());
        assert!(!injector.should_fail_keep_alive());
    }

    #[test]
    fn endpoint_reachability() {
        let injector = KVErrorInjector::new();
        assert!(injector.is_endpoint_reachable("a:2379"));
        injector.set_endpoint_reachable("a:2379", false);
        assert!(!injector.is_endpoint_reachable("a:2379"));
        injector.set_endpoint_reachable("a:2379", true);
        assert!(injector.is_endpoint_reachable("a:2379"));
    }

    #[test]
    fn watch_signals_reach_subscribers() {
        let injector = KVErrorInjector::new();
        let mut signals = injector.watch_signals();
        injector.break_watch_streams(StoreError::Compacted { compact_revision: 3 });
        assert!(matches!(
            signals.try_recv(),
            Ok(WatchSignal::Fail(StoreError::Compacted { compact_revision: 3 }))
        ));
    }
}
