//! Admission control for calls made against the remote coordination store.
//!
//! Every outbound call waits on an [`ApiLimiter`], which bounds both the request rate (a token
//! bucket) and the number of calls in flight (a semaphore). The returned [`LimiterResult`] must
//! be resolved with [`LimiterResult::done`] or [`LimiterResult::error`]. An error carrying a
//! retry-after hint holds back further admissions until the hint has elapsed.
//!
//! The limiter supports a bootstrap regime: while an agent is starting up it may use a different
//! rate, switched once and for all to the steady-state rate when bootstrap completes.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bucket::TokenBucket;

mod bucket;

pub mod error;

pub use error::{Error, Result};

/// Admission control for a single outbound call.
#[trait_variant::make(Send)]
pub trait RateLimiter {
    /// Blocks until the call may proceed or `cancel` fires.
    async fn wait(&self, cancel: &CancellationToken) -> Result<LimiterResult>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct LimiterConfig {
    /// Steady-state requests per second, also the bucket burst.
    pub qps: f64,
    /// Rate used until [`ApiLimiter::finish_bootstrap`] is called.
    pub bootstrap_qps: Option<f64>,
    pub max_inflight: usize,
}

impl LimiterConfig {
    fn validate(&self) -> Result<()> {
        if !(self.qps.is_finite() && self.qps > 0.0) {
            return Err(Error::Config(format!("qps must be positive, got {}", self.qps)));
        }
        if let Some(bootstrap) = self.bootstrap_qps
            && !(bootstrap.is_finite() && bootstrap > 0.0)
        {
            return Err(Error::Config(format!(
                "bootstrap qps must be positive, got {bootstrap}"
            )));
        }
        if self.max_inflight == 0 {
            return Err(Error::Config("max inflight must be at least 1".to_string()));
        }
        Ok(())
    }
}

struct Shared {
    name: String,
    steady_qps: f64,
    bucket: TokenBucket,
    inflight: Arc<Semaphore>,
    /// Admissions are held back until this instant after an error with a retry-after hint.
    blocked_until: Mutex<Option<Instant>>,
    bootstrapping: AtomicBool,
}

impl Shared {
    fn hold_admissions_for(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut blocked = self.blocked_until.lock();
        if blocked.is_none_or(|current| current < until) {
            *blocked = Some(until);
        }
    }

    fn admissions_blocked_for(&self) -> Option<Duration> {
        let blocked = *self.blocked_until.lock();
        blocked
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|remaining| !remaining.is_zero())
    }
}

/// QPS plus max-in-flight limiter, cheap to clone.
#[derive(Clone)]
pub struct ApiLimiter {
    shared: Arc<Shared>,
}

impl ApiLimiter {
    pub fn new(name: impl Into<String>, config: LimiterConfig) -> Result<Self> {
        config.validate()?;
        let name = name.into();
        let initial_rate = config.bootstrap_qps.unwrap_or(config.qps);
        if config.bootstrap_qps.is_some() {
            info!(limiter = %name, qps = initial_rate, "Setting client QPS limit for bootstrap");
        }

        Ok(Self {
            shared: Arc::new(Shared {
                bucket: TokenBucket::new(initial_rate, config.qps.ceil() as usize),
                inflight: Arc::new(Semaphore::new(config.max_inflight)),
                blocked_until: Mutex::new(None),
                bootstrapping: AtomicBool::new(config.bootstrap_qps.is_some()),
                steady_qps: config.qps,
                name,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn current_rate(&self) -> f64 {
        self.shared.bucket.rate()
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.shared.bootstrapping.load(Ordering::Acquire)
    }

    /// Switches to the steady-state rate. Only the first call has an effect.
    pub fn finish_bootstrap(&self) {
        if self.shared.bootstrapping.swap(false, Ordering::AcqRel) {
            info!(
                limiter = %self.shared.name,
                qps = self.shared.steady_qps,
                "Bootstrap complete, updating client QPS limit"
            );
            self.shared.bucket.set_rate(self.shared.steady_qps);
        }
    }

    /// Finishes bootstrap once `signal` resolves (or its sender is dropped). Gives up when
    /// `cancel` fires first.
    pub fn finish_bootstrap_on(
        &self,
        signal: oneshot::Receiver<()>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = signal => limiter.finish_bootstrap(),
            }
        })
    }

    async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

impl RateLimiter for ApiLimiter {
    async fn wait(&self, cancel: &CancellationToken) -> Result<LimiterResult> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let started = Instant::now();

        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            permit = Arc::clone(&self.shared.inflight).acquire_owned() => {
                // the semaphore is never closed
                permit.map_err(|_| Error::Cancelled)?
            }
        };

        while let Some(remaining) = self.shared.admissions_blocked_for() {
            Self::sleep_or_cancel(remaining, cancel).await?;
        }

        let delay = self.shared.bucket.reserve();
        if !delay.is_zero()
            && let Err(e) = Self::sleep_or_cancel(delay, cancel).await
        {
            self.shared.bucket.refund();
            return Err(e);
        }

        Ok(LimiterResult {
            shared: Arc::clone(&self.shared),
            permit: Some(permit),
            waited: started.elapsed(),
        })
    }
}

/// Admission token for one call. Holds an in-flight slot until resolved.
#[must_use = "resolve the limiter result with done() or error()"]
pub struct LimiterResult {
    shared: Arc<Shared>,
    permit: Option<OwnedSemaphorePermit>,
    waited: Duration,
}

impl LimiterResult {
    /// Time spent waiting for admission.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn done(mut self) {
        self.permit.take();
    }

    /// Resolves a failed call. A `retry_after` hint holds back further admissions.
    pub fn error(mut self, err: &dyn Display, retry_after: Option<Duration>) {
        debug!(limiter = %self.shared.name, %err, ?retry_after, "Call failed");
        if let Some(delay) = retry_after {
            self.shared.hold_admissions_for(delay);
        }
        self.permit.take();
    }
}

impl Drop for LimiterResult {
    fn drop(&mut self) {
        if self.permit.is_some() {
            warn!(limiter = %self.shared.name, "Limiter result dropped without being resolved");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::task::JoinSet;

    use super::*;

    fn limiter(qps: f64, max_inflight: usize) -> ApiLimiter {
        ApiLimiter::new(
            "test",
            LimiterConfig {
                qps,
                bootstrap_qps: None,
                max_inflight,
            },
        )
        .unwrap()
    }

    #[test]
    fn rejects_invalid_config() {
        let result = ApiLimiter::new(
            "bad",
            LimiterConfig {
                qps: 0.0,
                bootstrap_qps: None,
                max_inflight: 1,
            },
        );
        assert!(matches!(result, Err(Error::Config(_))));

        let result = ApiLimiter::new(
            "bad",
            LimiterConfig {
                qps: 1.0,
                bootstrap_qps: None,
                max_inflight: 0,
            },
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn inflight_bound_is_respected() {
        let limiter = limiter(1000.0, 3);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let mut tasks = JoinSet::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let token = limiter.wait(&cancel).await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                token.done();
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn releasing_admits_next_waiter() {
        let limiter = limiter(1000.0, 1);
        let cancel = CancellationToken::new();
        let first = limiter.wait(&cancel).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.wait(&cancel).await.map(|t| t.done()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        first.done();
        tokio::time::timeout(Duration::from_millis(10), waiter)
            .await
            .expect("waiter should be admitted")
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_result_releases_slot() {
        let limiter = limiter(1000.0, 1);
        let cancel = CancellationToken::new();
        drop(limiter.wait(&cancel).await.unwrap());
        let second = tokio::time::timeout(Duration::from_millis(10), limiter.wait(&cancel)).await;
        assert!(second.is_ok());
        second.unwrap().unwrap().done();
    }

    #[tokio::test(start_paused = true)]
    async fn qps_paces_calls() {
        let limiter = limiter(5.0, 100);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..10 {
            limiter.wait(&cancel).await.unwrap().done();
        }
        // 5 from the initial burst, 5 more at 200ms each
        assert!(start.elapsed() >= Duration::from_millis(990));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_returns_error() {
        let limiter = limiter(1000.0, 1);
        let cancel = CancellationToken::new();
        let held = limiter.wait(&cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let waiter = {
            let limiter = limiter.clone();
            let waiter_cancel = waiter_cancel.clone();
            tokio::spawn(async move { limiter.wait(&waiter_cancel).await.map(|t| t.done()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter_cancel.cancel();

        assert_eq!(waiter.await.unwrap(), Err(Error::Cancelled));
        held.done();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(matches!(limiter.wait(&cancelled).await, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_holds_admissions() {
        let limiter = limiter(1000.0, 10);
        let cancel = CancellationToken::new();
        limiter
            .wait(&cancel)
            .await
            .unwrap()
            .error(&"too many requests", Some(Duration::from_millis(500)));

        let start = Instant::now();
        let token = limiter.wait(&cancel).await.unwrap();
        assert!(token.waited() >= Duration::from_millis(500));
        assert!(start.elapsed() >= Duration::from_millis(500));
        token.done();
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_rate_switches_once() {
        let limiter = ApiLimiter::new(
            "bootstrap",
            LimiterConfig {
                qps: 2.0,
                bootstrap_qps: Some(1.0),
                max_inflight: 10,
            },
        )
        .unwrap();
        assert!(limiter.is_bootstrapping());
        assert_eq!(limiter.current_rate(), 1.0);

        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let handle = limiter.finish_bootstrap_on(rx, cancel.clone());

        // drain the burst, the next token arrives at the bootstrap rate
        for _ in 0..2 {
            limiter.wait(&cancel).await.unwrap().done();
        }
        let start = Instant::now();
        limiter.wait(&cancel).await.unwrap().done();
        assert!(start.elapsed() >= Duration::from_millis(990));

        tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(!limiter.is_bootstrapping());
        assert_eq!(limiter.current_rate(), 2.0);

        limiter.finish_bootstrap();
        assert_eq!(limiter.current_rate(), 2.0);
    }
}
