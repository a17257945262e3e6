use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Continuously refilled token bucket. Callers reserve a token up front and then sleep for the
/// returned delay, so concurrent waiters queue in arrival order instead of racing for refills.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    /// Tokens added per second.
    rate: f64,
    burst: f64,
    /// Goes negative while reservations are outstanding.
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }
}

impl TokenBucket {
    /// The bucket starts full.
    pub(crate) fn new(rate: f64, burst: usize) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            state: Mutex::new(BucketState {
                rate,
                burst,
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    pub(crate) fn rate(&self) -> f64 {
        self.state.lock().rate
    }

    /// Changes the refill rate. Tokens accumulated under the old rate are kept.
    pub(crate) fn set_rate(&self, rate: f64) {
        let mut state = self.state.lock();
        state.refill(Instant::now());
        state.rate = rate;
    }

    /// Takes one token and returns how long the caller has to wait before using it.
    pub(crate) fn reserve(&self) -> Duration {
        let mut state = self.state.lock();
        state.refill(Instant::now());
        state.tokens -= 1.0;
        if state.tokens >= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(-state.tokens / state.rate)
    }

    /// Returns a reserved token that was never used.
    pub(crate) fn refund(&self) {
        let mut state = self.state.lock();
        state.tokens = (state.tokens + 1.0).min(state.burst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_then_paced() {
        let bucket = TokenBucket::new(10.0, 2);
        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::ZERO);

        let third = bucket.reserve();
        assert!(third > Duration::from_millis(90) && third <= Duration::from_millis(100));
        let fourth = bucket.reserve();
        assert!(fourth > Duration::from_millis(190) && fourth <= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn refills_over_time_up_to_burst() {
        let bucket = TokenBucket::new(10.0, 3);
        for _ in 0..3 {
            bucket.reserve();
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        for _ in 0..3 {
            assert_eq!(bucket.reserve(), Duration::ZERO);
        }
        assert!(bucket.reserve() > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn refund_restores_token() {
        let bucket = TokenBucket::new(1.0, 1);
        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert!(bucket.reserve() > Duration::ZERO);
        bucket.refund();
        bucket.refund();
        assert_eq!(bucket.reserve(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn set_rate_changes_pacing() {
        let bucket = TokenBucket::new(1.0, 1);
        bucket.reserve();
        bucket.set_rate(100.0);
        assert_eq!(bucket.rate(), 100.0);
        assert!(bucket.reserve() <= Duration::from_millis(10));
    }
}
