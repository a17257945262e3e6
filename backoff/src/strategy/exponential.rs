use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Default growth factor used by [`Exponential::bounded`].
const DEFAULT_FACTOR: f64 = 2.0;
/// Default jitter used by [`Exponential::bounded`].
const DEFAULT_JITTER: f64 = 0.2;

/// Exponentially growing delay, `min * factor^(attempt - 1)`, randomized by `jitter` and kept
/// within `[min, max]`.
///
/// ```
/// use backoff::strategy::exponential::Exponential;
/// use std::time::Duration;
///
/// let mut backoff = Exponential::new(
///     Duration::from_millis(50),
///     Duration::from_secs(60),
///     2.0,
///     0.0,
///     Some(3),
/// );
/// assert_eq!(backoff.next(), Some(Duration::from_millis(50)));
/// assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
/// assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
/// assert_eq!(backoff.next(), None);
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    min: Duration,
    max: Duration,
    factor: f64,
    /// Between 0.0 and 1.0.
    jitter: f64,
    /// `None` retries forever.
    max_attempts: Option<u16>,
    attempt: u16,
}

impl Exponential {
    pub fn new(
        min: Duration,
        max: Duration,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self {
            min,
            max,
            factor,
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts,
            attempt: 0,
        }
    }

    pub fn from_millis(
        min_ms: u32,
        max_ms: u32,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self::new(
            Duration::from_millis(min_ms as u64),
            Duration::from_millis(max_ms as u64),
            factor,
            jitter,
            max_attempts,
        )
    }

    /// Unlimited backoff doubling from `min` up to `max` with a little jitter.
    pub fn bounded(min: Duration, max: Duration) -> Self {
        Self::new(min, max, DEFAULT_FACTOR, DEFAULT_JITTER, None)
    }

    /// Called after a success so the next failure starts from `min` again.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn current_attempt(&self) -> u16 {
        self.attempt
    }

    /// Sleeps for the next delay. Returns `false` if the strategy is exhausted or the token was
    /// cancelled before the delay elapsed.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let Some(delay) = self.next() else {
            return false;
        };
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn delay_for(&self, attempt: u16) -> Duration {
        let exponent = i32::from(attempt.max(1) - 1);
        let mut delay_ms = (self.min.as_millis() as f64) * self.factor.powi(exponent);

        if self.jitter > 0.0 {
            delay_ms *= rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        }

        // powi overflows to inf for large attempts, min() below takes care of it
        let delay = if delay_ms.is_finite() {
            Duration::from_millis(delay_ms as u64)
        } else {
            self.max
        };
        delay.min(self.max).max(self.min.min(self.max))
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max_attempts) = self.max_attempts
            && self.attempt >= max_attempts
        {
            return None;
        }

        self.attempt = self.attempt.saturating_add(1);
        Some(self.delay_for(self.attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_without_jitter() {
        let mut backoff = Exponential::from_millis(50, 60_000, 2.0, 0.0, None);
        let delays: Vec<_> = (&mut backoff).take(4).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(50),
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
            ]
        );
    }

    #[test]
    fn capped_at_max() {
        let mut backoff = Exponential::from_millis(100, 300, 2.0, 0.0, None);
        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(300)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(300)));
    }

    #[test]
    fn never_overflows() {
        let mut backoff = Exponential::bounded(Duration::from_millis(50), Duration::from_secs(60));
        for _ in 0..5000 {
            let delay = backoff.next().unwrap();
            assert!(delay <= Duration::from_secs(60));
        }
        assert_eq!(backoff.current_attempt(), 5000);
    }

    #[test]
    fn jitter_never_goes_below_min() {
        let mut backoff = Exponential::from_millis(50, 1000, 2.0, 1.0, None);
        for _ in 0..100 {
            backoff.reset();
            let delay = backoff.next().unwrap();
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(100));
        }
    }

    #[test]
    fn max_attempts_and_reset() {
        let mut backoff = Exponential::from_millis(10, 1000, 2.0, 0.0, Some(2));
        assert!(backoff.next().is_some());
        assert!(backoff.next().is_some());
        assert_eq!(backoff.next(), None);
        assert_eq!(backoff.current_attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.current_attempt(), 0);
        assert_eq!(backoff.next(), Some(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn wait_returns_false_when_cancelled() {
        let mut backoff = Exponential::from_millis(60_000, 60_000, 2.0, 0.0, None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!backoff.wait(&cancel).await);
    }

    #[tokio::test]
    async fn wait_sleeps_for_delay() {
        let mut backoff = Exponential::from_millis(5, 10, 2.0, 0.0, Some(1));
        let cancel = CancellationToken::new();
        assert!(backoff.wait(&cancel).await);
        // exhausted
        assert!(!backoff.wait(&cancel).await);
    }
}
