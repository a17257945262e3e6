//! Backoff and retry helpers shared by the coordination client.
//!
//! A remote call that fails is retried after a delay produced by a [`strategy`]. The delays are
//! plain iterators of [`Duration`](std::time::Duration), so they can be bounded with `take` or
//! consulted one step at a time from a hand-written loop (the watch engine does the latter).
//! [`retry::Retry`] drives an [`Operation`] to completion, consulting a [`Condition`] after each
//! failure and giving up early once the supplied cancellation token fires.
//!
//! ```rust
//! use backoff::retry::Retry;
//! use backoff::strategy::fixed;
//! use tokio_util::sync::CancellationToken;
//!
//! async fn lease_grant() -> Result<i64, ()> {
//!     Ok(7)
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let interval = fixed::Interval::from_millis(1).take(3);
//!     let cancel = CancellationToken::new();
//!     let result = Retry::new(interval, lease_grant, |_: &(), _| true, cancel).await;
//!     assert_eq!(result.ok(), Some(7));
//! }
//! ```

use std::future::Future;

/// Backoff strategies. Each one is an iterator yielding the next delay, `None` means give up.
pub mod strategy;

/// Cancellable retry driven by a strategy.
pub mod retry;

/// Decides whether a failed attempt should be retried.
///
/// `attempt` is the number of attempts that have already failed, starting at 1.
pub trait Condition<E> {
    fn can_retry(&self, error: &E, attempt: usize) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: Fn(&E, usize) -> bool,
{
    fn can_retry(&self, error: &E, attempt: usize) -> bool {
        self(error, attempt)
    }
}

/// Anything that produces a fresh future per attempt.
pub trait Operation {
    type Item;
    type Error;
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    #[must_use = "futures do nothing unless you `.await` or poll them"]
    fn run(&mut self) -> Self::Future;
}

impl<T, E, R, F> Operation for F
where
    R: Future<Output = Result<T, E>>,
    F: FnMut() -> R,
{
    type Item = T;
    type Error = E;
    type Future = R;

    fn run(&mut self) -> Self::Future {
        self()
    }
}
