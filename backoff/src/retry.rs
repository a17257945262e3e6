use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Sleep, sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::{Condition, Operation};

/// Why a [`Retry`] gave up.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The cancellation token fired before the operation succeeded.
    Cancelled,
    /// The last attempt failed and either the condition or the strategy refused another one.
    Failed(E),
}

/// The operation is either running or we are cooling off before the next attempt.
/// ```no_rust
///  (Running) --Ok--> [Ok]
///      |
///     Err --> condition refuses / strategy exhausted --> [Failed]
///      |
///  (Sleeping) --elapsed--> (Running)
///
///  cancellation fired in any state --> [Cancelled]
/// ```
#[pin_project(project = RetryStateProj)]
enum RetryState<O>
where
    O: Operation,
{
    Running(#[pin] O::Future),
    Sleeping(#[pin] Sleep),
}

/// Retry an [`Operation`] with delays from a backoff strategy until it succeeds, the
/// [`Condition`] refuses, the strategy runs dry or the token is cancelled.
#[pin_project]
pub struct Retry<I, O, C>
where
    O: Operation,
{
    #[pin]
    state: RetryState<O>,
    #[pin]
    cancelled: WaitForCancellationFutureOwned,
    backoff: I,
    operation: O,
    condition: C,
    attempt: usize,
}

impl<I, O, C> Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<II: IntoIterator<IntoIter = I, Item = I::Item>>(
        backoff: II,
        mut operation: O,
        condition: C,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state: RetryState::Running(operation.run()),
            cancelled: cancel.cancelled_owned(),
            backoff: backoff.into_iter(),
            operation,
            condition,
            attempt: 0,
        }
    }
}

impl<I, O, C> Future for Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    type Output = Result<O::Item, RetryError<O::Error>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        loop {
            if this.cancelled.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(RetryError::Cancelled));
            }

            match this.state.as_mut().project() {
                RetryStateProj::Running(op) => match ready!(op.poll(cx)) {
                    Ok(item) => return Poll::Ready(Ok(item)),
                    Err(err) => {
                        *this.attempt += 1;
                        if !this.condition.can_retry(&err, *this.attempt) {
                            return Poll::Ready(Err(RetryError::Failed(err)));
                        }
                        let Some(delay) = this.backoff.next() else {
                            return Poll::Ready(Err(RetryError::Failed(err)));
                        };
                        this.state.set(RetryState::Sleeping(sleep(delay)));
                    }
                },
                RetryStateProj::Sleeping(pause) => {
                    ready!(pause.poll(cx));
                    let next = this.operation.run();
                    this.state.set(RetryState::Running(next));
                }
            }
        }
    }
}
