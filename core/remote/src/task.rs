//! Cancellable handles for in-flight operations.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use couchsync_common::{Error, Result};

/// Handle to an operation running on the runtime.
///
/// Awaiting the task yields the operation's result. The operation keeps
/// running when the task is dropped; [`Task::cancel`] asks it to stop.
#[derive(Debug)]
pub struct Task<T> {
    receiver: oneshot::Receiver<Result<T>>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> Task<T> {
    /// Spawn `future` on the current runtime.
    ///
    /// `cancel` is the token the future watches; use [`cancellable`] inside
    /// the future to honor it.
    pub fn spawn<F>(cancel: CancellationToken, future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        tokio::spawn(async move {
            let _ = sender.send(future.await);
        });
        Self { receiver, cancel }
    }
}

impl<T> Task<T> {
    /// A task that is already resolved.
    pub fn ready(value: T) -> Self {
        Self::resolved(Ok(value))
    }

    /// A task that has already failed.
    pub fn failed(error: Error) -> Self {
        Self::resolved(Err(error))
    }

    fn resolved(result: Result<T>) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(result);
        Self {
            receiver,
            cancel: CancellationToken::new(),
        }
    }

    /// Request cancellation. Safe to call any number of times, and after
    /// the operation has completed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token observed by the operation.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::Aborted)))
    }
}

/// Run `future` unless `token` is cancelled first, in which case the result
/// is [`Error::Aborted`].
pub async fn cancellable<T, F>(token: &CancellationToken, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Aborted),
        result = future => result,
    }
}
