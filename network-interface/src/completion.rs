use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{NetworkError, Result};

/// The caller's side of a command or alarm promise.
///
/// Await it from async code, or call [`CompletionFuture::wait`] from a plain
/// thread. If the reactor goes away without resolving the promise the result is
/// `ShutdownInProgress`.
#[derive(Debug)]
pub struct CompletionFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> CompletionFuture<T> {
    pub(crate) fn channel() -> (CompletionPromise<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (CompletionPromise { tx }, Self { rx })
    }

    /// Blocks the current thread until the result is available.
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> Result<T> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(NetworkError::ShutdownInProgress))
    }

    /// Returns the result if it is already available.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(NetworkError::ShutdownInProgress)),
        }
    }
}

impl<T> Future for CompletionFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(NetworkError::ShutdownInProgress)))
    }
}

/// The producer side; fulfilled at most once.
#[derive(Debug)]
pub(crate) struct CompletionPromise<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> CompletionPromise<T> {
    pub(crate) fn fulfill(self, result: Result<T>) {
        // The caller may have dropped its future; nobody is left to tell.
        let _ = self.tx.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_with_fulfilled_value() {
        let (promise, future) = CompletionFuture::<u32>::channel();
        promise.fulfill(Ok(7));
        assert_eq!(future.await, Ok(7));
    }

    #[tokio::test]
    async fn dropped_promise_reads_as_shutdown() {
        let (promise, future) = CompletionFuture::<u32>::channel();
        drop(promise);
        assert_eq!(future.await, Err(NetworkError::ShutdownInProgress));
    }

    #[test]
    fn try_take_reports_pending() {
        let (promise, mut future) = CompletionFuture::<u32>::channel();
        assert!(future.try_take().is_none());
        promise.fulfill(Err(NetworkError::Cancelled));
        assert_eq!(future.try_take(), Some(Err(NetworkError::Cancelled)));
    }
}
