//! Cross-boundary futures.
//!
//! [`RemoteTask`] is the producer side: it owns the running work. [`CompletionSource`] is the consumer side: a
//! settle-once sink whose paired [`RemoteFuture`] is what the caller awaits. Registering a sink consumes the
//! task, so one producer has exactly one continuation target.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};

use super::fault::{FaultKind, RemoteFault};

/// Terminal state of a cross-boundary operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement<T> {
    Value(T),
    Fault(RemoteFault),
    Canceled,
}

impl<T> Settlement<T> {
    pub fn into_result(self) -> Result<T, RemoteTaskError> {
        match self {
            Settlement::Value(value) => Ok(value),
            Settlement::Fault(fault) => Err(RemoteTaskError::Faulted(fault)),
            Settlement::Canceled => Err(RemoteTaskError::Canceled),
        }
    }
}

/// Rejection of a second settlement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("completion already settled")]
pub struct AlreadySettled;

/// How a [`RemoteFuture`] ended when it did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteTaskError {
    #[error(transparent)]
    Faulted(#[from] RemoteFault),

    #[error("operation was canceled")]
    Canceled,

    /// The producer went away without settling.
    #[error("remote task was abandoned before it settled")]
    Abandoned,
}

/// Continuation target of a [`RemoteTask`].
pub trait CompletionSink<T>: Send + Sync + 'static {
    fn set_result(&self, value: T) -> Result<(), AlreadySettled>;
    fn set_fault(&self, fault: RemoteFault) -> Result<(), AlreadySettled>;
    fn set_canceled(&self) -> Result<(), AlreadySettled>;

    fn settle(&self, settlement: Settlement<T>) -> Result<(), AlreadySettled> {
        match settlement {
            Settlement::Value(value) => self.set_result(value),
            Settlement::Fault(fault) => self.set_fault(fault),
            Settlement::Canceled => self.set_canceled(),
        }
    }
}

// ============================================================================
// Producer side
// ============================================================================

/// Producer-side wrapper around work that will settle once.
pub struct RemoteTask<T> {
    handle: JoinHandle<Settlement<T>>,
}

impl<T: Send + 'static> RemoteTask<T> {
    /// Start `future` on the current runtime.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Settlement<T>> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    /// Attach the continuation that settles `sink` when the work ends.
    ///
    /// A panic in the producer settles the sink as a [`FaultKind::Panic`] fault.
    pub fn register_sink(self, sink: Arc<dyn CompletionSink<T>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let settlement = match self.handle.await {
                Ok(settlement) => settlement,
                Err(error) => settlement_from_join_error(error),
            };
            if sink.settle(settlement).is_err() {
                tracing::debug!("remote task sink was already settled; settlement dropped");
            }
        })
    }

    /// Allocate a local sink, register it, and hand back the awaitable side.
    pub fn as_future(self) -> RemoteFuture<T> {
        let (source, future) = CompletionSource::new();
        self.register_sink(Arc::new(source));
        future
    }
}

fn settlement_from_join_error<T>(error: JoinError) -> Settlement<T> {
    if error.is_cancelled() {
        return Settlement::Canceled;
    }
    let payload = error.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "remote task panicked".to_string());
    Settlement::Fault(RemoteFault::new(FaultKind::Panic, message))
}

// ============================================================================
// Consumer side
// ============================================================================

/// Settle-once completion sink backed by a oneshot channel.
pub struct CompletionSource<T> {
    sender: Mutex<Option<oneshot::Sender<Settlement<T>>>>,
}

impl<T> CompletionSource<T> {
    pub fn new() -> (Self, RemoteFuture<T>) {
        let (sender, receiver) = oneshot::channel();
        let source = Self {
            sender: Mutex::new(Some(sender)),
        };
        (source, RemoteFuture { receiver })
    }

    pub fn is_settled(&self) -> bool {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    fn complete(&self, settlement: Settlement<T>) -> Result<(), AlreadySettled> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(AlreadySettled)?;
        // A dropped receiver still counts as settled.
        let _ = sender.send(settlement);
        Ok(())
    }
}

impl<T: Send + 'static> CompletionSink<T> for CompletionSource<T> {
    fn set_result(&self, value: T) -> Result<(), AlreadySettled> {
        self.complete(Settlement::Value(value))
    }

    fn set_fault(&self, fault: RemoteFault) -> Result<(), AlreadySettled> {
        self.complete(Settlement::Fault(fault))
    }

    fn set_canceled(&self) -> Result<(), AlreadySettled> {
        self.complete(Settlement::Canceled)
    }
}

/// Consumer-visible future of a cross-boundary operation.
#[must_use = "a remote future does nothing unless awaited"]
pub struct RemoteFuture<T> {
    receiver: oneshot::Receiver<Settlement<T>>,
}

impl<T> Future for RemoteFuture<T> {
    type Output = Result<T, RemoteTaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(settlement)) => Poll::Ready(settlement.into_result()),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RemoteTaskError::Abandoned)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_value_crosses() {
        let task = RemoteTask::spawn(async { Settlement::Value(42) });
        assert_eq!(task.as_future().await, Ok(42));
    }

    #[tokio::test]
    async fn test_fault_crosses() {
        let task: RemoteTask<()> =
            RemoteTask::spawn(async { Settlement::Fault(RemoteFault::new(FaultKind::Load, "missing")) });
        let error = task.as_future().await.unwrap_err();
        assert!(matches!(error, RemoteTaskError::Faulted(f) if f.kind == FaultKind::Load));
    }

    #[tokio::test]
    async fn test_cancel_is_distinct_from_fault() {
        let task: RemoteTask<()> = RemoteTask::spawn(async { Settlement::Canceled });
        assert_eq!(task.as_future().await, Err(RemoteTaskError::Canceled));
    }

    async fn explode() -> Settlement<()> {
        panic!("kaboom")
    }

    #[tokio::test]
    async fn test_panic_becomes_fault() {
        let task = RemoteTask::spawn(explode());
        let error = task.as_future().await.unwrap_err();
        assert!(matches!(error, RemoteTaskError::Faulted(f) if f.kind == FaultKind::Panic && f.message == "kaboom"));
    }

    #[tokio::test]
    async fn test_second_settlement_is_rejected() {
        let (source, future) = CompletionSource::<u8>::new();
        assert!(source.set_result(1).is_ok());
        assert_eq!(source.set_result(2), Err(AlreadySettled));
        assert_eq!(source.set_canceled(), Err(AlreadySettled));
        assert!(source.is_settled());
        assert_eq!(future.await, Ok(1));
    }

    #[tokio::test]
    async fn test_dropped_source_abandons_future() {
        let (source, future) = CompletionSource::<()>::new();
        drop(source);
        assert_eq!(future.await, Err(RemoteTaskError::Abandoned));
    }

    #[tokio::test]
    async fn test_registered_sink_observes_producer() {
        let (source, future) = CompletionSource::new();
        let source = Arc::new(source);
        let task = RemoteTask::spawn(async { Settlement::Value("done") });
        task.register_sink(source.clone()).await.unwrap();
        assert!(source.is_settled());
        assert_eq!(future.await, Ok("done"));
    }

    proptest! {
        /// Whatever sequence of settlement attempts arrives, only the first one is observed.
        #[test]
        fn only_first_settlement_wins(attempts in proptest::collection::vec(0u8..3, 1..8)) {
            let (source, mut future) = CompletionSource::<u8>::new();
            let mut accepted = 0;
            for (i, attempt) in attempts.iter().enumerate() {
                let result = match attempt {
                    0 => source.set_result(i as u8),
                    1 => source.set_fault(RemoteFault::new(FaultKind::Execution, "x")),
                    _ => source.set_canceled(),
                };
                if result.is_ok() {
                    accepted += 1;
                }
            }
            prop_assert_eq!(accepted, 1);

            let observed = future.receiver.try_recv().unwrap();
            let expected = match attempts[0] {
                0 => Settlement::Value(0),
                1 => Settlement::Fault(RemoteFault::new(FaultKind::Execution, "x")),
                _ => Settlement::Canceled,
            };
            prop_assert_eq!(observed, expected);
        }
    }
}
