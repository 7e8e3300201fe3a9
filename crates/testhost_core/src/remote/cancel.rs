//! Cross-boundary cancellation.
//!
//! A [`RemoteCancellationToken`] wraps the caller's token and forwards its signal to registered [`CancelSink`]s.
//! The receiving side owns a [`CancelRelay`], which turns a delivered signal into a local token that work can
//! observe. Delivery is idempotent: only the first signal cancels.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Receiver of a cancellation signal.
pub trait CancelSink: Send + Sync + 'static {
    fn cancel(&self);
}

/// Caller-side token that can be registered across the boundary.
#[derive(Debug, Clone, Default)]
pub struct RemoteCancellationToken {
    inner: CancellationToken,
}

impl RemoteCancellationToken {
    pub fn new(inner: CancellationToken) -> Self {
        Self { inner }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Forward the caller's signal to `sink`. Fires at once if the token is already canceled.
    ///
    /// Dropping the returned registration detaches the sink.
    pub fn register_sink(&self, sink: Arc<dyn CancelSink>) -> CancelRegistration {
        let token = self.inner.clone();
        let handle = tokio::spawn(async move {
            token.cancelled().await;
            sink.cancel();
        });
        CancelRegistration { handle }
    }

    /// Produce a fresh local token linked to this one.
    pub fn as_token(&self) -> (CancellationToken, CancelRegistration) {
        let local = CancellationToken::new();
        let relay = Arc::new(CancelRelay::new(local.clone()));
        let registration = self.register_sink(relay);
        (local, registration)
    }
}

/// Keeps a sink registered while alive.
#[derive(Debug)]
pub struct CancelRegistration {
    handle: JoinHandle<()>,
}

impl CancelRegistration {
    /// True once the signal has been forwarded (or the registration otherwise ended).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Receiving end: a local token that is canceled at most once.
#[derive(Debug)]
pub struct CancelRelay {
    source: CancellationToken,
    delivered: AtomicBool,
}

impl CancelRelay {
    pub fn new(source: CancellationToken) -> Self {
        Self {
            source,
            delivered: AtomicBool::new(false),
        }
    }

    /// Token observed by the work under this relay.
    pub fn token(&self) -> CancellationToken {
        self.source.clone()
    }

    /// Cancel the local token. Returns `true` only for the delivery that actually canceled it.
    pub fn deliver(&self) -> bool {
        if self.delivered.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.source.cancel();
        true
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered.load(Ordering::Acquire)
    }
}

impl CancelSink for CancelRelay {
    fn cancel(&self) {
        if !self.deliver() {
            tracing::trace!("cancellation already delivered");
        }
    }
}
