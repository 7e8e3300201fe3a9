//! Primitives for observing work across the isolation boundary.
//!
//! - [`task`]: a future produced on one side and awaited on the other, settling exactly once.
//! - [`cancel`]: a cancellation request raised by the caller and delivered at most once inside the context.
//! - [`fault`]: the serializable error carried by a faulted settlement.
//!
//! Neither side ever ships its native primitive. Each crossing allocates a fresh sink/producer pair: the
//! producer registers the consumer's sink as its continuation target and settles it.

pub mod cancel;
pub mod fault;
pub mod task;

pub use cancel::{CancelRegistration, CancelRelay, CancelSink, RemoteCancellationToken};
pub use fault::{FaultKind, RemoteFault};
pub use task::{AlreadySettled, CompletionSink, CompletionSource, RemoteFuture, RemoteTask, RemoteTaskError, Settlement};
