//! Boundary vocabulary shared by the testhost orchestrator and its isolated agents.
//!
//! Nothing in this crate spawns processes or touches target code. It defines what may cross an isolation
//! boundary and how:
//!
//! - [`identity`]: assembly identities, sidecar manifests and the immutable [`DependencyTable`]
//! - [`records`]: the fixed-arity progress records for discovered tests and test outcomes
//! - [`remote`]: settle-once futures and at-most-once cancellation across the boundary
//! - [`trampoline`]: the [`SinkTrampoline`] seam progress is pushed through
//! - [`wire`]: the NDJSON messages exchanged between host and agent

#![deny(clippy::unwrap_used)]

pub mod identity;
pub mod records;
pub mod remote;
pub mod trampoline;
pub mod wire;

pub use identity::{AssemblyDescriptor, AssemblyIdentity, AssemblyManifest, DependencyTable, IdentityError};
pub use records::{DiscoveredTestRecord, RecordError, RemoteException, TestOutcomeRecord};
pub use remote::{
    AlreadySettled, CancelRegistration, CancelRelay, CancelSink, CompletionSink, CompletionSource, FaultKind,
    RemoteCancellationToken, RemoteFault, RemoteFuture, RemoteTask, RemoteTaskError, Settlement,
};
pub use trampoline::SinkTrampoline;
pub use wire::{AgentMessage, ContextSetup, HostMessage, MessageReader, MessageWriter, PROTOCOL_VERSION, WireError};
