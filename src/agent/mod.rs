//! The isolated side of a context.
//!
//! [`serve`] speaks the wire protocol over any reader/writer pair: the `testhost-agent` binary runs it over
//! stdin/stdout, the in-process launcher over a duplex pipe. A context handles one `setup`, then any number of
//! `discover`/`run` operations one at a time, until `shutdown` or end of input.
//!
//! ## Modules
//!
//! - `loader` - assembly inspection, load by identity and shadow copy
//! - `injector` - resolves misses from the host's dependency table
//! - `contract` - late-bound framework contract and its registry
//! - `command_line` - the built-in contract that drives a target as a process
//! - `symbols` - navigation data for discovered tests
//! - `executor` - the discover/run sequence

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod command_line;
pub mod contract;
pub mod executor;
pub mod injector;
pub mod loader;
pub mod symbols;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use testhost_core::{
    AgentMessage, AlreadySettled, CancelRelay, CompletionSink, ContextSetup, FaultKind, HostMessage, MessageReader,
    MessageWriter, PROTOCOL_VERSION, RemoteFault, RemoteTask, Settlement, SinkTrampoline, WireError,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub use contract::{ContextEnvironment, ContractError, ContractRegistry, Invocation, LateBoundObject};
pub use executor::{ExecutorError, RemoteExecutor};
pub use injector::AssemblyInjector;
pub use loader::{AssemblyLoader, LoadError, LoadedAssembly, ResolveHook, ShadowCopy};
pub use symbols::{NavigationData, SymbolReader};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("host speaks protocol {found}, agent speaks {expected}")]
    UnsupportedProtocol { expected: u32, found: u32 },

    #[error("could not prepare shadow-copy cache: {0}")]
    ShadowCopy(#[source] std::io::Error),

    #[error("channel writer stopped: {0}")]
    Writer(#[from] tokio::task::JoinError),
}

// ============================================================================
// Outbound adapters
// ============================================================================

/// Trampoline that forwards every callback over the channel.
struct WireTrampoline {
    outbound: mpsc::UnboundedSender<AgentMessage>,
}

impl WireTrampoline {
    fn send(&self, message: AgentMessage) {
        if self.outbound.send(message).is_err() {
            tracing::debug!("channel closed; dropping progress");
        }
    }
}

impl SinkTrampoline for WireTrampoline {
    fn begin(&self, message: &str) {
        self.send(AgentMessage::Begin {
            message: message.to_string(),
        });
    }

    fn progress(&self, args: Vec<Value>) {
        self.send(AgentMessage::Progress { args });
    }

    fn finished(&self, message: &str) {
        self.send(AgentMessage::Finished {
            message: message.to_string(),
        });
    }
}

/// Completion sink that writes the terminal message and then `drained`.
///
/// Progress is queued on the same channel before the operation settles, so `drained` always follows the last
/// callback of the operation.
struct WireCompletionSink {
    outbound: mpsc::UnboundedSender<AgentMessage>,
    settled: AtomicBool,
}

impl WireCompletionSink {
    fn new(outbound: mpsc::UnboundedSender<AgentMessage>) -> Self {
        Self {
            outbound,
            settled: AtomicBool::new(false),
        }
    }

    fn complete(&self, terminal: AgentMessage) -> Result<(), AlreadySettled> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(AlreadySettled);
        }
        for message in [terminal, AgentMessage::Drained] {
            if self.outbound.send(message).is_err() {
                tracing::debug!("channel closed; dropping settlement");
                break;
            }
        }
        Ok(())
    }
}

impl CompletionSink<()> for WireCompletionSink {
    fn set_result(&self, _value: ()) -> Result<(), AlreadySettled> {
        self.complete(AgentMessage::Completed)
    }

    fn set_fault(&self, fault: RemoteFault) -> Result<(), AlreadySettled> {
        self.complete(AgentMessage::Faulted { fault })
    }

    fn set_canceled(&self) -> Result<(), AlreadySettled> {
        self.complete(AgentMessage::Canceled)
    }
}

// ============================================================================
// Context
// ============================================================================

struct InFlight {
    relay: Arc<CancelRelay>,
    handle: JoinHandle<()>,
}

impl InFlight {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

enum Operation {
    Discover { target: PathBuf },
    Run { target: PathBuf, names: Vec<String> },
}

fn build_executor(setup: &ContextSetup, registry: Arc<ContractRegistry>) -> Result<RemoteExecutor, AgentError> {
    let injector = AssemblyInjector::new(setup.dependencies.clone());
    let mut loader = AssemblyLoader::new(&setup.application_base).with_resolve_hook(Arc::new(injector));
    if setup.shadow_copy {
        let shadow =
            ShadowCopy::new(&setup.context_name, &setup.shadow_copy_directories).map_err(AgentError::ShadowCopy)?;
        tracing::debug!(cache = %shadow.cache_dir().display(), "shadow copy enabled");
        loader = loader.with_shadow_copy(shadow);
    }
    let environment = ContextEnvironment {
        application_base: setup.application_base.clone(),
        configuration_file: setup.configuration_file.clone(),
    };
    Ok(RemoteExecutor::new(
        Arc::new(loader),
        registry,
        environment,
        setup.framework_name.clone(),
    ))
}

fn start(
    executor: &Arc<RemoteExecutor>,
    operation: Operation,
    outbound: &mpsc::UnboundedSender<AgentMessage>,
) -> InFlight {
    let relay = Arc::new(CancelRelay::new(CancellationToken::new()));
    let trampoline = WireTrampoline {
        outbound: outbound.clone(),
    };
    let executor = executor.clone();
    let cancel = relay.token();

    let task = RemoteTask::spawn(async move {
        let result = match operation {
            Operation::Discover { target } => executor.discover(&target, &trampoline, cancel).await,
            Operation::Run { target, names } => executor.run(&target, &names, &trampoline, cancel).await,
        };
        match result {
            Ok(()) => Settlement::Value(()),
            Err(ExecutorError::Canceled) => {
                tracing::info!("operation canceled");
                Settlement::Canceled
            }
            Err(error) => {
                tracing::error!(%error, "operation faulted");
                error.into_settlement()
            }
        }
    }
    .in_current_span());
    let handle = task.register_sink(Arc::new(WireCompletionSink::new(outbound.clone())));
    InFlight { relay, handle }
}

/// Serve one context until `shutdown` or end of input.
pub async fn serve<R, W>(reader: R, writer: W, registry: Arc<ContractRegistry>) -> Result<(), AgentError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut inbound = MessageReader::new(reader);
    let (outbound, mut queue) = mpsc::unbounded_channel::<AgentMessage>();
    let writer_task: JoinHandle<Result<(), WireError>> = tokio::spawn(async move {
        let mut writer = MessageWriter::new(writer);
        while let Some(message) = queue.recv().await {
            writer.send(&message).await?;
        }
        writer.shutdown().await
    });

    let result = serve_context(&mut inbound, &outbound, registry).await;
    drop(outbound);
    let written = writer_task.await?;
    result?;
    written?;
    Ok(())
}

async fn serve_context<R: AsyncRead + Unpin>(
    inbound: &mut MessageReader<R>,
    outbound: &mpsc::UnboundedSender<AgentMessage>,
    registry: Arc<ContractRegistry>,
) -> Result<(), AgentError> {
    let setup = match inbound.next::<HostMessage>().await? {
        Some(HostMessage::Setup(setup)) => setup,
        Some(other) => return Err(AgentError::Protocol(format!("expected setup, got {other:?}"))),
        None => return Ok(()),
    };
    if setup.protocol_version != PROTOCOL_VERSION {
        let error = AgentError::UnsupportedProtocol {
            expected: PROTOCOL_VERSION,
            found: setup.protocol_version,
        };
        let fault = RemoteFault::from_error(FaultKind::Protocol, &error);
        let _ = outbound.send(AgentMessage::Faulted { fault });
        return Err(error);
    }

    let span = tracing::info_span!("context", name = %setup.context_name);
    run_context(inbound, outbound, setup, registry).instrument(span).await
}

async fn run_context<R: AsyncRead + Unpin>(
    inbound: &mut MessageReader<R>,
    outbound: &mpsc::UnboundedSender<AgentMessage>,
    setup: ContextSetup,
    registry: Arc<ContractRegistry>,
) -> Result<(), AgentError> {
    let executor = Arc::new(build_executor(&setup, registry)?);
    tracing::info!(
        base = %setup.application_base.display(),
        dependencies = setup.dependencies.len(),
        shadow_copy = setup.shadow_copy,
        "context ready"
    );
    let _ = outbound.send(AgentMessage::Ready {
        context: setup.context_name.clone(),
        pid: std::process::id(),
    });

    let mut current: Option<InFlight> = None;
    loop {
        let message = inbound.next::<HostMessage>().await?;
        let operation = match message {
            Some(HostMessage::Discover { target }) => Operation::Discover { target },
            Some(HostMessage::Run { target, names }) => Operation::Run { target, names },
            Some(HostMessage::Cancel) => {
                match &current {
                    Some(op) if op.relay.deliver() => tracing::info!("cancel delivered"),
                    Some(_) => tracing::debug!("cancel already delivered"),
                    None => tracing::debug!("cancel with nothing in flight"),
                }
                continue;
            }
            Some(HostMessage::Setup(_)) => {
                tracing::warn!("ignoring repeated setup");
                continue;
            }
            Some(HostMessage::Shutdown) | None => break,
        };

        if current.as_ref().is_some_and(InFlight::is_running) {
            tracing::warn!("operation already in flight; request ignored");
            continue;
        }
        current = Some(start(&executor, operation, outbound));
    }

    // Leaving with work in flight: stop it and let it settle before the channel closes.
    if let Some(op) = current.take() {
        if op.is_running() {
            op.relay.deliver();
        }
        if let Err(error) = op.handle.await {
            tracing::warn!(%error, "operation task did not finish cleanly");
        }
    }
    tracing::info!("context shutting down");
    Ok(())
}
