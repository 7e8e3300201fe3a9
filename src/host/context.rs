//! Isolated execution contexts, seen from the host.
//!
//! A [`ContextLauncher`] produces a connected [`IsolatedContext`]: a message channel plus whatever keeps the
//! other side alive. [`ProcessLauncher`] starts one `testhost-agent` child per context; [`InProcessLauncher`]
//! runs the agent loop on a task over an in-memory pipe. Either way the context is used for exactly one
//! operation and then torn down with [`IsolatedContext::teardown`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use testhost_core::{AgentMessage, ContextSetup, HostMessage, MessageReader, MessageWriter};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::HostError;
use crate::agent::{self, AgentError, ContractRegistry};
use crate::agent::contract::CONFIG_FILE_ENV;

/// Environment variable naming the context a child agent serves.
pub const CONTEXT_NAME_ENV: &str = "TESTHOST_CONTEXT";

/// Size of the in-memory pipe used by [`InProcessLauncher`].
const PIPE_CAPACITY: usize = 64 * 1024;

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// What keeps the agent side of a context running.
pub enum ContextHandle {
    Process(Child),
    Task(JoinHandle<Result<(), AgentError>>),
}

/// Where a context lives, fixed at creation.
#[derive(Debug, Clone)]
pub struct ContextSpec<'a> {
    pub name: &'a str,
    pub application_base: &'a Path,
    pub configuration_file: Option<&'a Path>,
}

#[async_trait]
pub trait ContextLauncher: Send + Sync {
    async fn launch(&self, spec: ContextSpec<'_>) -> Result<IsolatedContext, HostError>;
}

pub struct IsolatedContext {
    name: String,
    reader: MessageReader<BoxedReader>,
    writer: MessageWriter<BoxedWriter>,
    handle: ContextHandle,
}

impl IsolatedContext {
    pub fn new(name: impl Into<String>, reader: BoxedReader, writer: BoxedWriter, handle: ContextHandle) -> Self {
        Self {
            name: name.into(),
            reader: MessageReader::new(reader),
            writer: MessageWriter::new(writer),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn send(&mut self, message: &HostMessage) -> Result<(), HostError> {
        self.writer.send(message).await?;
        Ok(())
    }

    pub async fn next(&mut self) -> Result<Option<AgentMessage>, HostError> {
        Ok(self.reader.next().await?)
    }

    /// Send `setup` and wait for `ready`.
    pub async fn handshake(&mut self, setup: ContextSetup, timeout: Duration) -> Result<(), HostError> {
        self.send(&HostMessage::Setup(setup)).await?;
        let reply = tokio::time::timeout(timeout, self.next())
            .await
            .map_err(|_| HostError::StartupTimeout {
                context: self.name.clone(),
                timeout,
            })??;
        match reply {
            Some(AgentMessage::Ready { context, pid }) => {
                tracing::debug!(context = %context, pid, "context ready");
                Ok(())
            }
            Some(AgentMessage::Faulted { fault }) => Err(HostError::Remote(fault)),
            Some(other) => Err(HostError::Protocol(format!("expected ready, got {other:?}"))),
            None => Err(HostError::ContextLost {
                context: self.name.clone(),
            }),
        }
    }

    /// Ask the agent to stop, wait up to `timeout`, then force it.
    pub async fn teardown(self, timeout: Duration) {
        let Self {
            name,
            reader,
            mut writer,
            handle,
        } = self;
        if let Err(error) = writer.send(&HostMessage::Shutdown).await {
            tracing::debug!(context = %name, %error, "shutdown not delivered");
        }
        let _ = writer.shutdown().await;
        drop(writer);
        drop(reader);

        match handle {
            ContextHandle::Process(mut child) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(context = %name, %status, "context exited"),
                Ok(Err(error)) => tracing::warn!(context = %name, %error, "could not reap context"),
                Err(_) => {
                    tracing::warn!(context = %name, "context did not exit in time; killing");
                    if let Err(error) = child.kill().await {
                        tracing::warn!(context = %name, %error, "could not kill context");
                    }
                }
            },
            ContextHandle::Task(mut task) => match tokio::time::timeout(timeout, &mut task).await {
                Ok(Ok(Ok(()))) => tracing::debug!(context = %name, "context task finished"),
                Ok(Ok(Err(error))) => tracing::warn!(context = %name, %error, "context task failed"),
                Ok(Err(error)) => tracing::warn!(context = %name, %error, "context task panicked"),
                Err(_) => {
                    tracing::warn!(context = %name, "context task did not finish in time; aborting");
                    task.abort();
                }
            },
        }
    }
}

// ============================================================================
// Launchers
// ============================================================================

/// One `testhost-agent` child process per context.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    agent: PathBuf,
}

impl ProcessLauncher {
    pub fn new(agent: impl Into<PathBuf>) -> Self {
        Self { agent: agent.into() }
    }

    /// `testhost-agent` next to the running executable.
    pub fn default_agent_path() -> Option<PathBuf> {
        let dir = super::catalog::engine_directory()?;
        Some(dir.join(format!("testhost-agent{}", std::env::consts::EXE_SUFFIX)))
    }
}

#[async_trait]
impl ContextLauncher for ProcessLauncher {
    async fn launch(&self, spec: ContextSpec<'_>) -> Result<IsolatedContext, HostError> {
        let mut command = Command::new(&self.agent);
        command
            .current_dir(spec.application_base)
            .env(CONTEXT_NAME_ENV, spec.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(config) = spec.configuration_file {
            command.env(CONFIG_FILE_ENV, config);
        }

        let mut child = command.spawn().map_err(|source| HostError::Launch {
            agent: self.agent.clone(),
            source,
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(HostError::Protocol("agent pipes were not captured".to_string()));
        };
        tracing::debug!(context = spec.name, pid = child.id(), "context process started");
        Ok(IsolatedContext::new(
            spec.name,
            Box::new(stdout),
            Box::new(stdin),
            ContextHandle::Process(child),
        ))
    }
}

/// The agent loop on a task in this process, over an in-memory pipe.
#[derive(Debug, Clone)]
pub struct InProcessLauncher {
    registry: Arc<ContractRegistry>,
}

impl InProcessLauncher {
    pub fn new(registry: Arc<ContractRegistry>) -> Self {
        Self { registry }
    }
}

impl Default for InProcessLauncher {
    fn default() -> Self {
        Self::new(Arc::new(ContractRegistry::builtin()))
    }
}

#[async_trait]
impl ContextLauncher for InProcessLauncher {
    async fn launch(&self, spec: ContextSpec<'_>) -> Result<IsolatedContext, HostError> {
        let (host, agent_side) = tokio::io::duplex(PIPE_CAPACITY);
        let (agent_reader, agent_writer) = tokio::io::split(agent_side);
        let registry = self.registry.clone();
        let task = tokio::spawn(agent::serve(agent_reader, agent_writer, registry));

        let (host_reader, host_writer) = tokio::io::split(host);
        tracing::debug!(context = spec.name, "in-process context started");
        Ok(IsolatedContext::new(
            spec.name,
            Box::new(host_reader),
            Box::new(host_writer),
            ContextHandle::Task(task),
        ))
    }
}
