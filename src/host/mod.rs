//! The caller side: one disposable isolated context per target per operation.
//!
//! [`Orchestrator::discover`] and [`Orchestrator::run`] each:
//!
//! 1. check the target and derive its application base (the target's directory)
//! 2. snapshot the assembly catalog into a dependency table for the new context
//! 3. launch a uniquely named context with shadow copy over the base and the engine directory, attaching
//!    `<target>.config` when it exists
//! 4. send the request and replay the agent's callbacks through a trampoline onto the caller's sink
//! 5. settle on the terminal message, wait for `drained` (bounded by the grace interval)
//! 6. tear the context down, whatever the outcome
//!
//! ## Modules
//!
//! - `context` - launchers and the context handle
//! - `trampoline` - record re-hydration onto caller sinks
//! - `sink` - caller-side result types
//! - `catalog` - assemblies offered to contexts

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod catalog;
pub mod context;
pub mod sink;
pub mod trampoline;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use testhost_core::{
    AgentMessage, CompletionSink, CompletionSource, ContextSetup, HostMessage, PROTOCOL_VERSION,
    RemoteCancellationToken, RemoteFault, RemoteTaskError, SinkTrampoline, WireError,
};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{HostConfig, Isolation};

pub use catalog::AssemblyCatalog;
pub use context::{ContextLauncher, ContextSpec, InProcessLauncher, IsolatedContext, ProcessLauncher};
pub use sink::{DiscoverySink, EXECUTOR_URI, RunSink, TestCase, TestOutcome, TestResult, TestSink};
pub use trampoline::{DiscoverTrampoline, RunTrampoline};

/// Suffix of the configuration file attached to a target's context.
pub const CONFIG_SUFFIX: &str = ".config";

#[derive(Debug, Error)]
pub enum HostError {
    #[error("invalid target '{}': {reason}", path.display())]
    InvalidTarget { path: PathBuf, reason: &'static str },

    #[error("could not start agent '{}': {source}", agent.display())]
    Launch {
        agent: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("context '{context}' did not become ready within {timeout:?}")]
    StartupTimeout { context: String, timeout: Duration },

    #[error("context '{context}' went away before the operation settled")]
    ContextLost { context: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Remote(RemoteFault),

    #[error("no agent executable configured and none found next to the host")]
    AgentNotFound,
}

/// How an operation ended when it did not fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Completed,
    Canceled,
}

/// Per-target outcome of a multi-target call.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub completed: Vec<PathBuf>,
    pub canceled: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, HostError)>,
}

impl BatchReport {
    fn record(&mut self, target: PathBuf, result: Result<Completion, HostError>) {
        match result {
            Ok(Completion::Completed) => self.completed.push(target),
            Ok(Completion::Canceled) => self.canceled.push(target),
            Err(error) => {
                tracing::error!(assembly = %target.display(), %error, "target failed");
                self.failed.push((target, error));
            }
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

enum Request {
    Discover,
    Run { names: Vec<String> },
}

pub struct Orchestrator {
    config: HostConfig,
    launcher: Arc<dyn ContextLauncher>,
    catalog: AssemblyCatalog,
    engine_dir: Option<PathBuf>,
    sequence: AtomicU64,
}

impl Orchestrator {
    pub fn new(config: HostConfig, launcher: Arc<dyn ContextLauncher>, catalog: AssemblyCatalog) -> Self {
        Self {
            config,
            launcher,
            catalog,
            engine_dir: catalog::engine_directory(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Launcher and catalog as `config` describes them.
    pub fn from_config(config: HostConfig) -> Result<Self, HostError> {
        let launcher: Arc<dyn ContextLauncher> = match config.isolation {
            Isolation::InProcess => Arc::new(InProcessLauncher::default()),
            Isolation::Process => {
                let agent = match &config.agent_path {
                    Some(path) => path.clone(),
                    None => ProcessLauncher::default_agent_path().ok_or(HostError::AgentNotFound)?,
                };
                Arc::new(ProcessLauncher::new(agent))
            }
        };
        let catalog = AssemblyCatalog::discover(&config.supporting_dirs);
        Ok(Self::new(config, launcher, catalog))
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    fn next_context_name(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("testhost-{}-{seq}", std::process::id())
    }

    /// Discover the tests in one target.
    #[tracing::instrument(skip_all, fields(target = %target.display()))]
    pub async fn discover(&self, target: &Path, sink: Arc<dyn DiscoverySink>) -> Result<Completion, HostError> {
        let target = checked_target(target)?;
        let trampoline = DiscoverTrampoline::new(&target, sink);
        self.execute(&target, Request::Discover, &trampoline, CancellationToken::new())
            .await
    }

    /// Run `cases` from one target. An empty list runs every test in it.
    #[tracing::instrument(skip_all, fields(target = %target.display(), cases = cases.len()))]
    pub async fn run(
        &self,
        target: &Path,
        cases: Vec<TestCase>,
        sink: Arc<dyn RunSink>,
        cancel: CancellationToken,
    ) -> Result<Completion, HostError> {
        let target = checked_target(target)?;
        let names = cases.iter().map(|c| c.fully_qualified_name.clone()).collect();
        let trampoline = RunTrampoline::new(&target, sink, cases);
        self.execute(&target, Request::Run { names }, &trampoline, cancel).await
    }

    /// Discover every target, one context each. A failing target never affects the others.
    pub async fn discover_all(self: &Arc<Self>, targets: Vec<PathBuf>, sink: Arc<dyn DiscoverySink>) -> BatchReport {
        let mut set = JoinSet::new();
        for target in targets {
            let this = self.clone();
            let sink = sink.clone();
            set.spawn(async move {
                let result = this.discover(&target, sink).await;
                (target, result)
            });
        }
        collect(set).await
    }

    /// Run every test in every target.
    pub async fn run_all(
        self: &Arc<Self>,
        targets: Vec<PathBuf>,
        sink: Arc<dyn RunSink>,
        cancel: CancellationToken,
    ) -> BatchReport {
        let groups = targets.into_iter().map(|t| (t, Vec::new())).collect();
        self.run_groups(groups, sink, cancel).await
    }

    /// Run `cases`, grouped by the assembly each belongs to.
    pub async fn run_cases(
        self: &Arc<Self>,
        cases: Vec<TestCase>,
        sink: Arc<dyn RunSink>,
        cancel: CancellationToken,
    ) -> BatchReport {
        let mut groups: BTreeMap<PathBuf, Vec<TestCase>> = BTreeMap::new();
        for case in cases {
            groups.entry(case.source.clone()).or_default().push(case);
        }
        self.run_groups(groups.into_iter().collect(), sink, cancel).await
    }

    async fn run_groups(
        self: &Arc<Self>,
        groups: Vec<(PathBuf, Vec<TestCase>)>,
        sink: Arc<dyn RunSink>,
        cancel: CancellationToken,
    ) -> BatchReport {
        let mut set = JoinSet::new();
        for (target, cases) in groups {
            let this = self.clone();
            let sink = sink.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let result = this.run(&target, cases, sink, cancel).await;
                (target, result)
            });
        }
        collect(set).await
    }

    async fn execute(
        &self,
        target: &Path,
        request: Request,
        trampoline: &dyn SinkTrampoline,
        cancel: CancellationToken,
    ) -> Result<Completion, HostError> {
        let application_base = target
            .parent()
            .map(Path::to_path_buf)
            .ok_or(HostError::InvalidTarget {
                path: target.to_path_buf(),
                reason: "has no parent directory",
            })?;
        let configuration_file = sibling_config(target);
        let name = self.next_context_name();

        let mut shadow_copy_directories = vec![application_base.clone()];
        shadow_copy_directories.extend(self.engine_dir.iter().cloned());
        let setup = ContextSetup {
            context_name: name.clone(),
            application_base: application_base.clone(),
            configuration_file: configuration_file.clone(),
            shadow_copy: self.config.shadow_copy,
            shadow_copy_directories,
            dependencies: self.catalog.snapshot(),
            framework_name: self.config.framework_name.clone(),
            protocol_version: PROTOCOL_VERSION,
        };

        let spec = ContextSpec {
            name: &name,
            application_base: &application_base,
            configuration_file: configuration_file.as_deref(),
        };
        let mut context = self.launcher.launch(spec).await?;
        tracing::debug!(context = %name, "context launched");

        let message = match request {
            Request::Discover => HostMessage::Discover {
                target: target.to_path_buf(),
            },
            Request::Run { names } => HostMessage::Run {
                target: target.to_path_buf(),
                names,
            },
        };
        let result = self.drive(&mut context, setup, message, trampoline, cancel).await;

        context.teardown(self.config.shutdown_timeout()).await;
        tracing::debug!(context = %name, "context torn down");
        result
    }

    /// Everything between launch and teardown.
    async fn drive(
        &self,
        context: &mut IsolatedContext,
        setup: ContextSetup,
        request: HostMessage,
        trampoline: &dyn SinkTrampoline,
        cancel: CancellationToken,
    ) -> Result<Completion, HostError> {
        context.handshake(setup, self.config.startup_timeout()).await?;

        let remote = RemoteCancellationToken::new(cancel);
        if remote.is_cancelled() {
            tracing::info!("canceled before the request was sent");
            return Ok(Completion::Canceled);
        }
        let (cancel, _registration) = remote.as_token();
        let (source, future) = CompletionSource::<()>::new();
        context.send(&request).await?;

        let mut cancel_sent = false;
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled(), if !cancel_sent => {
                    cancel_sent = true;
                    tracing::info!("forwarding cancel to context");
                    context.send(&HostMessage::Cancel).await?;
                    continue;
                }
                message = context.next() => message?,
            };
            let Some(message) = message else { break };

            match message {
                AgentMessage::Begin { message } => trampoline.begin(&message),
                AgentMessage::Progress { args } => trampoline.progress(args),
                AgentMessage::Finished { message } => trampoline.finished(&message),
                AgentMessage::Completed => settle(source.set_result(())),
                AgentMessage::Faulted { fault } => settle(source.set_fault(fault)),
                AgentMessage::Canceled => settle(source.set_canceled()),
                AgentMessage::Drained => {
                    tracing::warn!("drained before the operation settled");
                }
                AgentMessage::Ready { .. } => tracing::warn!("unexpected ready"),
            }
            if source.is_settled() {
                self.await_drained(context).await;
                break;
            }
        }
        drop(source);

        match future.await {
            Ok(()) => Ok(Completion::Completed),
            Err(RemoteTaskError::Canceled) => Ok(Completion::Canceled),
            Err(RemoteTaskError::Faulted(fault)) => Err(HostError::Remote(fault)),
            Err(RemoteTaskError::Abandoned) => Err(HostError::ContextLost {
                context: context.name().to_string(),
            }),
        }
    }

    /// Wait for the agent to confirm no further callbacks are coming, bounded by the grace interval.
    async fn await_drained(&self, context: &mut IsolatedContext) {
        let grace = self.config.grace_interval();
        let drained = tokio::time::timeout(grace, async {
            loop {
                match context.next().await {
                    Ok(Some(AgentMessage::Drained)) => return true,
                    Ok(Some(other)) => tracing::warn!(?other, "message after settlement ignored"),
                    Ok(None) | Err(_) => return false,
                }
            }
        })
        .await;
        if !matches!(drained, Ok(true)) {
            tracing::debug!(?grace, "no drained acknowledgment; tearing down anyway");
        }
    }
}

fn settle(result: Result<(), testhost_core::AlreadySettled>) {
    if result.is_err() {
        tracing::warn!("second terminal message ignored");
    }
}

async fn collect(mut set: JoinSet<(PathBuf, Result<Completion, HostError>)>) -> BatchReport {
    let mut report = BatchReport::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((target, result)) => report.record(target, result),
            Err(error) => tracing::error!(%error, "target task panicked"),
        }
    }
    report
}

/// Absolute path of an existing target file.
fn checked_target(target: &Path) -> Result<PathBuf, HostError> {
    if target.as_os_str().is_empty() {
        return Err(HostError::InvalidTarget {
            path: target.to_path_buf(),
            reason: "path is empty",
        });
    }
    if !target.is_file() {
        return Err(HostError::InvalidTarget {
            path: target.to_path_buf(),
            reason: "not an existing file",
        });
    }
    std::path::absolute(target).map_err(|_| HostError::InvalidTarget {
        path: target.to_path_buf(),
        reason: "cannot be made absolute",
    })
}

/// `<target>.config`, when it exists.
pub fn sibling_config(target: &Path) -> Option<PathBuf> {
    let mut file_name = target.file_name()?.to_os_string();
    file_name.push(CONFIG_SUFFIX);
    let config = target.with_file_name(file_name);
    config.is_file().then_some(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_empty_target_is_rejected() {
        let err = checked_target(Path::new("")).unwrap_err();
        assert!(matches!(err, HostError::InvalidTarget { reason: "path is empty", .. }));
    }

    #[test]
    fn test_missing_target_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = checked_target(&dir.path().join("A.dll")).unwrap_err();
        assert!(matches!(err, HostError::InvalidTarget { reason: "not an existing file", .. }));
        let err = checked_target(dir.path()).unwrap_err();
        assert!(matches!(err, HostError::InvalidTarget { .. }));
    }

    #[test]
    fn test_sibling_config_is_attached_only_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("A.dll");
        fs::write(&target, b"x").unwrap();
        assert_eq!(sibling_config(&target), None);

        fs::write(dir.path().join("A.dll.config"), b"<configuration/>").unwrap();
        assert_eq!(sibling_config(&target), Some(dir.path().join("A.dll.config")));
    }

    #[test]
    fn test_context_names_are_unique() {
        let orchestrator = Orchestrator::new(
            HostConfig::default(),
            Arc::new(InProcessLauncher::default()),
            AssemblyCatalog::new(),
        );
        let a = orchestrator.next_context_name();
        let b = orchestrator.next_context_name();
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("testhost-{}-", std::process::id())));
    }
}
