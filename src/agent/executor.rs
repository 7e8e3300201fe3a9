//! Discovery and execution inside an isolated context.
//!
//! Both operations share one sequence:
//!
//! 1. inspect the target by path (manifest only) to learn its full identity
//! 2. load the target by that identity
//! 3. `begin`
//! 4. find the target's reference to the framework by short name; without one there is nothing to do
//! 5. load the framework by identity, instantiate the contract type, invoke it and project every payload
//!    into a boundary-safe record pushed through the trampoline
//! 6. `finished`
//!
//! Any failure before step 6 is returned; nothing is swallowed here.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use testhost_core::{
    DiscoveredTestRecord, FaultKind, RemoteException, RemoteFault, Settlement, SinkTrampoline, TestOutcomeRecord,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::contract::{
    COLLECT_MEMBER, COLLECTOR_TYPE, ContextEnvironment, ContractError, ContractRegistry, Invocation, LateBoundObject,
    RUN_MEMBER, RUNNER_TYPE,
};
use super::loader::{AssemblyLoader, LoadError, LoadedAssembly};
use super::symbols::SymbolReader;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Contract(ContractError),

    #[error("operation was canceled")]
    Canceled,
}

impl From<ContractError> for ExecutorError {
    fn from(error: ContractError) -> Self {
        match error {
            ContractError::Canceled => ExecutorError::Canceled,
            other => ExecutorError::Contract(other),
        }
    }
}

impl ExecutorError {
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            ExecutorError::Load(_) => FaultKind::Load,
            ExecutorError::Contract(ContractError::TypeNotFound { .. } | ContractError::MemberNotFound { .. }) => {
                FaultKind::Load
            }
            ExecutorError::Contract(ContractError::Payload { .. }) => FaultKind::Contract,
            ExecutorError::Contract(_) => FaultKind::Execution,
            ExecutorError::Canceled => FaultKind::Execution,
        }
    }

    /// Terminal state this error settles an operation with.
    pub fn into_settlement<T>(self) -> Settlement<T> {
        match self {
            ExecutorError::Canceled => Settlement::Canceled,
            error => Settlement::Fault(RemoteFault::from_error(error.fault_kind(), &error)),
        }
    }
}

// ============================================================================
// Framework payloads
// ============================================================================

#[derive(Debug, Deserialize)]
struct DeclaredMember {
    kind: String,
    #[serde(default)]
    declaring_type: Option<String>,
    name: String,
}

impl DeclaredMember {
    /// `(declaring type, member name)` for methods; the member name twice otherwise.
    fn names(&self) -> (String, String) {
        match self.method() {
            Some((declaring_type, method)) => (declaring_type.to_string(), method.to_string()),
            None => (self.name.clone(), self.name.clone()),
        }
    }

    fn method(&self) -> Option<(&str, &str)> {
        if !self.kind.eq_ignore_ascii_case("method") {
            return None;
        }
        self.declaring_type.as_deref().map(|t| (t, self.name.as_str()))
    }
}

#[derive(Debug, Deserialize)]
struct CollectedTest {
    full_name: String,
    declared_member: DeclaredMember,
}

#[derive(Debug, Deserialize)]
struct FinishedTest {
    full_name: String,
    declared_member: DeclaredMember,
    #[serde(default)]
    exceptions: Vec<RemoteException>,
    #[serde(default)]
    duration_ticks: i64,
}

fn decode_payload<T: for<'de> Deserialize<'de>>(member: &str, payload: Value) -> Result<T, ContractError> {
    serde_json::from_value(payload).map_err(|e| ContractError::Payload {
        member: member.to_string(),
        reason: e.to_string(),
    })
}

/// Project a collected test, attaching navigation data for methods when symbols know it.
fn project_discovered(payload: Value, symbols: &SymbolReader) -> Result<DiscoveredTestRecord, ContractError> {
    let test: CollectedTest = decode_payload(COLLECT_MEMBER, payload)?;
    let navigation = test
        .declared_member
        .method()
        .and_then(|(declaring_type, method)| symbols.lookup(declaring_type, method));
    let (declaring_type, member_name) = test.declared_member.names();
    Ok(DiscoveredTestRecord {
        display_name: test.full_name.clone(),
        qualified_name: test.full_name,
        declaring_type,
        member_name,
        source_file: navigation.as_ref().map(|n| n.file.clone()),
        source_line: navigation.map(|n| n.min_line),
    })
}

fn project_outcome(payload: Value) -> Result<TestOutcomeRecord, ContractError> {
    let test: FinishedTest = decode_payload(RUN_MEMBER, payload)?;
    let (declaring_type, member_name) = test.declared_member.names();
    Ok(TestOutcomeRecord {
        qualified_name: test.full_name,
        declaring_type,
        member_name,
        exceptions: test.exceptions,
        duration_ticks: test.duration_ticks,
    })
}

// ============================================================================
// Executor
// ============================================================================

struct Prepared {
    assembly: Arc<LoadedAssembly>,
    instance: Box<dyn LateBoundObject>,
}

pub struct RemoteExecutor {
    loader: Arc<AssemblyLoader>,
    registry: Arc<ContractRegistry>,
    environment: ContextEnvironment,
    framework_name: String,
}

impl RemoteExecutor {
    pub fn new(
        loader: Arc<AssemblyLoader>,
        registry: Arc<ContractRegistry>,
        environment: ContextEnvironment,
        framework_name: impl Into<String>,
    ) -> Self {
        Self {
            loader,
            registry,
            environment,
            framework_name: framework_name.into(),
        }
    }

    #[tracing::instrument(skip_all, fields(target = %target.display()))]
    pub async fn discover(
        &self,
        target: &Path,
        trampoline: &dyn SinkTrampoline,
        cancel: CancellationToken,
    ) -> Result<(), ExecutorError> {
        let mut symbols = SymbolReader::load(target).await;
        if !symbols.is_open() {
            tracing::debug!("no navigation data for target");
        }

        if let Some(prepared) = self.prepare(target, COLLECTOR_TYPE, trampoline).await? {
            if cancel.is_cancelled() {
                return Err(ExecutorError::Canceled);
            }
            let mut discovered = 0usize;
            let mut callback = |payload: Value| -> Result<(), ContractError> {
                let record = project_discovered(payload, &symbols)?;
                discovered += 1;
                trampoline.progress(record.into_args());
                Ok(())
            };
            let call = Invocation {
                assembly: &prepared.assembly,
                names: &[],
                callback: &mut callback,
                cancel,
                environment: &self.environment,
            };
            prepared.instance.invoke(COLLECT_MEMBER, call).await?;
            tracing::info!(discovered, "discovery complete");
        }

        symbols.close();
        trampoline.finished(&target.display().to_string());
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(target = %target.display(), requested = names.len()))]
    pub async fn run(
        &self,
        target: &Path,
        names: &[String],
        trampoline: &dyn SinkTrampoline,
        cancel: CancellationToken,
    ) -> Result<(), ExecutorError> {
        if let Some(prepared) = self.prepare(target, RUNNER_TYPE, trampoline).await? {
            if cancel.is_cancelled() {
                return Err(ExecutorError::Canceled);
            }
            let mut finished = 0usize;
            let mut callback = |payload: Value| -> Result<(), ContractError> {
                let record = project_outcome(payload)?;
                finished += 1;
                trampoline.progress(record.into_args());
                Ok(())
            };
            let call = Invocation {
                assembly: &prepared.assembly,
                names,
                callback: &mut callback,
                cancel,
                environment: &self.environment,
            };
            prepared.instance.invoke(RUN_MEMBER, call).await?;
            tracing::info!(finished, "run complete");
        }

        trampoline.finished(&target.display().to_string());
        Ok(())
    }

    /// Steps 1 through 5 up to instantiation. `None` when the target does not reference the framework.
    async fn prepare(
        &self,
        target: &Path,
        type_name: &str,
        trampoline: &dyn SinkTrampoline,
    ) -> Result<Option<Prepared>, ExecutorError> {
        let manifest = self.loader.preload(target).await?;
        let assembly = self.loader.load(&manifest.identity).await?;

        trampoline.begin(&target.display().to_string());

        let Some(reference) = assembly.manifest.find_reference(&self.framework_name) else {
            tracing::info!(framework = %self.framework_name, "target does not reference the framework; nothing to do");
            return Ok(None);
        };
        let framework = self.loader.load(reference).await?;
        let instance = self.registry.instantiate(&framework, type_name)?;
        tracing::debug!(framework = %framework.identity(), type_name, "contract bound");
        Ok(Some(Prepared { assembly, instance }))
    }
}
