//! Late binding to the test framework's discovery and execution contract.
//!
//! The framework's version is only known once the target's references have been read, so the agent never links
//! against it. Contract types are found by name: the loaded framework must export the type, and a constructor
//! must be registered under that name in the [`ContractRegistry`]. Instances are driven through the single
//! dynamic entry point [`LateBoundObject::invoke`], with members addressed by name.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::command_line::CommandLineContract;
use super::loader::LoadedAssembly;

/// Discovery contract type.
pub const COLLECTOR_TYPE: &str = "Persimmon.Internals.TestCollector";
/// Execution contract type.
pub const RUNNER_TYPE: &str = "Persimmon.Internals.TestRunner";

/// `CollectAndCallback(assembly, callback)`.
pub const COLLECT_MEMBER: &str = "CollectAndCallback";
/// `RunTestsAndCallback(assembly, names, callback)`.
pub const RUN_MEMBER: &str = "RunTestsAndCallback";

/// Environment variable carrying the context's configuration file to target code.
pub const CONFIG_FILE_ENV: &str = "TESTHOST_CONFIG_FILE";

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("type '{type_name}' not found in '{assembly}'")]
    TypeNotFound { type_name: String, assembly: String },

    #[error("'{type_name}' has no member '{member}'")]
    MemberNotFound { type_name: String, member: String },

    #[error("'{member}' produced an unusable payload: {reason}")]
    Payload { member: String, reason: String },

    #[error("could not start '{}': {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("target I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("target exited with {status}{}", render_stderr(.stderr))]
    Exit { status: String, stderr: String },

    #[error("invocation was canceled")]
    Canceled,
}

fn render_stderr(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(":\n{stderr}")
    }
}

/// Context-wide settings target code observes.
#[derive(Debug, Clone, Default)]
pub struct ContextEnvironment {
    pub application_base: PathBuf,
    pub configuration_file: Option<PathBuf>,
}

/// Receives one framework payload per discovered test or finished result.
pub type ContractCallback<'a> = &'a mut (dyn FnMut(Value) -> Result<(), ContractError> + Send);

/// Arguments of a late-bound call.
pub struct Invocation<'a> {
    /// The test assembly being inspected or run.
    pub assembly: &'a LoadedAssembly,
    /// Qualified names to run. Empty means all. Ignored by discovery.
    pub names: &'a [String],
    pub callback: ContractCallback<'a>,
    pub cancel: CancellationToken,
    pub environment: &'a ContextEnvironment,
}

/// An instance of a late-bound contract type.
#[async_trait]
pub trait LateBoundObject: Send + Sync {
    fn type_name(&self) -> &str;

    async fn invoke(&self, member: &str, call: Invocation<'_>) -> Result<(), ContractError>;
}

/// Builds an instance given the loaded framework assembly.
pub type ContractConstructor =
    Arc<dyn Fn(&LoadedAssembly) -> Result<Box<dyn LateBoundObject>, ContractError> + Send + Sync>;

/// Contract constructors by type name.
#[derive(Clone, Default)]
pub struct ContractRegistry {
    constructors: HashMap<String, ContractConstructor>,
}

impl fmt::Debug for ContractRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.constructors.keys().collect();
        names.sort();
        f.debug_struct("ContractRegistry").field("types", &names).finish()
    }
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The command-line contract under both well-known type names.
    pub fn builtin() -> Self {
        Self::new()
            .with(COLLECTOR_TYPE, CommandLineContract::construct_collector)
            .with(RUNNER_TYPE, CommandLineContract::construct_runner)
    }

    pub fn with<F>(mut self, type_name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&LoadedAssembly) -> Result<Box<dyn LateBoundObject>, ContractError> + Send + Sync + 'static,
    {
        self.constructors.insert(type_name.into(), Arc::new(constructor));
        self
    }

    /// Locate `type_name` in `framework` and construct one instance.
    pub fn instantiate(
        &self,
        framework: &LoadedAssembly,
        type_name: &str,
    ) -> Result<Box<dyn LateBoundObject>, ContractError> {
        let constructor = self
            .constructors
            .get(type_name)
            .filter(|_| framework.manifest.exports_type(type_name))
            .ok_or_else(|| ContractError::TypeNotFound {
                type_name: type_name.to_string(),
                assembly: framework.full_name(),
            })?;
        constructor(framework)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use testhost_core::{AssemblyIdentity, AssemblyManifest};

    fn framework(exports: &[&str]) -> LoadedAssembly {
        LoadedAssembly {
            manifest: Arc::new(AssemblyManifest {
                identity: AssemblyIdentity::new("Persimmon", "1.1.0").unwrap(),
                references: Vec::new(),
                exports: exports.iter().map(|e| e.to_string()).collect(),
            }),
            location: PathBuf::from("/t/Persimmon.dll"),
            image: PathBuf::from("/t/Persimmon.dll"),
        }
    }

    #[test]
    fn test_builtin_instantiates_exported_types() {
        let registry = ContractRegistry::builtin();
        let framework = framework(&[COLLECTOR_TYPE, RUNNER_TYPE]);
        assert_eq!(registry.instantiate(&framework, COLLECTOR_TYPE).unwrap().type_name(), COLLECTOR_TYPE);
        assert_eq!(registry.instantiate(&framework, RUNNER_TYPE).unwrap().type_name(), RUNNER_TYPE);
    }

    #[test]
    fn test_unexported_type_is_not_found() {
        let registry = ContractRegistry::builtin();
        let err = registry.instantiate(&framework(&[COLLECTOR_TYPE]), RUNNER_TYPE).err().unwrap();
        assert!(matches!(err, ContractError::TypeNotFound { ref type_name, .. } if type_name == RUNNER_TYPE));
    }

    #[test]
    fn test_unregistered_type_is_not_found() {
        let registry = ContractRegistry::new();
        let err = registry.instantiate(&framework(&[COLLECTOR_TYPE]), COLLECTOR_TYPE).err().unwrap();
        assert!(matches!(err, ContractError::TypeNotFound { .. }));
    }

    #[test]
    fn test_exit_error_renders_stderr_tail() {
        let err = ContractError::Exit {
            status: "exit status: 3".to_string(),
            stderr: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "target exited with exit status: 3:\nboom");
    }
}
