//! Host configuration (`testhost.toml`).
//!
//! Every field is optional; a missing file means defaults. CLI flags are applied on top.
//!
//! ```toml
//! framework_name = "Persimmon"
//! grace_interval_ms = 100
//! startup_timeout_ms = 10000
//! shutdown_timeout_ms = 2000
//! shadow_copy = true
//! isolation = "process"
//! agent_path = "/opt/testhost/bin/testhost-agent"
//! supporting_dirs = ["/opt/testhost/lib"]
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default config file name looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "testhost.toml";

/// Short name of the test framework the engine late-binds to.
pub const DEFAULT_FRAMEWORK_NAME: &str = "Persimmon";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("framework_name must not be empty")]
    EmptyFrameworkName,
}

/// How isolated contexts are created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// One `testhost-agent` child process per context.
    #[default]
    Process,
    /// The agent loop on a task in this process. No crash containment.
    InProcess,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    pub framework_name: String,
    /// Fallback wait for the agent's `drained` acknowledgment before teardown.
    pub grace_interval_ms: u64,
    pub startup_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub shadow_copy: bool,
    pub isolation: Isolation,
    /// Agent executable. Defaults to `testhost-agent` next to the current executable.
    pub agent_path: Option<PathBuf>,
    /// Extra directories scanned for supporting assemblies.
    pub supporting_dirs: Vec<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            framework_name: DEFAULT_FRAMEWORK_NAME.to_string(),
            grace_interval_ms: 100,
            startup_timeout_ms: 10_000,
            shutdown_timeout_ms: 2_000,
            shadow_copy: true,
            isolation: Isolation::Process,
            agent_path: None,
            supporting_dirs: Vec::new(),
        }
    }
}

impl HostConfig {
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text, path)
    }

    /// Read `path` if given, else `testhost.toml` in `cwd` if present, else defaults.
    pub fn discover(path: Option<&Path>, cwd: &Path) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let implicit = cwd.join(CONFIG_FILE_NAME);
        if implicit.is_file() {
            tracing::debug!(path = %implicit.display(), "using implicit config file");
            return Self::load(&implicit);
        }
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.framework_name.trim().is_empty() {
            return Err(ConfigError::EmptyFrameworkName);
        }
        Ok(())
    }

    pub fn grace_interval(&self) -> Duration {
        Duration::from_millis(self.grace_interval_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig::discover(None, dir.path()).unwrap();
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.grace_interval(), Duration::from_millis(100));
        assert_eq!(config.framework_name, "Persimmon");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = HostConfig::from_toml("isolation = \"in_process\"\ngrace_interval_ms = 5\n", Path::new("t.toml"))
            .unwrap();
        assert_eq!(config.isolation, Isolation::InProcess);
        assert_eq!(config.grace_interval_ms, 5);
        assert!(config.shadow_copy);
    }

    #[test]
    fn test_implicit_file_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE_NAME), "framework_name = \"Other\"\n").unwrap();
        let config = HostConfig::discover(None, dir.path()).unwrap();
        assert_eq!(config.framework_name, "Other");
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = HostConfig::from_toml("grace = 1\n", Path::new("t.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_default_config_file_shape() {
        let text = toml::to_string(&HostConfig::default()).unwrap();
        insta::assert_snapshot!(text, @r#"
        framework_name = "Persimmon"
        grace_interval_ms = 100
        startup_timeout_ms = 10000
        shutdown_timeout_ms = 2000
        shadow_copy = true
        isolation = "process"
        supporting_dirs = []
        "#);
        assert_eq!(HostConfig::from_toml(&text, Path::new("t.toml")).unwrap(), HostConfig::default());
    }

    #[test]
    fn test_empty_framework_name_is_rejected() {
        let err = HostConfig::from_toml("framework_name = \" \"\n", Path::new("t.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyFrameworkName));
    }
}
