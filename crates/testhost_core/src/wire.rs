//! Newline-delimited JSON channel between the host and an isolated agent.
//!
//! Every message is a single JSON object tagged by `type`. The host writes [`HostMessage`]s to the agent's
//! stdin and reads [`AgentMessage`]s from its stdout. A context begins with `setup`/`ready` and ends with a
//! terminal message (`completed`, `faulted` or `canceled`) followed by `drained`, after which no further
//! progress for that operation will be written.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

use crate::identity::DependencyTable;
use crate::remote::RemoteFault;

/// Bumped whenever a message changes shape.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("could not decode message `{line}`: {source}")]
    Decode {
        line: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Everything an isolated context needs before it can load code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSetup {
    pub context_name: String,
    /// Directory that loads by identity are searched against.
    pub application_base: PathBuf,
    /// Sibling `<target>.config`, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_file: Option<PathBuf>,
    #[serde(default)]
    pub shadow_copy: bool,
    #[serde(default)]
    pub shadow_copy_directories: Vec<PathBuf>,
    #[serde(default)]
    pub dependencies: DependencyTable,
    /// Short name of the test framework the target is expected to reference.
    pub framework_name: String,
    pub protocol_version: u32,
}

/// Host → agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Setup(ContextSetup),
    Discover { target: PathBuf },
    Run { target: PathBuf, names: Vec<String> },
    Cancel,
    Shutdown,
}

/// Agent → host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Ready { context: String, pid: u32 },
    Begin { message: String },
    Progress { args: Vec<Value> },
    Finished { message: String },
    Completed,
    Faulted { fault: RemoteFault },
    Canceled,
    /// No more callbacks will be written for the current operation.
    Drained,
}

impl AgentMessage {
    /// Whether this message settles the current operation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentMessage::Completed | AgentMessage::Faulted { .. } | AgentMessage::Canceled
        )
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<String, WireError> {
    serde_json::to_string(message).map_err(WireError::Encode)
}

pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, WireError> {
    serde_json::from_str(line).map_err(|source| WireError::Decode {
        line: line.to_string(),
        source,
    })
}

/// Reads one message per line, skipping blank lines.
pub struct MessageReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            lines: BufReader::new(inner).lines(),
        }
    }

    /// Next message, or `None` at end of stream.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, WireError> {
        while let Some(line) = self.lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return decode(line).map(Some);
        }
        Ok(None)
    }
}

/// Writes one message per line and flushes after each.
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), WireError> {
        let mut line = encode(message)?;
        line.push('\n');
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), WireError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
