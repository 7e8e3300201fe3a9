//! The built-in contract: drive the target assembly as a process.
//!
//! The target is started with its working directory set to the application base:
//!
//! - discovery: `<image> --persimmon-collect`
//! - execution: `<image> --persimmon-run [--test NAME]...`
//!
//! It answers with one JSON object per stdout line. Lines that do not start with `{` are treated as ordinary
//! test output and skipped, whatever their encoding. A non-zero exit faults the invocation with the tail of stderr.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;

use super::contract::{
    COLLECT_MEMBER, COLLECTOR_TYPE, CONFIG_FILE_ENV, ContractError, Invocation, LateBoundObject, RUN_MEMBER,
    RUNNER_TYPE,
};
use super::loader::LoadedAssembly;

pub const COLLECT_FLAG: &str = "--persimmon-collect";
pub const RUN_FLAG: &str = "--persimmon-run";
pub const TEST_FLAG: &str = "--test";

/// Bytes of stderr kept for fault reports.
const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Collector,
    Runner,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandLineContract {
    role: Role,
}

impl CommandLineContract {
    pub fn collector() -> Self {
        Self { role: Role::Collector }
    }

    pub fn runner() -> Self {
        Self { role: Role::Runner }
    }

    pub fn construct_collector(_framework: &LoadedAssembly) -> Result<Box<dyn LateBoundObject>, ContractError> {
        Ok(Box::new(Self::collector()))
    }

    pub fn construct_runner(_framework: &LoadedAssembly) -> Result<Box<dyn LateBoundObject>, ContractError> {
        Ok(Box::new(Self::runner()))
    }

    fn member(&self) -> &'static str {
        match self.role {
            Role::Collector => COLLECT_MEMBER,
            Role::Runner => RUN_MEMBER,
        }
    }

    fn arguments(&self, names: &[String]) -> Vec<String> {
        match self.role {
            Role::Collector => vec![COLLECT_FLAG.to_string()],
            Role::Runner => {
                let mut args = vec![RUN_FLAG.to_string()];
                for name in names {
                    args.push(TEST_FLAG.to_string());
                    args.push(name.clone());
                }
                args
            }
        }
    }
}

#[async_trait]
impl LateBoundObject for CommandLineContract {
    fn type_name(&self) -> &str {
        match self.role {
            Role::Collector => COLLECTOR_TYPE,
            Role::Runner => RUNNER_TYPE,
        }
    }

    #[tracing::instrument(skip_all, fields(member = %member, target = %call.assembly.image.display()))]
    async fn invoke(&self, member: &str, mut call: Invocation<'_>) -> Result<(), ContractError> {
        if member != self.member() {
            return Err(ContractError::MemberNotFound {
                type_name: self.type_name().to_string(),
                member: member.to_string(),
            });
        }
        if call.cancel.is_cancelled() {
            return Err(ContractError::Canceled);
        }

        let program = &call.assembly.image;
        let mut command = Command::new(program);
        command
            .args(self.arguments(call.names))
            .current_dir(&call.environment.application_base)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(config) = &call.environment.configuration_file {
            command.env(CONFIG_FILE_ENV, config);
        }

        let mut child = command.spawn().map_err(|source| ContractError::Spawn {
            program: program.clone(),
            source,
        })?;
        tracing::debug!(pid = child.id(), "target started");

        let stdout = child.stdout.take().ok_or_else(|| ContractError::Payload {
            member: member.to_string(),
            reason: "stdout was not captured".to_string(),
        })?;
        let stderr_tail = child.stderr.take().map(|stderr| tokio::spawn(read_tail(stderr)));

        let mut stdout = BufReader::new(stdout);
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = tokio::select! {
                biased;
                _ = call.cancel.cancelled() => {
                    tracing::info!("cancel requested; stopping target");
                    if let Err(error) = child.kill().await {
                        tracing::warn!(%error, "could not kill target");
                    }
                    return Err(ContractError::Canceled);
                }
                read = stdout.read_until(b'\n', &mut line) => read?,
            };
            if read == 0 {
                break;
            }
            let payload = payload_line(&line).map_err(|reason| ContractError::Payload {
                member: member.to_string(),
                reason,
            })?;
            if let Some(payload) = payload {
                (call.callback)(payload)?;
            }
        }

        let status = child.wait().await?;
        let stderr = match stderr_tail {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        if !status.success() {
            return Err(ContractError::Exit {
                status: status.to_string(),
                stderr,
            });
        }
        Ok(())
    }
}

/// Parse one stdout line. Only lines starting with `{` carry payloads; anything else is target output.
fn payload_line(raw: &[u8]) -> Result<Option<Value>, String> {
    let line = raw.trim_ascii();
    if !line.starts_with(b"{") {
        if !line.is_empty() {
            tracing::trace!(line = %String::from_utf8_lossy(line), "target output");
        }
        return Ok(None);
    }
    serde_json::from_slice(line).map(Some).map_err(|e| e.to_string())
}

/// Drain `reader`, keeping only the last [`STDERR_TAIL_BYTES`] bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > STDERR_TAIL_BYTES {
                    let excess = tail.len() - STDERR_TAIL_BYTES;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).trim_end().to_string()
}
