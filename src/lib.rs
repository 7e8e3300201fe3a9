#![forbid(unsafe_code)]
//! Isolated test discovery and execution.
//!
//! The host asks for tests to be discovered or run in a target assembly; each request gets its own disposable
//! isolated context (a `testhost-agent` process, or a task for in-process debugging), which loads the target and
//! the test framework it references, late-binds to the framework's collector or runner, and streams progress back
//! over a newline-delimited JSON channel until the operation settles.
//!
//! - `host` - orchestrator, launchers and caller-side sinks
//! - `agent` - everything that runs inside a context
//! - `cli` - the `testhost` command
//!
//! Boundary types shared by both sides live in the `testhost_core` crate.
//!
//! ## Panic Policy
//!
//! This codebase follows explicit error handling:
//!
//! - **Production code**: Use `Result` or `Option` with `?` / `ok_or` / `map_err`. The `cli`, `host` and `agent`
//!   modules enforce `#![deny(clippy::unwrap_used)]`.
//!
//! - **Test code**: `.unwrap()` and `.expect()` are acceptable in tests.
//!
//! - **Remote panics**: A panic inside a context's operation is caught at the task boundary and reported to the host
//!   as a `panic` fault, never as a dropped channel.

pub mod agent;
pub mod cli;
pub mod config;
pub mod host;
pub mod version;

pub use config::HostConfig;
pub use host::{HostError, Orchestrator};
