//! CLI module for the test host
//!
//! This module provides the command-line host adapter over the orchestrator.
//!
//! ## Commands
//!
//! - `discover <PATH>...` - List the tests in each target assembly
//! - `run <PATH>... [--test NAME]...` - Run all tests, or the named ones, in each target
//!
//! ## Modules
//!
//! - `commands` - Command implementations
//! - `reporter` - Console sinks
//!
//! ## Design
//!
//! The CLI uses clap for argument parsing with derive macros.
//! Command functions return `CliResult<T>` instead of calling `process::exit`.
//! Only the top-level `run()` function handles errors and exits.

// Enforce explicit error handling - no panicking in production code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod commands;
pub mod reporter;

use std::fmt;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use crate::version::TESTHOST_VERSION;
use commands::CommandOptions;

// ============================================================================
// CLI Error handling
// ============================================================================

/// Exit code for CLI operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    pub const FAILURE: ExitCode = ExitCode(1);
}

/// Error type for CLI operations.
///
/// Contains a user-facing message and an exit code. The CLI entry point
/// catches these errors, prints the message, and exits with the code.
#[derive(Debug)]
pub struct CliError {
    /// User-facing error message (already formatted for display)
    pub message: String,
    /// Exit code to return to the shell
    pub exit_code: ExitCode,
}

impl CliError {
    pub fn new(message: impl Into<String>, exit_code: ExitCode) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }

    /// Create a failure error (exit code 1).
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(message, ExitCode::FAILURE)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

// ============================================================================
// Clap CLI definition
// ============================================================================

/// Discover and run tests in isolated contexts
#[derive(Parser, Debug)]
#[command(name = "testhost")]
#[command(version = TESTHOST_VERSION)]
#[command(about = "Discover and run tests in isolated contexts", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Host configuration file (default: ./testhost.toml when present)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Run contexts on tasks in this process instead of agent processes
    #[arg(long, global = true)]
    pub in_process: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the tests in each target assembly
    Discover {
        /// Target assemblies
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,
    },

    /// Run tests in each target assembly
    Run {
        /// Target assemblies
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,
        /// Fully qualified name of a test to run (repeatable; default: all)
        #[arg(short = 't', long = "test", value_name = "NAME")]
        tests: Vec<String>,
    },
}

// ============================================================================
// CLI entry point
// ============================================================================

/// Main CLI entry point.
///
/// This is the only place where `process::exit` is called. All command
/// implementations return `CliResult` and errors are handled here.
pub fn run() {
    let cli = Cli::parse();

    match execute(cli) {
        Ok(exit_code) => {
            if exit_code.0 != 0 {
                process::exit(exit_code.0);
            }
        }
        Err(e) => {
            if !e.message.is_empty() {
                eprintln!("{}", e.message);
            }
            process::exit(e.exit_code.0);
        }
    }
}

/// Execute the CLI command and return result.
fn execute(cli: Cli) -> CliResult<ExitCode> {
    let options = CommandOptions {
        config: cli.config,
        in_process: cli.in_process,
        verbose: cli.verbose,
    };
    match cli.command {
        Command::Discover { paths } => commands::discover(&paths, &options),
        Command::Run { paths, tests } => commands::run(&paths, &tests, &options),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_discover() {
        let cli = Cli::try_parse_from(["testhost", "discover", "A.dll", "B.dll"]).unwrap();
        if let Command::Discover { paths } = cli.command {
            assert_eq!(paths, [PathBuf::from("A.dll"), PathBuf::from("B.dll")]);
        } else {
            panic!("Expected Discover command");
        }
    }

    #[test]
    fn test_cli_parse_run_with_tests() {
        let cli = Cli::try_parse_from(["testhost", "run", "A.dll", "--test", "A.T1.x", "-t", "A.T2.y"]).unwrap();
        if let Command::Run { paths, tests } = cli.command {
            assert_eq!(paths.len(), 1);
            assert_eq!(tests, ["A.T1.x", "A.T2.y"]);
        } else {
            panic!("Expected Run command");
        }
    }

    #[test]
    fn test_cli_parse_global_flags() {
        let args = ["testhost", "run", "A.dll", "--in-process", "--config", "x.toml", "-v"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(cli.in_process);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
    }

    #[test]
    fn test_cli_parse_requires_a_path() {
        assert!(Cli::try_parse_from(["testhost", "run"]).is_err());
        assert!(Cli::try_parse_from(["testhost", "discover"]).is_err());
    }
}
