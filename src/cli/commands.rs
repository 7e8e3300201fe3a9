//! CLI command implementations
//!
//! All command functions return `CliResult<ExitCode>` instead of calling
//! `process::exit`. Error handling and exits happen in the top-level `run()`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::config::{HostConfig, Isolation};
use crate::host::{BatchReport, EXECUTOR_URI, Orchestrator, TestCase};
use crate::version::TESTHOST_VERSION;

use super::reporter::{DiscoveryReporter, RunReporter};
use super::{CliError, CliResult, ExitCode};

/// Options shared by every command.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub config: Option<PathBuf>,
    pub in_process: bool,
    pub verbose: bool,
}

/// Load the host configuration and apply flag overrides.
fn load_config(options: &CommandOptions) -> CliResult<HostConfig> {
    let cwd = std::env::current_dir().map_err(|e| CliError::failure(format!("Error: {e}")))?;
    let mut config = HostConfig::discover(options.config.as_deref(), &cwd)
        .map_err(|e| CliError::failure(format!("Error: {e}")))?;
    if options.in_process {
        config.isolation = Isolation::InProcess;
    }
    Ok(config)
}

fn runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::failure(format!("Error starting runtime: {e}")))
}

fn orchestrator(options: &CommandOptions) -> CliResult<Arc<Orchestrator>> {
    let config = load_config(options)?;
    let orchestrator = Orchestrator::from_config(config).map_err(|e| CliError::failure(format!("Error: {e}")))?;
    Ok(Arc::new(orchestrator))
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancellation requested");
            token.cancel();
        }
    });
}

fn report_failures(report: &BatchReport) {
    for (target, error) in &report.failed {
        eprintln!("\x1b[31merror\x1b[0m: {}: {error}", target.display());
    }
}

/// `testhost discover <PATHS>...`
pub fn discover(paths: &[PathBuf], options: &CommandOptions) -> CliResult<ExitCode> {
    let orchestrator = orchestrator(options)?;
    let reporter = Arc::new(DiscoveryReporter::new(options.verbose));

    eprintln!("testhost {TESTHOST_VERSION}: test discovery started");
    let report = runtime()?.block_on(orchestrator.discover_all(paths.to_vec(), reporter.clone()));
    report_failures(&report);
    eprintln!(
        "testhost {TESTHOST_VERSION}: test discovery finished, {} test(s) found",
        reporter.cases().len()
    );

    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Err(CliError::new("", ExitCode::FAILURE))
    }
}

/// `testhost run <PATHS>... [--test NAME]...`
///
/// Without names every test in every target runs; with names, each target runs just those.
pub fn run(paths: &[PathBuf], tests: &[String], options: &CommandOptions) -> CliResult<ExitCode> {
    let orchestrator = orchestrator(options)?;
    let reporter = Arc::new(RunReporter::new(options.verbose));
    let cancel = CancellationToken::new();
    let started = Instant::now();

    eprintln!("testhost {TESTHOST_VERSION}: test run started");
    let report = runtime()?.block_on(async {
        cancel_on_ctrl_c(cancel.clone());
        if tests.is_empty() {
            orchestrator.run_all(paths.to_vec(), reporter.clone(), cancel.clone()).await
        } else {
            let cases = requested_cases(paths, tests);
            orchestrator.run_cases(cases, reporter.clone(), cancel.clone()).await
        }
    });
    report_failures(&report);
    reporter.print_summary(started.elapsed());
    eprintln!("testhost {TESTHOST_VERSION}: test run finished");

    if !report.canceled.is_empty() {
        eprintln!("run canceled for {} target(s)", report.canceled.len());
    }
    if report.is_success() && reporter.summary().failed == 0 {
        Ok(ExitCode::SUCCESS)
    } else {
        // Summary already printed
        Err(CliError::new("", ExitCode::FAILURE))
    }
}

/// One case per requested name per target.
fn requested_cases(paths: &[PathBuf], tests: &[String]) -> Vec<TestCase> {
    paths
        .iter()
        .flat_map(|path| tests.iter().map(move |name| TestCase::new(name.as_str(), EXECUTOR_URI, Path::new(path))))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_cases_cover_every_target() {
        let paths = [PathBuf::from("/t/A.dll"), PathBuf::from("/t/B.dll")];
        let tests = ["A.T1.x".to_string(), "A.T2.y".to_string()];
        let cases = requested_cases(&paths, &tests);
        assert_eq!(cases.len(), 4);
        assert_eq!(cases[0].source, PathBuf::from("/t/A.dll"));
        assert_eq!(cases[3].source, PathBuf::from("/t/B.dll"));
        assert_eq!(cases[3].fully_qualified_name, "A.T2.y");
    }

    #[test]
    fn test_in_process_flag_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("testhost.toml");
        std::fs::write(&config, "isolation = \"process\"\n").unwrap();
        let options = CommandOptions {
            config: Some(config),
            in_process: true,
            verbose: false,
        };
        assert_eq!(load_config(&options).unwrap().isolation, Isolation::InProcess);
    }
}
