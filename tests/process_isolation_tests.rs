//! Process-isolated contexts driving a real target through the command-line contract
//!
//! The target assembly is a shell script answering `--persimmon-collect` and `--persimmon-run`, so these tests
//! only run on unix.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use testhost::agent::contract::{COLLECTOR_TYPE, RUNNER_TYPE};
use testhost::config::{HostConfig, Isolation};
use testhost::host::{
    Completion, DiscoverySink, HostError, Orchestrator, RunSink, TestCase, TestOutcome, TestResult, TestSink,
};
use testhost_core::FaultKind;

const SCRIPT: &str = r#"#!/bin/sh
PASS='"declared_member":{"kind":"method","declaring_type":"A.T1","name":"should_pass"}'
FAIL='"declared_member":{"kind":"method","declaring_type":"A.T2","name":"should_fail"}'
case "$1" in
  --persimmon-collect)
    echo "collecting tests"
    echo "{\"full_name\":\"A.T1.should_pass\",$PASS}"
    echo "{\"full_name\":\"A.T2.should_fail\",$FAIL}"
    if [ -n "$TESTHOST_CONFIG_FILE" ]; then
      echo '{"full_name":"Config.seen","declared_member":{"kind":"property","name":"seen"}}'
    fi
    ;;
  --persimmon-run)
    echo "{\"full_name\":\"A.T1.should_pass\",$PASS,\"exceptions\":[],\"duration_ticks\":10000}"
    ERROR='[{"type_name":"AssertionError","message":"1 != 2"}]'
    echo "{\"full_name\":\"A.T2.should_fail\",$FAIL,\"exceptions\":$ERROR,\"duration_ticks\":20000}"
    ;;
  *)
    echo "unexpected arguments: $*" >&2
    exit 2
    ;;
esac
"#;

const FAILING_SCRIPT: &str = r#"#!/bin/sh
echo "target crashed" >&2
exit 3
"#;

/// Writes raw bytes that are not UTF-8 before its only result.
const NOISY_SCRIPT: &str = r#"#!/bin/sh
printf '\377\376\n'
printf 'progress \351t\351\n'
echo '{"full_name":"A.T1.x","declared_member":{"kind":"property","name":"x"},"exceptions":[],"duration_ticks":1}'
"#;

/// Reports one result, then hangs.
const HANGING_SCRIPT: &str = r#"#!/bin/sh
echo '{"full_name":"A.T1.x","declared_member":{"kind":"property","name":"x"},"exceptions":[],"duration_ticks":1}'
exec sleep 30
"#;

fn write_script(dir: &Path, file: &str, body: &str) -> PathBuf {
    let path = dir.join(file);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn write_manifest(assembly: &Path, manifest: serde_json::Value) {
    let mut name = assembly.file_name().unwrap().to_os_string();
    name.push(".manifest.json");
    fs::write(assembly.with_file_name(name), manifest.to_string()).unwrap();
}

fn target(dir: &Path, body: &str) -> PathBuf {
    let framework = dir.join("Persimmon.dll");
    fs::write(&framework, b"framework").unwrap();
    write_manifest(
        &framework,
        json!({"name": "Persimmon", "version": "1.1.0", "exports": [COLLECTOR_TYPE, RUNNER_TYPE]}),
    );
    let target = write_script(dir, "A.dll", body);
    write_manifest(
        &target,
        json!({"name": "A", "version": "1.0.0", "references": [{"name": "Persimmon", "version": "1.1.0"}]}),
    );
    target
}

fn orchestrator() -> Orchestrator {
    let config = HostConfig {
        isolation: Isolation::Process,
        agent_path: Some(PathBuf::from(env!("CARGO_BIN_EXE_testhost-agent"))),
        ..HostConfig::default()
    };
    Orchestrator::from_config(config).unwrap()
}

#[derive(Default)]
struct Collected {
    cases: Mutex<Vec<TestCase>>,
    results: Mutex<Vec<TestResult>>,
    finished: Mutex<bool>,
    cancel_on_result: Option<CancellationToken>,
}

impl TestSink for Collected {
    fn begin(&self, _message: &str) {}
    fn finished(&self, _message: &str) {
        *self.finished.lock().unwrap() = true;
    }
}

impl DiscoverySink for Collected {
    fn progress(&self, test_case: TestCase) {
        self.cases.lock().unwrap().push(test_case);
    }
}

impl RunSink for Collected {
    fn progress(&self, result: TestResult) {
        self.results.lock().unwrap().push(result);
        if let Some(cancel) = &self.cancel_on_result {
            cancel.cancel();
        }
    }
}

#[tokio::test]
async fn test_discover_in_agent_process() {
    let dir = tempfile::tempdir().unwrap();
    let target = target(dir.path(), SCRIPT);
    let sink = Arc::new(Collected::default());

    orchestrator().discover(&target, sink.clone()).await.unwrap();

    let cases = sink.cases.lock().unwrap();
    let names: Vec<_> = cases.iter().map(|c| c.fully_qualified_name.as_str()).collect();
    assert_eq!(names, ["A.T1.should_pass", "A.T2.should_fail"]);
}

#[tokio::test]
async fn test_configuration_file_reaches_target_process() {
    let dir = tempfile::tempdir().unwrap();
    let target = target(dir.path(), SCRIPT);
    fs::write(dir.path().join("A.dll.config"), "<configuration/>").unwrap();
    let sink = Arc::new(Collected::default());

    orchestrator().discover(&target, sink.clone()).await.unwrap();

    let cases = sink.cases.lock().unwrap();
    assert!(cases.iter().any(|c| c.fully_qualified_name == "Config.seen"));
}

#[tokio::test]
async fn test_run_in_agent_process() {
    let dir = tempfile::tempdir().unwrap();
    let target = target(dir.path(), SCRIPT);
    let sink = Arc::new(Collected::default());

    orchestrator()
        .run(&target, Vec::new(), sink.clone(), CancellationToken::new())
        .await
        .unwrap();

    let results = sink.results.lock().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].outcome, TestOutcome::Passed);
    assert_eq!(results[1].outcome, TestOutcome::Failed);
    assert_eq!(results[1].error_message.as_deref(), Some("AssertionError: 1 != 2"));
}

#[tokio::test]
async fn test_target_exit_code_faults_with_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let target = target(dir.path(), FAILING_SCRIPT);
    let sink = Arc::new(Collected::default());

    let err = orchestrator()
        .run(&target, Vec::new(), sink, CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        HostError::Remote(fault) => {
            assert_eq!(fault.kind, FaultKind::Execution);
            assert!(fault.message.contains("target crashed"), "{}", fault.message);
        }
        other => panic!("expected remote fault, got {other:?}"),
    }
}

#[tokio::test]
async fn test_binary_output_does_not_break_results() {
    let dir = tempfile::tempdir().unwrap();
    let target = target(dir.path(), NOISY_SCRIPT);
    let sink = Arc::new(Collected::default());

    let completion = orchestrator()
        .run(&target, Vec::new(), sink.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(completion, Completion::Completed);
    let results = sink.results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].test_case.fully_qualified_name, "A.T1.x");
    assert!(*sink.finished.lock().unwrap());
}

#[tokio::test]
async fn test_cancel_stops_running_target() {
    let dir = tempfile::tempdir().unwrap();
    let target = target(dir.path(), HANGING_SCRIPT);
    let cancel = CancellationToken::new();
    let sink = Arc::new(Collected {
        cancel_on_result: Some(cancel.clone()),
        ..Collected::default()
    });

    let completion = tokio::time::timeout(
        Duration::from_secs(10),
        orchestrator().run(&target, Vec::new(), sink.clone(), cancel),
    )
    .await
    .expect("cancel did not stop the target")
    .unwrap();

    assert_eq!(completion, Completion::Canceled);
    assert_eq!(sink.results.lock().unwrap().len(), 1);
    assert!(!*sink.finished.lock().unwrap());
}
