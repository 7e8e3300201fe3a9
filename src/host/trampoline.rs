//! Caller-side trampolines: re-hydrate boundary records into the host's result types.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use testhost_core::{DiscoveredTestRecord, SinkTrampoline, TestOutcomeRecord};

use super::sink::{DiscoverySink, RunSink, TestCase, TestOutcome, TestResult};

/// Turns discovery records into [`TestCase`]s owned by the target assembly.
pub struct DiscoverTrampoline {
    target: PathBuf,
    sink: Arc<dyn DiscoverySink>,
}

impl DiscoverTrampoline {
    pub fn new(target: impl Into<PathBuf>, sink: Arc<dyn DiscoverySink>) -> Self {
        Self {
            target: target.into(),
            sink,
        }
    }
}

impl SinkTrampoline for DiscoverTrampoline {
    fn begin(&self, message: &str) {
        self.sink.begin(message);
    }

    fn progress(&self, args: Vec<Value>) {
        let record = match DiscoveredTestRecord::from_args(&args) {
            Ok(record) => record,
            Err(error) => {
                tracing::error!(%error, assembly = %self.target.display(), "malformed discovery record; skipped");
                return;
            }
        };
        let mut test_case = TestCase::new(record.qualified_name, self.sink.extension_uri(), &self.target);
        test_case.display_name = record.display_name;
        test_case.code_file_path = record.source_file;
        test_case.line_number = record.source_line;
        self.sink.progress(test_case);
    }

    fn finished(&self, message: &str) {
        self.sink.finished(message);
    }
}

/// Turns outcome records into [`TestResult`]s for the requested cases.
pub struct RunTrampoline {
    target: PathBuf,
    sink: Arc<dyn RunSink>,
    cases: HashMap<String, TestCase>,
}

impl RunTrampoline {
    pub fn new(target: impl Into<PathBuf>, sink: Arc<dyn RunSink>, cases: impl IntoIterator<Item = TestCase>) -> Self {
        let cases = cases
            .into_iter()
            .map(|case| (case.fully_qualified_name.clone(), case))
            .collect();
        Self {
            target: target.into(),
            sink,
            cases,
        }
    }

    /// The requested case for `name`, or a minimal placeholder.
    fn case_for(&self, name: &str) -> TestCase {
        match self.cases.get(name) {
            Some(case) => case.clone(),
            None => {
                // Only a logic fault can get here when specific cases were requested; an empty request runs
                // everything, so unknown names are expected then.
                if !self.cases.is_empty() {
                    tracing::error!(
                        name,
                        assembly = %self.target.display(),
                        "logic fault: result for a test that was not requested"
                    );
                }
                TestCase::new(name, self.sink.extension_uri(), &self.target)
            }
        }
    }
}

impl SinkTrampoline for RunTrampoline {
    fn begin(&self, message: &str) {
        self.sink.begin(message);
    }

    fn progress(&self, args: Vec<Value>) {
        let record = match TestOutcomeRecord::from_args(&args) {
            Ok(record) => record,
            Err(error) => {
                tracing::error!(%error, assembly = %self.target.display(), "malformed outcome record; skipped");
                return;
            }
        };

        let outcome = if record.is_failure() {
            TestOutcome::Failed
        } else {
            TestOutcome::Passed
        };
        let first = record.exceptions.first();
        let result = TestResult {
            test_case: self.case_for(&record.qualified_name),
            outcome,
            duration: record.duration(),
            error_message: first.map(|e| format!("{}: {}", e.type_name, e.message)),
            stack_trace: first.and_then(|e| e.stack_trace.clone()),
        };
        self.sink.progress(result);
    }

    fn finished(&self, message: &str) {
        self.sink.finished(message);
    }
}
