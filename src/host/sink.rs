//! Caller-side result types and sinks.

use std::path::PathBuf;
use std::time::Duration;

/// Identifies the executor that discovered a test and will run it.
pub const EXECUTOR_URI: &str = "executor://testhost/persimmon";

/// A discovered test, as the host adapter sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub fully_qualified_name: String,
    pub executor_uri: String,
    /// The test assembly the case belongs to.
    pub source: PathBuf,
    pub display_name: String,
    pub code_file_path: Option<String>,
    pub line_number: Option<u32>,
}

impl TestCase {
    /// A case carrying only its identity; display name defaults to the qualified name.
    pub fn new(
        fully_qualified_name: impl Into<String>,
        executor_uri: impl Into<String>,
        source: impl Into<PathBuf>,
    ) -> Self {
        let fully_qualified_name = fully_qualified_name.into();
        Self {
            display_name: fully_qualified_name.clone(),
            fully_qualified_name,
            executor_uri: executor_uri.into(),
            source: source.into(),
            code_file_path: None,
            line_number: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
    pub test_case: TestCase,
    pub outcome: TestOutcome,
    pub duration: Duration,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
}

impl TestResult {
    pub fn is_failure(&self) -> bool {
        self.outcome == TestOutcome::Failed
    }
}

/// Messages common to both operations.
pub trait TestSink: Send + Sync {
    fn extension_uri(&self) -> &str {
        EXECUTOR_URI
    }

    fn begin(&self, message: &str);
    fn finished(&self, message: &str);
}

pub trait DiscoverySink: TestSink {
    fn progress(&self, test_case: TestCase);
}

pub trait RunSink: TestSink {
    fn progress(&self, result: TestResult);
}
