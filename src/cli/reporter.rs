//! Console sinks for the `testhost` CLI.
//!
//! Progress lines go to stdout; banners and per-target begin/finished notes go to stderr.

use std::sync::Mutex;
use std::time::Duration;

use crate::host::{DiscoverySink, RunSink, TestCase, TestResult, TestSink};

/// Summary of a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub duration: Duration,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.passed + self.failed
    }
}

/// Prints every discovered test case as it arrives.
#[derive(Default)]
pub struct DiscoveryReporter {
    verbose: bool,
    cases: Mutex<Vec<TestCase>>,
}

impl DiscoveryReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            cases: Mutex::default(),
        }
    }

    /// Cases reported so far, in arrival order.
    pub fn cases(&self) -> Vec<TestCase> {
        self.cases.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl TestSink for DiscoveryReporter {
    fn begin(&self, message: &str) {
        if self.verbose {
            eprintln!("discovering {message}");
        }
    }

    fn finished(&self, message: &str) {
        if self.verbose {
            eprintln!("discovered {message}");
        }
    }
}

impl DiscoverySink for DiscoveryReporter {
    fn progress(&self, test_case: TestCase) {
        match (&test_case.code_file_path, test_case.line_number) {
            (Some(file), Some(line)) => println!("{} ({file}:{line})", test_case.fully_qualified_name),
            _ => println!("{}", test_case.fully_qualified_name),
        }
        if let Ok(mut cases) = self.cases.lock() {
            cases.push(test_case);
        }
    }
}

/// pytest-style result reporter.
#[derive(Default)]
pub struct RunReporter {
    verbose: bool,
    summary: Mutex<RunSummary>,
    failures: Mutex<Vec<TestResult>>,
}

impl RunReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            ..Self::default()
        }
    }

    pub fn summary(&self) -> RunSummary {
        self.summary.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Print failure details and the closing summary line.
    pub fn print_summary(&self, elapsed: Duration) {
        let failures = self.failures.lock().map(|f| f.clone()).unwrap_or_default();
        if !failures.is_empty() {
            println!();
            println!("\x1b[1;31m=================== FAILURES ===================\x1b[0m");
            for result in &failures {
                println!();
                println!("\x1b[1m___________ {} ___________\x1b[0m", result.test_case.fully_qualified_name);
                if let Some(message) = &result.error_message {
                    println!();
                    println!("    {message}");
                }
                if let Some(trace) = &result.stack_trace {
                    for line in trace.lines() {
                        println!("    {line}");
                    }
                }
                println!();
                println!("    {}", result.test_case.source.display());
            }
        }

        let summary = self.summary();
        let color = if summary.failed > 0 { "\x1b[1;31m" } else { "\x1b[1;32m" };
        let mut parts = Vec::new();
        if summary.passed > 0 {
            parts.push(format!("{} passed", summary.passed));
        }
        if summary.failed > 0 {
            parts.push(format!("{} failed", summary.failed));
        }
        if parts.is_empty() {
            parts.push("no tests ran".to_string());
        }
        println!();
        println!(
            "{color}=================== {} in {:.2}s ===================\x1b[0m",
            parts.join(", "),
            elapsed.as_secs_f64()
        );
    }
}

impl TestSink for RunReporter {
    fn begin(&self, message: &str) {
        if self.verbose {
            eprintln!("running {message}");
        }
    }

    fn finished(&self, message: &str) {
        if self.verbose {
            eprintln!("finished {message}");
        }
    }
}

impl RunSink for RunReporter {
    fn progress(&self, result: TestResult) {
        let status = if result.is_failure() {
            "\x1b[31mFAILED\x1b[0m"
        } else {
            "\x1b[32mPASSED\x1b[0m"
        };
        if self.verbose {
            println!(
                "{} {status} ({}ms)",
                result.test_case.fully_qualified_name,
                result.duration.as_millis()
            );
        } else {
            println!("{} {status}", result.test_case.fully_qualified_name);
        }

        if let Ok(mut summary) = self.summary.lock() {
            summary.duration += result.duration;
            if result.is_failure() {
                summary.failed += 1;
            } else {
                summary.passed += 1;
            }
        }
        if result.is_failure() {
            if let Ok(mut failures) = self.failures.lock() {
                failures.push(result);
            }
        }
    }
}
