//! Boundary-safe progress records.
//!
//! Progress crosses the isolation boundary as a fixed-arity array of plain JSON values, never as a framework
//! type, because the framework's exact version is unknown on the host side.
//!
//! - discovery: `[qualified_name, display_name, declaring_type, member_name, file|null, line|-1]`
//! - run: `[qualified_name, declaring_type, member_name, exceptions, duration_ticks]`

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Sentinel line number meaning "no navigation data".
pub const NO_LINE: i64 = -1;

/// Length of one duration tick.
pub const NANOS_PER_TICK: u64 = 100;

/// Errors raised while re-hydrating a progress array.
#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("expected {expected} progress values, found {found}")]
    Arity { expected: usize, found: usize },

    #[error("progress value #{index} should be {expected}")]
    Field { index: usize, expected: &'static str },
}

/// Convert a duration to 100 ns ticks, saturating.
pub fn duration_to_ticks(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos() / u128::from(NANOS_PER_TICK)).unwrap_or(i64::MAX)
}

/// Convert 100 ns ticks to a duration. Negative tick counts clamp to zero.
pub fn ticks_to_duration(ticks: i64) -> Duration {
    let ticks = u64::try_from(ticks).unwrap_or(0);
    Duration::from_nanos(ticks.saturating_mul(NANOS_PER_TICK))
}

/// An exception reduced to values that are safe to serialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteException {
    pub type_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl RemoteException {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack_trace: None,
        }
    }
}

fn string_at(args: &[Value], index: usize) -> Result<String, RecordError> {
    args[index].as_str().map(str::to_string).ok_or(RecordError::Field {
        index,
        expected: "a string",
    })
}

fn check_arity(args: &[Value], expected: usize) -> Result<(), RecordError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(RecordError::Arity {
            expected,
            found: args.len(),
        })
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// One discovered test, as produced inside the isolated context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredTestRecord {
    pub qualified_name: String,
    pub display_name: String,
    pub declaring_type: String,
    pub member_name: String,
    pub source_file: Option<String>,
    pub source_line: Option<u32>,
}

impl DiscoveredTestRecord {
    pub const ARITY: usize = 6;

    pub fn into_args(self) -> Vec<Value> {
        vec![
            Value::String(self.qualified_name),
            Value::String(self.display_name),
            Value::String(self.declaring_type),
            Value::String(self.member_name),
            self.source_file.map(Value::String).unwrap_or(Value::Null),
            Value::from(self.source_line.map(i64::from).unwrap_or(NO_LINE)),
        ]
    }

    pub fn from_args(args: &[Value]) -> Result<Self, RecordError> {
        check_arity(args, Self::ARITY)?;

        let source_file = match &args[4] {
            Value::Null => None,
            Value::String(file) => Some(file.clone()),
            _ => {
                return Err(RecordError::Field {
                    index: 4,
                    expected: "a string or null",
                });
            }
        };
        let line = args[5].as_i64().ok_or(RecordError::Field {
            index: 5,
            expected: "an integer",
        })?;

        Ok(Self {
            qualified_name: string_at(args, 0)?,
            display_name: string_at(args, 1)?,
            declaring_type: string_at(args, 2)?,
            member_name: string_at(args, 3)?,
            source_file,
            source_line: u32::try_from(line).ok(),
        })
    }
}

// ============================================================================
// Run
// ============================================================================

/// One finished test, as produced inside the isolated context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcomeRecord {
    pub qualified_name: String,
    pub declaring_type: String,
    pub member_name: String,
    pub exceptions: Vec<RemoteException>,
    pub duration_ticks: i64,
}

impl TestOutcomeRecord {
    pub const ARITY: usize = 5;

    /// A test failed iff it collected at least one exception.
    pub fn is_failure(&self) -> bool {
        !self.exceptions.is_empty()
    }

    pub fn duration(&self) -> Duration {
        ticks_to_duration(self.duration_ticks)
    }

    pub fn into_args(self) -> Vec<Value> {
        let exceptions = self
            .exceptions
            .into_iter()
            .map(|e| serde_json::to_value(e).unwrap_or(Value::Null))
            .collect();
        vec![
            Value::String(self.qualified_name),
            Value::String(self.declaring_type),
            Value::String(self.member_name),
            Value::Array(exceptions),
            Value::from(self.duration_ticks),
        ]
    }

    pub fn from_args(args: &[Value]) -> Result<Self, RecordError> {
        check_arity(args, Self::ARITY)?;

        let exceptions = serde_json::from_value::<Vec<RemoteException>>(args[3].clone()).map_err(|_| {
            RecordError::Field {
                index: 3,
                expected: "an exception list",
            }
        })?;
        let duration_ticks = args[4].as_i64().ok_or(RecordError::Field {
            index: 4,
            expected: "an integer",
        })?;

        Ok(Self {
            qualified_name: string_at(args, 0)?,
            declaring_type: string_at(args, 1)?,
            member_name: string_at(args, 2)?,
            exceptions,
            duration_ticks,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn discovered() -> DiscoveredTestRecord {
        DiscoveredTestRecord {
            qualified_name: "A.T1.should_pass".to_string(),
            display_name: "A.T1.should_pass".to_string(),
            declaring_type: "A.T1".to_string(),
            member_name: "should_pass".to_string(),
            source_file: None,
            source_line: None,
        }
    }

    #[test]
    fn test_discovered_wire_shape_uses_sentinels() {
        let args = discovered().into_args();
        assert_eq!(
            Value::Array(args),
            json!(["A.T1.should_pass", "A.T1.should_pass", "A.T1", "should_pass", null, -1])
        );
    }

    #[test]
    fn test_discovered_with_navigation_data() {
        let args = json!(["A.T1.x", "A.T1.x", "A.T1", "x", "src/t1.rs", 42]);
        let record = DiscoveredTestRecord::from_args(args.as_array().unwrap()).unwrap();
        assert_eq!(record.source_file.as_deref(), Some("src/t1.rs"));
        assert_eq!(record.source_line, Some(42));
    }

    #[test]
    fn test_discovered_rejects_wrong_arity() {
        let args = vec![Value::from("only one")];
        assert_eq!(
            DiscoveredTestRecord::from_args(&args),
            Err(RecordError::Arity { expected: 6, found: 1 })
        );
    }

    #[test]
    fn test_discovered_rejects_non_string_name() {
        let args = json!([1, "d", "t", "m", null, -1]);
        assert_eq!(
            DiscoveredTestRecord::from_args(args.as_array().unwrap()),
            Err(RecordError::Field {
                index: 0,
                expected: "a string"
            })
        );
    }

    #[test]
    fn test_outcome_failure_follows_exceptions() {
        let passed = TestOutcomeRecord {
            qualified_name: "A.T1.should_pass".to_string(),
            declaring_type: "A.T1".to_string(),
            member_name: "should_pass".to_string(),
            exceptions: Vec::new(),
            duration_ticks: 1_500,
        };
        assert!(!passed.is_failure());

        let mut failed = passed.clone();
        failed.exceptions.push(RemoteException::new("AssertionError", "1 != 2"));
        assert!(failed.is_failure());

        let back = TestOutcomeRecord::from_args(&failed.clone().into_args()).unwrap();
        assert_eq!(back, failed);
    }

    #[test]
    fn test_outcome_rejects_bad_exception_list() {
        let args = json!(["n", "t", "m", "boom", 0]);
        assert!(matches!(
            TestOutcomeRecord::from_args(args.as_array().unwrap()),
            Err(RecordError::Field { index: 3, .. })
        ));
    }

    #[test]
    fn test_tick_conversion() {
        assert_eq!(duration_to_ticks(Duration::from_millis(1)), 10_000);
        assert_eq!(ticks_to_duration(10_000), Duration::from_millis(1));
        assert_eq!(ticks_to_duration(-5), Duration::ZERO);
    }
}
