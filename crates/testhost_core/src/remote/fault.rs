//! Serializable faults.

use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a fault raised inside an isolated context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Target assembly, dependency or contract type could not be loaded.
    Load,
    /// The late-bound contract misbehaved (missing member, malformed payload).
    Contract,
    /// Discovery or execution itself failed.
    Execution,
    /// The boundary channel broke or carried an unexpected message.
    Protocol,
    Io,
    Panic,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FaultKind::Load => "load",
            FaultKind::Contract => "contract",
            FaultKind::Execution => "execution",
            FaultKind::Protocol => "protocol",
            FaultKind::Io => "io",
            FaultKind::Panic => "panic",
        };
        f.write_str(text)
    }
}

/// An error flattened to values that survive serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind} fault: {message}")]
pub struct RemoteFault {
    pub kind: FaultKind,
    pub message: String,
    /// Messages of the error's source chain, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
}

impl RemoteFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            causes: Vec::new(),
        }
    }

    /// Capture an error and its source chain.
    pub fn from_error(kind: FaultKind, error: &(dyn StdError + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            kind,
            message: error.to_string(),
            causes,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io;

    #[derive(Debug, Error)]
    #[error("could not load target")]
    struct Outer {
        #[source]
        source: io::Error,
    }

    #[test]
    fn test_from_error_captures_chain() {
        let error = Outer {
            source: io::Error::new(io::ErrorKind::NotFound, "A.dll missing"),
        };
        let fault = RemoteFault::from_error(FaultKind::Load, &error);
        assert_eq!(fault.message, "could not load target");
        assert_eq!(fault.causes, vec!["A.dll missing".to_string()]);
        assert_eq!(fault.to_string(), "load fault: could not load target");
    }

    #[test]
    fn test_fault_serializes_kind_in_snake_case() {
        let fault = RemoteFault::new(FaultKind::Execution, "boom");
        let json = serde_json::to_string(&fault).unwrap();
        assert_eq!(json, r#"{"kind":"execution","message":"boom"}"#);
    }
}
