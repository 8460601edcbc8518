//! Error taxonomy.
//!
//! Almost every failure in this engine is data, not an error: timeouts,
//! build breaks, and parse misses land inside the records and results they
//! affected, so a run always completes with a full report. [`EngineError`]
//! covers the small set of conditions that legitimately stop a run.

use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Fatal (run-aborting) errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No strategy registered for the requested ecosystem.
    #[error("no strategy registered for ecosystem: {0}")]
    UnknownEcosystem(String),

    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Process-level resource failure (cannot spawn, cannot persist).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classification of a non-fatal failure, carried inside result objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The child process exceeded its wall-clock budget.
    Timeout,
    /// Compiler or type-checker exited nonzero (distinct from test failure).
    BuildFailure,
    /// Tool or collaborator output did not match the expected structured form.
    ParseFailure,
    /// Join failure between an input and its golden/actual record.
    MissingRecord,
    /// Normalized outputs differ.
    OutputMismatch,
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::BuildFailure => "build_failure",
            FailureKind::ParseFailure => "parse_failure",
            FailureKind::MissingRecord => "missing_record",
            FailureKind::OutputMismatch => "output_mismatch",
        };
        write!(f, "{s}")
    }
}

/// Marker written to stderr fields when a process hit its timeout.
pub const TIMEOUT_MARKER: &str = "TIMEOUT";

/// Prefix used when a compile step fails before execution.
pub const COMPILATION_FAILED_PREFIX: &str = "compilation failed";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_ecosystem_names_the_ecosystem() {
        let e = EngineError::UnknownEcosystem("kotlin".into());
        assert!(e.to_string().contains("kotlin"));
    }

    #[test]
    fn failure_kind_round_trips_snake_case() {
        let v = serde_json::to_value(FailureKind::BuildFailure).unwrap();
        assert_eq!(v, serde_json::json!("build_failure"));
        assert_eq!(FailureKind::Timeout.to_string(), "timeout");
    }
}
