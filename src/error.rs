//! Crate-wide error taxonomy.
//!
//! Mirrors the error kinds named in the specification's error-handling
//! section: session-global errors abort before dispatch, case-scoped errors
//! are contained by the executor and aggregated by the orchestrator.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UkError {
    #[error("usage error: {0}")]
    Usage(String),

    #[error("failed to parse {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Matrix(#[from] MatrixError),

    #[error("host probe failed: {0}")]
    Probe(String),

    #[error("workspace layout failed: {0}")]
    Layout(String),

    #[error(transparent)]
    Case(#[from] CaseError),
}

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("axis '{0}' declares no levels")]
    EmptyAxis(String),

    #[error("exclusion rule references unknown axis or level: {0}")]
    UnknownAxisOrLevel(String),

    #[error("no cases survived pruning")]
    NoSurvivingCases,
}

#[derive(Debug, Error)]
pub enum CaseError {
    #[error("case {index} build failed: {reason}")]
    Build { index: usize, reason: String },

    #[error("case {index} run failed: {reason}")]
    Run { index: usize, reason: String },

    #[error("case {index} verification failed: {reason}")]
    Verify { index: usize, reason: String },

    #[error("case {index} timed out during {phase}")]
    Timeout { index: usize, phase: String },

    #[error("case {index} cancelled")]
    Cancelled { index: usize },
}

/// Never surfaced to the caller as an `Err`; logged and discarded.
/// Kept as a type (rather than a raw log call) so call sites are explicit
/// about which failures are cleanup-only and must not alter a verdict.
#[derive(Debug, Error)]
#[error("cleanup warning: {0}")]
pub struct CleanupWarning(pub String);

/// Process exit codes, per the external-interfaces section of the spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    Usage = 1,
    Config = 2,
    CaseFailure = 3,
    HostShortfall = 4,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> i32 {
        code as i32
    }
}

impl UkError {
    /// Maps an error to the process exit code it should produce.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            UkError::Usage(_) => ExitCode::Usage,
            UkError::ConfigParse { .. } => ExitCode::Config,
            UkError::Matrix(MatrixError::NoSurvivingCases) => ExitCode::HostShortfall,
            UkError::Matrix(_) => ExitCode::Config,
            UkError::Probe(_) => ExitCode::HostShortfall,
            UkError::Layout(_) => ExitCode::Config,
            UkError::Case(_) => ExitCode::CaseFailure,
        }
    }
}
