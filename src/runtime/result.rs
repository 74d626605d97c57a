//! Execution results reported for each code block

use serde::{Deserialize, Serialize};

use super::language::Language;

/// One piece of output produced by a running block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSegment {
    /// A stdout line
    Text(String),
    /// An inline image emitted by the driver
    Image { mime: String, data_base64: String },
    /// A stderr line
    Error(String),
}

/// Why a block failed to produce a successful result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecErrorKind {
    UnsupportedLanguage,
    RuntimeStart,
    Execution,
}

/// Final status of one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error { kind: ExecErrorKind, message: String },
    Interrupted,
    TimedOut,
    Denied { reason: String },
    ConfirmationTimedOut,
}

impl ExecutionStatus {
    pub fn error(kind: ExecErrorKind, message: impl Into<String>) -> Self {
        ExecutionStatus::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Success)
    }

    /// Short label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error { .. } => "error",
            ExecutionStatus::Interrupted => "interrupted",
            ExecutionStatus::TimedOut => "timed_out",
            ExecutionStatus::Denied { .. } => "denied",
            ExecutionStatus::ConfirmationTimedOut => "confirmation_timed_out",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Error { message, .. } => write!(f, "error: {message}"),
            ExecutionStatus::Denied { reason } => write!(f, "denied: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// The block a result belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub ordinal: usize,
    pub language: Language,
}

/// Outcome of gating and executing one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub block: BlockRef,
    /// Head and tail of the output within the output budget
    pub segments: Vec<OutputSegment>,
    pub status: ExecutionStatus,
    /// Rendered output after the output budget was applied
    pub output: String,
    pub truncated: bool,
    pub duration_ms: u64,
}
