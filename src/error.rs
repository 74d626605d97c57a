//! Error types shared across the engine
//!
//! Block-level failures never show up here: they are reported as an
//! `ExecutionStatus` on the block's result. These enums cover the failures
//! that end a turn or a call.

use thiserror::Error;

pub use crate::config::ConfigError;

/// Failures acquiring or running a language runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no runtime is available for language '{0}'")]
    UnsupportedLanguage(String),

    #[error("runtime for '{0}' failed to start earlier in this conversation")]
    MarkedUnsupported(String),

    #[error("runtime for '{language}' failed to start after {attempts} attempts: {message}")]
    StartFailed {
        language: String,
        attempts: u32,
        message: String,
    },

    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures talking to the model backend
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode model response: {0}")]
    Decode(String),

    #[error("model backend error: {0}")]
    Backend(String),
}

/// Violations of transcript ordering
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranscriptError {
    #[error("execution output must follow an assistant message or another execution output")]
    OrphanExecution,
}

/// Failures of the conversation history store
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("history serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid conversation id '{0}'")]
    InvalidId(String),

    #[error("history task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Errors that end a turn
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    RuntimeStart(RuntimeError),

    #[error(transparent)]
    Transcript(#[from] TranscriptError),
}

/// Errors surfaced by the engine facade
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    History(#[from] HistoryError),

    /// The turn failed and its transcript could not be saved either
    #[error("{turn} (conversation was not saved: {save})")]
    TurnNotSaved {
        #[source]
        turn: AgentError,
        save: HistoryError,
    },

    #[error(transparent)]
    Model(#[from] ModelError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = RuntimeError::StartFailed {
            language: "python".to_string(),
            attempts: 3,
            message: "No such file or directory".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "runtime for 'python' failed to start after 3 attempts: No such file or directory"
        );

        let err = AgentError::RuntimeStart(RuntimeError::MarkedUnsupported("shell".to_string()));
        assert_eq!(
            err.to_string(),
            "runtime for 'shell' failed to start earlier in this conversation"
        );

        let err = EngineError::TurnNotSaved {
            turn: AgentError::Model(ModelError::Backend("boom".to_string())),
            save: HistoryError::InvalidId("../x".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "model backend error: boom (conversation was not saved: invalid conversation id '../x')"
        );
    }
}
