//! Error types for the diagnostic engine
//!
//! Two families exist:
//!
//! * [`AnalyzerError`] is what analyzer and driver collaborators hand back. It
//!   never crosses the public API: the executor turns it into an exception
//!   diagnostic (or into [`EngineError::Cancelled`] when the caller's own token
//!   fired).
//! * [`EngineError`] is what callers of the engine observe.

use thiserror::Error;

use crate::ids::{DocumentId, ProjectId, WorkspaceId};

/// Failure reported by analyzer code or by the analyzer execution driver
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AnalyzerError {
    #[error("analysis was cancelled")]
    Cancelled,

    #[error("{message}")]
    Failed { message: String },

    #[error("analyzer panicked: {message}")]
    Panicked { message: String },
}

impl AnalyzerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Short type-like name used in exception diagnostic messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            AnalyzerError::Cancelled => "OperationCanceled",
            AnalyzerError::Failed { .. } => "AnalyzerError",
            AnalyzerError::Panicked { .. } => "Panic",
        }
    }

    pub fn message(&self) -> String {
        match self {
            AnalyzerError::Cancelled => "analysis was cancelled".to_string(),
            AnalyzerError::Failed { message } | AnalyzerError::Panicked { message } => {
                message.clone()
            }
        }
    }
}

/// Errors surfaced by the engine's public API
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("operation was cancelled by the caller")]
    Cancelled,

    #[error("analyzer '{analyzer}' violated the diagnostic contract: {message}")]
    ContractViolation { analyzer: String, message: String },

    #[error("project {0} is not part of the solution")]
    UnknownProject(ProjectId),

    #[error("document {0} is not part of the solution")]
    UnknownDocument(DocumentId),

    #[error("diagnostic event bus has shut down")]
    EventBusClosed,

    #[error("workspace {0} has been closed")]
    WorkspaceClosed(WorkspaceId),

    #[error("configuration error: {message}")]
    Config { message: String },
}

impl EngineError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Convenience alias used across the crate
pub type EngineResult<T> = Result<T, EngineError>;
