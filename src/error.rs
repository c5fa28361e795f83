//! Error types shared by the control plane.
//!
//! Every fallible core operation returns [`Error`]. Callers branch on
//! [`Error::kind`] rather than on message text.

use thiserror::Error;

/// The result type used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error category callers pattern-match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    InvalidState,
    InvalidInput,
    Transient,
    Fatal,
}

#[derive(Debug, Error)]
pub enum Error {
    /// The resource does not exist, or the actor may not know that it does.
    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The operation is not allowed in the resource's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Infrastructure failure that may succeed if tried again later.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The container orchestrator could not be reached at startup.
    #[error("cluster access unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Fatal(String),
}

impl Error {
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Transient(_) | Error::Unavailable(_) => ErrorKind::Transient,
            Error::Storage(_) | Error::Pool(_) | Error::Serialization(_) | Error::Fatal(_) => {
                ErrorKind::Fatal
            }
        }
    }
}

impl From<crate::orchestrator::OrchestratorError> for Error {
    fn from(e: crate::orchestrator::OrchestratorError) -> Self {
        use crate::orchestrator::OrchestratorError;
        match e {
            OrchestratorError::NotFound(what) => Error::not_found("cluster object", what),
            OrchestratorError::Unavailable(msg) => Error::Unavailable(msg),
            other if other.is_transient() => Error::Transient(other.to_string()),
            other => Error::Fatal(other.to_string()),
        }
    }
}
