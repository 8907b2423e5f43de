//! Client runtime errors.

use lockstep_core::{mls::MlsError, storage::StorageError};
use thiserror::Error;

/// Errors from the history API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    /// Network failure or timeout
    #[error("network error: {0}")]
    Network(String),

    /// Server answered with an error status
    #[error("server error {status}: {message}")]
    Server {
        /// Status code
        status: u16,
        /// Server-provided description
        message: String,
    },

    /// The client is not allowed to read this conversation
    #[error("access denied to conversation {0}")]
    Forbidden(u128),

    /// The response could not be decoded
    #[error("malformed history response: {0}")]
    Malformed(String),
}

impl HistoryError {
    /// Returns true if the same request may succeed later.
    ///
    /// Network failures, 5xx and 429 are transient. Everything else will
    /// fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Server { status, .. } => *status >= 500 || *status == 429,
            Self::Forbidden(_) | Self::Malformed(_) => false,
        }
    }
}

/// Errors surfaced by the client runtime.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Storage failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// History API failure
    #[error("history error: {0}")]
    History(#[from] HistoryError),

    /// MLS failure
    #[error("MLS error: {0}")]
    Mls(#[from] MlsError),

    /// A blocking storage task panicked or was cancelled
    #[error("background task failed: {0}")]
    Task(String),

    /// The pipeline was shut down
    #[error("pipeline is shut down")]
    Shutdown,
}

impl ClientError {
    /// Returns true if the operation may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_transient(),
            Self::History(e) => e.is_transient(),
            Self::Mls(e) => e.is_transient(),
            Self::Task(_) | Self::Shutdown => false,
        }
    }
}

impl From<tokio::task::JoinError> for ClientError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}
