//! Error types for MLS operations.

use thiserror::Error;

/// Errors from the MLS adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MlsError {
    /// OpenMLS rejected an operation
    #[error("MLS crypto error: {0}")]
    Crypto(String),

    /// Bytes could not be decoded as the expected MLS structure
    #[error("MLS serialization error: {0}")]
    Serialization(String),

    /// `merge_pending_commit` without a staged commit
    #[error("no pending commit to merge")]
    NoPendingCommit,

    /// A handshake path received content it does not handle
    #[error("unexpected MLS content: {0}")]
    UnexpectedContent(&'static str),
}

impl MlsError {
    /// MLS failures are never transient: the same input fails the same way.
    pub fn is_transient(&self) -> bool {
        false
    }
}
