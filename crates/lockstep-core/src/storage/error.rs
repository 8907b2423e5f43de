//! Storage error types.
//!
//! - `NotFound`: Requested message doesn't exist
//! - `Tombstoned`: Epoch key was deleted and may not be written again
//! - `Serialization`: Failed to encode/decode data
//! - `Sealing`: At-rest key material could not be sealed or opened
//! - `Io`: Underlying storage system errors

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Message not found
    #[error("message not found: conversation {conversation_id}, sequence {sequence}")]
    NotFound {
        /// Conversation that was searched
        conversation_id: u128,
        /// Sequence that was not found
        sequence: u64,
    },

    /// Attempt to store a key for an epoch whose key was already expired.
    ///
    /// Deleted keys stay deleted: re-importing one would undo forward secrecy.
    #[error("epoch key tombstoned: conversation {conversation_id}, epoch {epoch}")]
    Tombstoned {
        /// Conversation of the key
        conversation_id: u128,
        /// Epoch of the key
        epoch: u64,
    },

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Sealed key material failed to open under the device master key
    #[error("sealing error: {0}")]
    Sealing(String),

    /// I/O error (file system, database, keychain)
    #[error("I/O error: {0}")]
    Io(String),
}

impl StorageError {
    /// Returns true if this error may succeed on retry.
    ///
    /// Only I/O failures are transient. A corrupt record or a tombstone will
    /// fail the same way every time.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<lockstep_crypto::CryptoError> for StorageError {
    fn from(err: lockstep_crypto::CryptoError) -> Self {
        Self::Sealing(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_io_is_transient() {
        assert!(StorageError::Io("disk".into()).is_transient());
        assert!(!StorageError::Serialization("cbor".into()).is_transient());
        assert!(!StorageError::Tombstoned { conversation_id: 1, epoch: 2 }.is_transient());
        assert!(!StorageError::Sealing("tag".into()).is_transient());
    }
}
