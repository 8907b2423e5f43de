//! Error types for cryptographic operations

use thiserror::Error;

/// Errors from sealing and opening operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD authentication failed (wrong key or tampered data)
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Reason for decryption failure
        reason: String,
    },

    /// Envelope is shorter than its fixed header plus tag
    #[error("envelope truncated: need at least {minimum} bytes, got {actual}")]
    Truncated {
        /// Minimum number of bytes required
        minimum: usize,
        /// Actual number of bytes received
        actual: usize,
    },

    /// Envelope carries a version this build does not understand
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    /// Envelope header disagrees with the message metadata it was stored with
    #[error("envelope header mismatch: expected epoch {expected_epoch} seq {expected_sequence}, got epoch {epoch} seq {sequence}")]
    HeaderMismatch {
        /// Epoch recorded in message metadata
        expected_epoch: u64,
        /// Sequence recorded in message metadata
        expected_sequence: u64,
        /// Epoch found in the envelope
        epoch: u64,
        /// Sequence found in the envelope
        sequence: u64,
    },

    /// Invalid key material length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length
        expected: usize,
        /// Actual key length
        actual: usize,
    },
}

impl CryptoError {
    /// Returns true if this error is fatal for the message it was raised for.
    ///
    /// Every crypto failure is deterministic: retrying with the same key and
    /// bytes yields the same result.
    pub fn is_fatal(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = CryptoError::HeaderMismatch {
            expected_epoch: 3,
            expected_sequence: 10,
            epoch: 4,
            sequence: 10,
        };
        let text = err.to_string();
        assert!(text.contains("epoch 3"));
        assert!(text.contains("epoch 4"));
    }

    #[test]
    fn all_errors_are_fatal() {
        assert!(CryptoError::UnsupportedVersion(9).is_fatal());
        assert!(CryptoError::Truncated { minimum: 57, actual: 3 }.is_fatal());
    }
}
