//! Key material types and per-message key derivation.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CryptoError;

/// Size of an exported MLS epoch secret.
pub const EPOCH_SECRET_SIZE: usize = 32;

/// Label used for message key derivation
const MESSAGE_KEY_LABEL: &[u8] = b"lockstepMessageV1";

/// Secret exported from an MLS epoch.
///
/// Zeroized on drop. `Debug` never prints the bytes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EpochSecret([u8; EPOCH_SECRET_SIZE]);

impl EpochSecret {
    /// Wrap raw secret bytes.
    pub fn new(bytes: [u8; EPOCH_SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build from a slice, failing if it is not exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; EPOCH_SECRET_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: EPOCH_SECRET_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self(array))
    }

    /// Raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; EPOCH_SECRET_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for EpochSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EpochSecret([REDACTED])")
    }
}

impl PartialEq for EpochSecret {
    fn eq(&self, other: &Self) -> bool {
        // Only used by tests; not constant-time.
        self.0 == other.0
    }
}

impl Eq for EpochSecret {}

/// One-time key for a single message.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MessageKey([u8; 32]);

impl MessageKey {
    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MessageKey([REDACTED])")
    }
}

/// Device-bound key that seals epoch secrets at rest.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    /// Wrap raw key bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Build from a slice, failing if it is not exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength { expected: 32, actual: bytes.len() })?;
        Ok(Self(array))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Derive the key for one message from its epoch secret.
///
/// The result is unique per (conversation, epoch, sequence). Deterministic:
/// sender and receiver derive the same key independently.
pub fn derive_message_key(
    epoch_secret: &EpochSecret,
    conversation_id: u128,
    epoch: u64,
    sequence: u64,
) -> MessageKey {
    let hkdf = Hkdf::<Sha256>::new(None, epoch_secret.as_bytes());

    // label || conversation_id || epoch || sequence
    let mut info = Vec::with_capacity(MESSAGE_KEY_LABEL.len() + 16 + 8 + 8);
    info.extend_from_slice(MESSAGE_KEY_LABEL);
    info.extend_from_slice(&conversation_id.to_be_bytes());
    info.extend_from_slice(&epoch.to_be_bytes());
    info.extend_from_slice(&sequence.to_be_bytes());

    let mut key = [0u8; 32];
    let Ok(()) = hkdf.expand(&info, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    MessageKey(key)
}
