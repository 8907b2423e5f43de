//! Application message sealing using `XChaCha20-Poly1305`
//!
//! All functions are pure - random bytes must be provided by the caller.
//!
//! # Wire format
//!
//! ```text
//! version:u8 | epoch:u64 BE | sequence:u64 BE | nonce:[u8; 24] | ciphertext + tag
//! ```
//!
//! The header (version, epoch, sequence) is authenticated as associated data
//! together with the conversation id, so an envelope cannot be replayed into
//! another conversation or position.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};

use crate::{CryptoError, EpochSecret, derive_message_key};

/// Current envelope version
pub const ENVELOPE_VERSION: u8 = 1;

/// Size of the random suffix in the nonce (8 bytes)
pub const NONCE_RANDOM_SIZE: usize = 8;

/// Size of the `XChaCha20` nonce
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag size (16 bytes)
pub const POLY1305_TAG_SIZE: usize = 16;

/// Fixed header size: version + epoch + sequence + nonce
pub const ENVELOPE_HEADER_SIZE: usize = 1 + 8 + 8 + NONCE_SIZE;

/// A parsed envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// The MLS epoch this message was sealed under
    pub epoch: u64,
    /// Conversation-wide sequence number
    pub sequence: u64,
    /// The 24-byte `XChaCha20` nonce
    pub nonce: [u8; NONCE_SIZE],
    /// The ciphertext including 16-byte Poly1305 tag
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Encode to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_SIZE + self.ciphertext.len());
        out.push(ENVELOPE_VERSION);
        out.extend_from_slice(&self.epoch.to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Decode from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let minimum = ENVELOPE_HEADER_SIZE + POLY1305_TAG_SIZE;
        if bytes.len() < minimum {
            return Err(CryptoError::Truncated { minimum, actual: bytes.len() });
        }

        let version = bytes[0];
        if version != ENVELOPE_VERSION {
            return Err(CryptoError::UnsupportedVersion(version));
        }

        let mut epoch = [0u8; 8];
        epoch.copy_from_slice(&bytes[1..9]);
        let mut sequence = [0u8; 8];
        sequence.copy_from_slice(&bytes[9..17]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[17..ENVELOPE_HEADER_SIZE]);

        Ok(Self {
            epoch: u64::from_be_bytes(epoch),
            sequence: u64::from_be_bytes(sequence),
            nonce,
            ciphertext: bytes[ENVELOPE_HEADER_SIZE..].to_vec(),
        })
    }

    /// Plaintext length (ciphertext length minus authentication tag).
    pub fn plaintext_len(&self) -> usize {
        self.ciphertext.len().saturating_sub(POLY1305_TAG_SIZE)
    }
}

/// Seal a message and return its wire bytes.
///
/// Caller MUST provide cryptographically secure random bytes in production.
pub fn seal_message(
    plaintext: &[u8],
    epoch_secret: &EpochSecret,
    conversation_id: u128,
    epoch: u64,
    sequence: u64,
    random_suffix: [u8; NONCE_RANDOM_SIZE],
) -> Vec<u8> {
    let key = derive_message_key(epoch_secret, conversation_id, epoch, sequence);
    let nonce = build_nonce(epoch, sequence, random_suffix);
    let aad = associated_data(conversation_id, epoch, sequence);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let Ok(ciphertext) =
        cipher.encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    Envelope { epoch, sequence, nonce, ciphertext }.to_bytes()
}

/// Open wire bytes sealed by [`seal_message`].
///
/// `epoch` and `sequence` are the values the message was stored with; an
/// envelope whose header disagrees is rejected before any decryption.
pub fn open_message(
    wire: &[u8],
    epoch_secret: &EpochSecret,
    conversation_id: u128,
    epoch: u64,
    sequence: u64,
) -> Result<Vec<u8>, CryptoError> {
    let envelope = Envelope::from_bytes(wire)?;
    if envelope.epoch != epoch || envelope.sequence != sequence {
        return Err(CryptoError::HeaderMismatch {
            expected_epoch: epoch,
            expected_sequence: sequence,
            epoch: envelope.epoch,
            sequence: envelope.sequence,
        });
    }

    let key = derive_message_key(epoch_secret, conversation_id, epoch, sequence);
    let aad = associated_data(conversation_id, epoch, sequence);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    cipher
        .decrypt(
            XNonce::from_slice(&envelope.nonce),
            Payload { msg: envelope.ciphertext.as_slice(), aad: &aad },
        )
        .map_err(|_| CryptoError::DecryptionFailed { reason: "authentication failed".to_string() })
}

/// Build a 24-byte nonce for `XChaCha20`.
///
/// Structure:
/// - bytes 0-7: epoch (big-endian)
/// - bytes 8-15: sequence (big-endian)
/// - bytes 16-23: random suffix (caller-provided)
fn build_nonce(epoch: u64, sequence: u64, random_suffix: [u8; NONCE_RANDOM_SIZE]) -> [u8; 24] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[0..8].copy_from_slice(&epoch.to_be_bytes());
    nonce[8..16].copy_from_slice(&sequence.to_be_bytes());
    nonce[16..24].copy_from_slice(&random_suffix);
    nonce
}

fn associated_data(conversation_id: u128, epoch: u64, sequence: u64) -> [u8; 33] {
    let mut aad = [0u8; 33];
    aad[0..16].copy_from_slice(&conversation_id.to_be_bytes());
    aad[16] = ENVELOPE_VERSION;
    aad[17..25].copy_from_slice(&epoch.to_be_bytes());
    aad[25..33].copy_from_slice(&sequence.to_be_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EPOCH_SECRET_SIZE;

    fn secret(byte: u8) -> EpochSecret {
        EpochSecret::new([byte; EPOCH_SECRET_SIZE])
    }

    #[test]
    fn seal_open_roundtrip() {
        let wire = seal_message(b"Hello, World!", &secret(1), 9, 2, 17, [0xAB; 8]);
        let plaintext = open_message(&wire, &secret(1), 9, 2, 17).unwrap();
        assert_eq!(plaintext, b"Hello, World!");
    }

    #[test]
    fn empty_message_roundtrip() {
        let wire = seal_message(b"", &secret(1), 9, 0, 1, [0x00; 8]);
        assert_eq!(wire.len(), ENVELOPE_HEADER_SIZE + POLY1305_TAG_SIZE);
        assert_eq!(open_message(&wire, &secret(1), 9, 0, 1).unwrap(), b"");
    }

    #[test]
    fn wrong_secret_fails_authentication() {
        let wire = seal_message(b"secret message", &secret(1), 9, 2, 17, [0x00; 8]);
        let result = open_message(&wire, &secret(2), 9, 2, 17);
        assert!(matches!(
            result,
            Err(CryptoError::DecryptionFailed { reason }) if reason.contains("authentication")
        ));
    }

    #[test]
    fn other_conversation_fails_authentication() {
        let wire = seal_message(b"secret message", &secret(1), 9, 2, 17, [0x00; 8]);
        assert!(open_message(&wire, &secret(1), 10, 2, 17).is_err());
    }

    #[test]
    fn header_mismatch_is_rejected_before_decrypt() {
        let wire = seal_message(b"x", &secret(1), 9, 2, 17, [0x00; 8]);
        let result = open_message(&wire, &secret(1), 9, 2, 18);
        assert!(matches!(result, Err(CryptoError::HeaderMismatch { sequence: 17, .. })));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let mut wire = seal_message(b"original", &secret(1), 9, 2, 17, [0x00; 8]);
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        assert!(open_message(&wire, &secret(1), 9, 2, 17).is_err());
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        let result = Envelope::from_bytes(&[ENVELOPE_VERSION; 10]);
        assert!(matches!(result, Err(CryptoError::Truncated { actual: 10, .. })));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut wire = seal_message(b"x", &secret(1), 9, 2, 17, [0x00; 8]);
        wire[0] = 7;
        assert_eq!(Envelope::from_bytes(&wire), Err(CryptoError::UnsupportedVersion(7)));
    }

    #[test]
    fn nonce_structure() {
        let nonce = build_nonce(0x0102_0304_0506_0708, 0x090A_0B0C_0D0E_0F10, [0xAB; 8]);
        assert_eq!(&nonce[0..8], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&nonce[8..16], &[0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10]);
        assert_eq!(&nonce[16..24], &[0xAB; 8]);
    }

    #[test]
    fn header_is_readable_without_key() {
        let wire = seal_message(b"hello", &secret(1), 9, 42, 1000, [0x01; 8]);
        let envelope = Envelope::from_bytes(&wire).unwrap();
        assert_eq!(envelope.epoch, 42);
        assert_eq!(envelope.sequence, 1000);
        assert_eq!(envelope.plaintext_len(), 5);
    }
}
