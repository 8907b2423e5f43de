//! Sealing of key material at rest under the device master key.
//!
//! Output layout is `nonce:[u8; 24] | ciphertext + tag`. The caller passes the
//! record's storage key as associated data so a sealed blob cannot be moved
//! to another record.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use zeroize::Zeroizing;

use crate::{CryptoError, MasterKey, POLY1305_TAG_SIZE};

/// Size of the random nonce prefix of a sealed blob
pub const AT_REST_NONCE_SIZE: usize = 24;

/// Seal `plaintext` under the master key.
pub fn seal_at_rest(
    master: &MasterKey,
    associated_data: &[u8],
    plaintext: &[u8],
    nonce: [u8; AT_REST_NONCE_SIZE],
) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(master.as_bytes().into());
    let Ok(ciphertext) = cipher
        .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad: associated_data })
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    let mut sealed = Vec::with_capacity(AT_REST_NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    sealed
}

/// Open a blob produced by [`seal_at_rest`].
pub fn open_at_rest(
    master: &MasterKey,
    associated_data: &[u8],
    sealed: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let minimum = AT_REST_NONCE_SIZE + POLY1305_TAG_SIZE;
    if sealed.len() < minimum {
        return Err(CryptoError::Truncated { minimum, actual: sealed.len() });
    }

    let (nonce, ciphertext) = sealed.split_at(AT_REST_NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(master.as_bytes().into());
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad: associated_data })
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::DecryptionFailed {
            reason: "at-rest authentication failed".to_string(),
        })
}
