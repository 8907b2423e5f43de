//! Lockstep Cryptographic Primitives
//!
//! Pure functions with deterministic outputs. Callers provide random bytes so
//! that tests and simulations stay reproducible.
//!
//! # Key Lifecycle
//!
//! Every MLS epoch exports one epoch secret. The secret is kept in the
//! device's key store for as long as the retention policy allows, and every
//! application message of that epoch is sealed under a key derived from it.
//!
//! ```text
//! MLS Epoch Secret ──(retention window)──► deleted + tombstone
//!        │
//!        ▼
//! HKDF(conversation, epoch, sequence) → Message Key
//!        │
//!        ▼
//! XChaCha20-Poly1305 → Envelope
//! ```
//!
//! Derivation is per message rather than a ratchet so that any retained epoch
//! secret can open any message of that epoch, in any order, at any time. Once
//! the epoch secret is deleted, none of the messages of that epoch can be
//! opened again on this device.
//!
//! # At Rest
//!
//! Epoch secrets written to durable storage are sealed under a 32-byte device
//! master key with the record's storage key as associated data, so a copied
//! database file is useless without the device keychain.

#![forbid(unsafe_code)]

mod at_rest;
mod envelope;
mod error;
mod keys;

pub use at_rest::{AT_REST_NONCE_SIZE, open_at_rest, seal_at_rest};
pub use envelope::{
    ENVELOPE_HEADER_SIZE, ENVELOPE_VERSION, Envelope, NONCE_RANDOM_SIZE, NONCE_SIZE,
    POLY1305_TAG_SIZE, open_message, seal_message,
};
pub use error::CryptoError;
pub use keys::{EPOCH_SECRET_SIZE, EpochSecret, MasterKey, MessageKey, derive_message_key};
