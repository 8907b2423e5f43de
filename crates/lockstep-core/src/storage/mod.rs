//! Storage abstraction for the message pipeline
//!
//! Two contracts: the Secure Key Store ([`KeyStore`]) holding epoch secrets,
//! and the Durable Message Store ([`MessageStore`]) holding ciphertext and
//! ordering metadata. Both are synchronous; drivers move calls onto blocking
//! threads when the backend does disk I/O.
//!
//! Neither contract has a way to persist plaintext.

mod chaotic;
mod error;
mod memory;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
use lockstep_crypto::EpochSecret;
pub use memory::MemoryStorage;
use serde::{Deserialize, Serialize};

use crate::message::{ConversationId, Message, ProcessingState};

/// Metadata about a stored epoch key. Never carries the secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    /// Conversation the key belongs to
    pub conversation_id: ConversationId,
    /// MLS epoch
    pub epoch: u64,
    /// Wall-clock seconds when the key was stored
    pub created_at_secs: u64,
}

/// Epoch secret plus its metadata, as loaded from the key store.
#[derive(Debug, Clone)]
pub struct EpochKey {
    /// Key metadata
    pub metadata: KeyMetadata,
    /// The exported epoch secret
    pub secret: EpochSecret,
}

/// Record of a key that was deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    /// When the key was originally created
    pub created_at_secs: u64,
    /// When the key was deleted
    pub deleted_at_secs: u64,
}

/// Secure Key Store.
///
/// Device-bound storage for epoch secrets. Implementations must never export
/// keys off the device and must make [`KeyStore::expire_key`] atomic.
///
/// Must be Clone (shared between the pipeline and the cleanup scheduler),
/// Send + Sync, and synchronous. Clones access the same underlying storage.
pub trait KeyStore: Clone + Send + Sync + 'static {
    /// Store the secret for `(conversation, epoch)`.
    ///
    /// Overwrites an existing live key for the same epoch but keeps its
    /// original creation time. Fails with [`StorageError::Tombstoned`] if the
    /// key was deleted before.
    fn store_key(
        &self,
        conversation_id: ConversationId,
        epoch: u64,
        secret: &EpochSecret,
        created_at_secs: u64,
    ) -> Result<(), StorageError>;

    /// Load a live key. `None` if never stored or already deleted.
    fn load_key(
        &self,
        conversation_id: ConversationId,
        epoch: u64,
    ) -> Result<Option<EpochKey>, StorageError>;

    /// Metadata of every live key, across all conversations.
    fn list_keys(&self) -> Result<Vec<KeyMetadata>, StorageError>;

    /// Atomically delete the key if it was created strictly before
    /// `cutoff_secs`, leaving a tombstone stamped `now_secs`.
    ///
    /// Returns true if the key was deleted. The check and the delete happen
    /// under one lock or transaction, so a concurrent `load_key` either sees
    /// the live key or sees nothing.
    fn expire_key(
        &self,
        conversation_id: ConversationId,
        epoch: u64,
        cutoff_secs: u64,
        now_secs: u64,
    ) -> Result<bool, StorageError>;

    /// Tombstone of a deleted key, if any.
    fn tombstone(
        &self,
        conversation_id: ConversationId,
        epoch: u64,
    ) -> Result<Option<Tombstone>, StorageError>;
}

/// Durable Message Store.
///
/// Ciphertext and metadata only. Must be Clone, Send + Sync and synchronous.
pub trait MessageStore: Clone + Send + Sync + 'static {
    /// Persist a message.
    ///
    /// Idempotent on `(conversation, sequence)`: storing a sequence that is
    /// already present returns `Ok(false)` and leaves the stored copy,
    /// including its state, untouched.
    fn store_message(&self, message: &Message) -> Result<bool, StorageError>;

    /// Load one message.
    fn load_message(
        &self,
        conversation_id: ConversationId,
        sequence: u64,
    ) -> Result<Option<Message>, StorageError>;

    /// Load up to `limit` messages with sequence strictly greater than
    /// `after` (or from the start when `None`), in ascending sequence order.
    fn load_messages(
        &self,
        conversation_id: ConversationId,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError>;

    /// Update the processing state and gap flag of a stored message.
    ///
    /// Fails with [`StorageError::NotFound`] if the message was never stored.
    fn update_state(
        &self,
        conversation_id: ConversationId,
        sequence: u64,
        state: ProcessingState,
        gap_before: bool,
    ) -> Result<(), StorageError>;

    /// Highest sequence already past the ordering barrier (`Delivered` or
    /// `Failed`). `None` for a conversation with nothing processed.
    fn last_processed(&self, conversation_id: ConversationId)
    -> Result<Option<Message>, StorageError>;

    /// Every conversation with at least one stored message. Order is not
    /// guaranteed.
    fn list_conversations(&self) -> Result<Vec<ConversationId>, StorageError>;
}
