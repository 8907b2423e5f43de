//! Message data model.
//!
//! A [`Message`] is what the server relays and what the device persists:
//! ciphertext plus ordering metadata. Plaintext never appears here.

use serde::{Deserialize, Serialize};

/// Conversation (MLS group) identifier.
pub type ConversationId = u128;

/// Server-assigned message identifier.
pub type MessageId = u128;

/// Group member identifier.
pub type MemberId = u64;

/// Local processing state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingState {
    /// Received but held back until earlier sequences arrive.
    Buffered,
    /// Released in order to the consumer.
    Delivered,
    /// Released in order, but decryption failed permanently.
    Failed,
}

impl ProcessingState {
    /// Whether the message has passed the ordering barrier.
    pub fn is_processed(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

/// An encrypted group message with its ordering metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned id
    pub id: MessageId,
    /// Conversation the message belongs to
    pub conversation_id: ConversationId,
    /// Sending member
    pub sender: MemberId,
    /// MLS epoch the message was sealed under
    pub epoch: u64,
    /// Conversation-wide sequence number. Never resets across epochs.
    pub sequence: u64,
    /// Sealed envelope bytes
    pub ciphertext: Vec<u8>,
    /// Local processing state
    pub state: ProcessingState,
    /// Set when earlier sequences were skipped because the server no longer
    /// holds them
    pub gap_before: bool,
    /// Wall-clock seconds at which this device first saw the message
    pub received_at_secs: u64,
}

impl Message {
    /// Delivery order key. Sequences are conversation-wide, so ordering by
    /// sequence is also ordering by `(epoch, sequence)`.
    pub fn order_key(&self) -> (u64, u64) {
        (self.epoch, self.sequence)
    }
}
