//! Contracts with the messaging server.
//!
//! Two consumed interfaces: a pull API for history pages (initial load and
//! gap recovery) and a real-time stream of [`MessageEvent`]s.

use async_trait::async_trait;
use lockstep_core::message::{ConversationId, Message};

use crate::error::HistoryError;

/// Resume position in a conversation's history.
///
/// Cursors are positional: `Cursor(n)` means "everything after sequence
/// `n`". A missing cursor means "from the beginning".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor(pub u64);

impl Cursor {
    /// Cursor just past `message`.
    pub fn after(message: &Message) -> Self {
        Self(message.sequence)
    }
}

/// One page of history, ascending by sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryPage {
    /// Messages in the page
    pub messages: Vec<Message>,
    /// Where the next page starts; `None` when the server has nothing more
    pub cursor: Option<Cursor>,
}

/// A message pushed over the real-time stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    /// Resume position after this event
    pub cursor: Cursor,
    /// The message
    pub message: Message,
}

/// Message history pull API.
#[async_trait]
pub trait HistoryApi: Send + Sync + 'static {
    /// Up to `limit` messages of `conversation_id` after `since`.
    async fn get_messages(
        &self,
        conversation_id: ConversationId,
        limit: usize,
        since: Option<Cursor>,
    ) -> Result<HistoryPage, HistoryError>;
}

#[async_trait]
impl<T: HistoryApi> HistoryApi for std::sync::Arc<T> {
    async fn get_messages(
        &self,
        conversation_id: ConversationId,
        limit: usize,
        since: Option<Cursor>,
    ) -> Result<HistoryPage, HistoryError> {
        (**self).get_messages(conversation_id, limit, since).await
    }
}
