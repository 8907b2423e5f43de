//! Ordered Delivery Buffer.
//!
//! Holds messages that arrive ahead of a missing sequence and releases them
//! only in contiguous sequence order. One [`DeliveryBuffer`] per conversation;
//! [`OrderedDelivery`] shards them behind per-conversation locks so traffic in
//! one conversation never waits on another.
//!
//! # Invariants
//!
//! - Released sequences are strictly increasing and contiguous, except where
//!   a gap is skipped explicitly (the next message carries `gap_before`).
//! - A sequence below `next_expected` is a duplicate and is never released
//!   again.
//! - After a drain, the gap timer runs iff messages are still held.

use std::{
    collections::{BTreeMap, HashMap},
    ops::{RangeInclusive, Sub},
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use crate::message::{ConversationId, Message, ProcessingState};

/// Default time a gap may stay open before recovery is forced.
pub const DEFAULT_GAP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Result of submitting one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The message is next in line and can be released.
    Ready,
    /// The message arrived ahead of a gap and is held back.
    Buffered {
        /// Sequences still missing before this buffer can drain
        missing: (u64, u64),
        /// True if this submission opened the gap
        gap_opened: bool,
    },
    /// Already released, or already held. Nothing changes.
    Duplicate,
}

/// Ordering state for one conversation.
#[derive(Debug)]
pub struct DeliveryBuffer<I> {
    conversation_id: ConversationId,
    next_expected: u64,
    pending: BTreeMap<u64, Message>,
    gap_started_at: Option<I>,
    gap_timeout: Duration,
}

impl<I> DeliveryBuffer<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Empty buffer expecting `next_expected` first.
    pub fn new(conversation_id: ConversationId, next_expected: u64, gap_timeout: Duration) -> Self {
        Self {
            conversation_id,
            next_expected,
            pending: BTreeMap::new(),
            gap_started_at: None,
            gap_timeout,
        }
    }

    /// Conversation this buffer orders.
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Next sequence that will be released.
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Number of held messages.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Sequences currently held, ascending.
    pub fn pending_sequences(&self) -> Vec<u64> {
        self.pending.keys().copied().collect()
    }

    /// Offer a message. Does not release anything; see
    /// [`Self::get_processable`].
    pub fn submit(&mut self, mut message: Message, now: I) -> SubmitOutcome {
        debug_assert_eq!(message.conversation_id, self.conversation_id);

        let sequence = message.sequence;
        if sequence < self.next_expected || self.pending.contains_key(&sequence) {
            return SubmitOutcome::Duplicate;
        }

        message.state = ProcessingState::Buffered;
        self.pending.insert(sequence, message);

        if sequence == self.next_expected {
            return SubmitOutcome::Ready;
        }

        let Some(missing) = self.first_hole() else {
            return SubmitOutcome::Ready;
        };
        let gap_opened = self.gap_started_at.is_none();
        if gap_opened {
            self.gap_started_at = Some(now);
        }
        SubmitOutcome::Buffered { missing, gap_opened }
    }

    /// Drain the contiguous run starting at `next_expected`.
    ///
    /// Released messages come back in ascending order with state
    /// `Delivered`. If messages remain held, the gap timer restarts at `now`;
    /// otherwise it is cleared.
    pub fn get_processable(&mut self, now: I) -> Vec<Message> {
        let mut released = Vec::new();
        while let Some(mut message) = self.pending.remove(&self.next_expected) {
            message.state = ProcessingState::Delivered;
            released.push(message);
            self.next_expected = self.next_expected.saturating_add(1);
        }

        if self.pending.is_empty() {
            self.gap_started_at = None;
        } else if !released.is_empty() || self.gap_started_at.is_none() {
            self.gap_started_at = Some(now);
        }

        debug_assert!(released.windows(2).all(|w| w[0].sequence + 1 == w[1].sequence));
        released
    }

    /// Drop every held message. `next_expected` is kept, so anything that
    /// was already released can never be released again.
    pub fn clear(&mut self) -> Vec<Message> {
        self.gap_started_at = None;
        std::mem::take(&mut self.pending).into_values().collect()
    }

    /// True once a gap has stayed open for the full timeout.
    pub fn has_gap_timeout(&self, now: I) -> bool {
        self.gap_started_at
            .is_some_and(|started| now >= started && now - started >= self.gap_timeout)
    }

    /// How long the current gap has been open.
    pub fn gap_age(&self, now: I) -> Option<Duration> {
        self.gap_started_at.filter(|started| now >= *started).map(|started| now - started)
    }

    /// Missing sequences between `next_expected` and the first held message.
    pub fn missing_range(&self) -> Option<RangeInclusive<u64>> {
        let (&first, _) = self.pending.first_key_value()?;
        if first <= self.next_expected {
            return None;
        }
        Some(self.next_expected..=first - 1)
    }

    /// Give up on the current gap: jump to the first held message and mark
    /// it `gap_before`. Returns the released run, like
    /// [`Self::get_processable`].
    pub fn skip_gap(&mut self, now: I) -> Vec<Message> {
        let Some(mut entry) = self.pending.first_entry() else {
            return Vec::new();
        };
        if *entry.key() > self.next_expected {
            entry.get_mut().gap_before = true;
            self.next_expected = *entry.key();
        }
        self.get_processable(now)
    }

    /// Restart ordering at `next_expected`, dropping held messages below it.
    pub fn reset_to(&mut self, next_expected: u64) {
        self.next_expected = next_expected;
        self.pending.retain(|&sequence, _| sequence >= next_expected);
        if self.pending.is_empty() {
            self.gap_started_at = None;
        }
    }

    /// First run of missing sequences after the contiguous prefix.
    fn first_hole(&self) -> Option<(u64, u64)> {
        let mut cursor = self.next_expected;
        while self.pending.contains_key(&cursor) {
            cursor = cursor.checked_add(1)?;
        }
        let (&next_held, _) = self.pending.range(cursor..).next()?;
        Some((cursor, next_held - 1))
    }
}

/// Outcome of [`OrderedDelivery::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReport {
    /// What happened to the submitted message
    pub outcome: SubmitOutcome,
    /// Messages released by this submission, in order
    pub released: Vec<Message>,
}

/// Point-in-time view of one conversation's buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferStatus {
    /// Next sequence to release
    pub next_expected: u64,
    /// Held sequences, ascending
    pub pending: Vec<u64>,
    /// Age of the open gap
    pub gap_age: Option<Duration>,
}

type SharedBuffer<I> = Arc<Mutex<DeliveryBuffer<I>>>;

/// All conversations' buffers, each behind its own lock.
///
/// The outer `RwLock` is only held to find or insert a buffer, never while a
/// buffer is mutated.
#[derive(Debug)]
pub struct OrderedDelivery<I> {
    conversations: RwLock<HashMap<ConversationId, SharedBuffer<I>>>,
    gap_timeout: Duration,
    baseline: u64,
}

impl<I> OrderedDelivery<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// New set of buffers. Conversations seen for the first time expect
    /// `baseline` as their first sequence unless [`Self::open`] says otherwise.
    pub fn new(gap_timeout: Duration, baseline: u64) -> Self {
        Self { conversations: RwLock::new(HashMap::new()), gap_timeout, baseline }
    }

    /// Create or reset a conversation's buffer at `next_expected`.
    pub fn open(&self, conversation_id: ConversationId, next_expected: u64) {
        let buffer = self.buffer(conversation_id);
        lock(&buffer).reset_to(next_expected);
    }

    /// Whether the conversation has a buffer.
    pub fn contains(&self, conversation_id: ConversationId) -> bool {
        self.conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&conversation_id)
    }

    /// Submit and drain in one step, without an emission hook.
    pub fn submit(&self, message: Message, now: I) -> SubmitReport {
        self.submit_with(message, now, |_| {})
    }

    /// Submit a message and release whatever became contiguous.
    ///
    /// `emit` runs while the conversation's lock is held, so two concurrent
    /// callers can never hand released runs downstream out of order. It must
    /// not block.
    pub fn submit_with(
        &self,
        message: Message,
        now: I,
        emit: impl FnOnce(&[Message]),
    ) -> SubmitReport {
        let buffer = self.buffer(message.conversation_id);
        let mut guard = lock(&buffer);
        let outcome = guard.submit(message, now);
        let released = match outcome {
            SubmitOutcome::Duplicate => Vec::new(),
            _ => guard.get_processable(now),
        };
        if !released.is_empty() {
            emit(&released);
        }
        SubmitReport { outcome, released }
    }

    /// Submit many messages for one conversation under a single lock.
    ///
    /// Messages are offered in ascending sequence order; the released run is
    /// emitted once.
    pub fn submit_batch_with(
        &self,
        conversation_id: ConversationId,
        mut messages: Vec<Message>,
        now: I,
        emit: impl FnOnce(&[Message]),
    ) -> Vec<Message> {
        messages.retain(|m| m.conversation_id == conversation_id);
        messages.sort_by_key(Message::order_key);

        let buffer = self.buffer(conversation_id);
        let mut guard = lock(&buffer);
        for message in messages {
            guard.submit(message, now);
        }
        let released = guard.get_processable(now);
        if !released.is_empty() {
            emit(&released);
        }
        released
    }

    /// Release the contiguous run of a conversation, if any.
    pub fn get_processable(&self, conversation_id: ConversationId, now: I) -> Vec<Message> {
        match self.existing(conversation_id) {
            Some(buffer) => lock(&buffer).get_processable(now),
            None => Vec::new(),
        }
    }

    /// Drop the held messages of a conversation.
    pub fn clear_buffer(&self, conversation_id: ConversationId) -> Vec<Message> {
        match self.existing(conversation_id) {
            Some(buffer) => lock(&buffer).clear(),
            None => Vec::new(),
        }
    }

    /// Skip the open gap of a conversation and release what follows it.
    pub fn skip_gap_with(
        &self,
        conversation_id: ConversationId,
        now: I,
        emit: impl FnOnce(&[Message]),
    ) -> Vec<Message> {
        let Some(buffer) = self.existing(conversation_id) else {
            return Vec::new();
        };
        let mut guard = lock(&buffer);
        let released = guard.skip_gap(now);
        if !released.is_empty() {
            emit(&released);
        }
        released
    }

    /// Whether a conversation's gap has outlived the timeout.
    pub fn has_gap_timeout(&self, conversation_id: ConversationId, now: I) -> bool {
        self.existing(conversation_id).is_some_and(|buffer| lock(&buffer).has_gap_timeout(now))
    }

    /// Every conversation whose gap has outlived the timeout.
    pub fn timed_out(&self, now: I) -> Vec<ConversationId> {
        let buffers: Vec<(ConversationId, SharedBuffer<I>)> = self
            .conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, buffer)| (*id, Arc::clone(buffer)))
            .collect();

        buffers
            .into_iter()
            .filter(|(_, buffer)| lock(buffer).has_gap_timeout(now))
            .map(|(id, _)| id)
            .collect()
    }

    /// Missing range of a conversation's open gap.
    pub fn missing_range(&self, conversation_id: ConversationId) -> Option<RangeInclusive<u64>> {
        self.existing(conversation_id).and_then(|buffer| lock(&buffer).missing_range())
    }

    /// Snapshot of a conversation's buffer.
    pub fn status(&self, conversation_id: ConversationId, now: I) -> Option<BufferStatus> {
        self.existing(conversation_id).map(|buffer| {
            let guard = lock(&buffer);
            BufferStatus {
                next_expected: guard.next_expected(),
                pending: guard.pending_sequences(),
                gap_age: guard.gap_age(now),
            }
        })
    }

    fn existing(&self, conversation_id: ConversationId) -> Option<SharedBuffer<I>> {
        self.conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&conversation_id)
            .map(Arc::clone)
    }

    fn buffer(&self, conversation_id: ConversationId) -> SharedBuffer<I> {
        if let Some(buffer) = self.existing(conversation_id) {
            return buffer;
        }
        let mut conversations = self.conversations.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(conversations.entry(conversation_id).or_insert_with(|| {
            Arc::new(Mutex::new(DeliveryBuffer::new(
                conversation_id,
                self.baseline,
                self.gap_timeout,
            )))
        }))
    }
}

fn lock<I>(buffer: &SharedBuffer<I>) -> std::sync::MutexGuard<'_, DeliveryBuffer<I>> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}
