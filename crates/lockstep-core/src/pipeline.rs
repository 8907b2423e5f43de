//! Decryption Pipeline.
//!
//! Lazily turns in-order ciphertext into plaintext for display. Every outcome
//! is a value the UI can render: a [`PlaintextView`] or a
//! [`DisplayableError`] with a stable, human-readable explanation. A failure
//! on one message never affects another.
//!
//! Plaintext is never persisted. Two in-memory caches exist, both gated on
//! the epoch key still being within the retention window:
//!
//! - messages this device sent (their plaintext is known without decrypting)
//! - an opt-in session cache of decrypted plaintext, off by default

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use lockstep_crypto::{CryptoError, EpochSecret, NONCE_RANDOM_SIZE, open_message, seal_message};
use zeroize::Zeroizing;

use crate::{
    env::Environment,
    message::{ConversationId, MemberId, Message, MessageId, ProcessingState},
    retention::{KeyStatus, RetentionPolicyEngine},
    storage::{KeyStore, MessageStore},
};

/// Opens sealed message bytes with an epoch secret.
pub trait MessageDecryptor: Send + Sync + 'static {
    /// Decrypt `message.ciphertext`.
    fn decrypt(&self, secret: &EpochSecret, message: &Message) -> Result<Vec<u8>, CryptoError>;
}

/// Default decryptor for envelopes produced by [`EpochCipher::seal`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EpochCipher;

impl EpochCipher {
    /// Seal `plaintext` for `(conversation, epoch, sequence)`.
    pub fn seal(
        secret: &EpochSecret,
        conversation_id: ConversationId,
        epoch: u64,
        sequence: u64,
        plaintext: &[u8],
        env: &impl Environment,
    ) -> Vec<u8> {
        let mut random = [0u8; NONCE_RANDOM_SIZE];
        env.random_bytes(&mut random);
        seal_message(plaintext, secret, conversation_id, epoch, sequence, random)
    }
}

impl MessageDecryptor for EpochCipher {
    fn decrypt(&self, secret: &EpochSecret, message: &Message) -> Result<Vec<u8>, CryptoError> {
        open_message(
            &message.ciphertext,
            secret,
            message.conversation_id,
            message.epoch,
            message.sequence,
        )
    }
}

/// Why a message cannot be shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayableError {
    /// The epoch key was removed by the retention policy.
    MessageExpired {
        /// How long ago the key crossed the retention window, if known
        expired_for: Option<Duration>,
    },
    /// Decryption failed.
    DecryptionFailed {
        /// Technical reason, for logs and diagnostics
        reason: String,
        /// Whether trying again later may succeed
        retryable: bool,
    },
    /// The message is still held behind missing earlier messages.
    NotYetAvailable,
}

impl DisplayableError {
    /// Text shown in place of the message body.
    pub fn user_message(&self) -> String {
        match self {
            Self::MessageExpired { expired_for: Some(age) } => format!(
                "Message expired {} ago. Its key was removed by your retention setting.",
                humanize(*age)
            ),
            Self::MessageExpired { expired_for: None } => {
                "Message expired. Its key is no longer on this device.".to_string()
            },
            Self::DecryptionFailed { retryable: false, .. } => {
                "This message could not be decrypted.".to_string()
            },
            Self::DecryptionFailed { retryable: true, .. } => {
                "This message can't be decrypted right now. It will be retried.".to_string()
            },
            Self::NotYetAvailable => "Waiting for earlier messages to arrive.".to_string(),
        }
    }

    /// Whether the same message may decrypt on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::MessageExpired { .. } => false,
            Self::DecryptionFailed { retryable, .. } => *retryable,
            Self::NotYetAvailable => true,
        }
    }
}

impl std::fmt::Display for DisplayableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.user_message())
    }
}

fn humanize(age: Duration) -> String {
    let secs = age.as_secs();
    let (amount, unit) = match secs {
        0..60 => return "less than a minute".to_string(),
        60..3_600 => (secs / 60, "minute"),
        3_600..86_400 => (secs / 3_600, "hour"),
        _ => (secs / 86_400, "day"),
    };
    if amount == 1 { format!("1 {unit}") } else { format!("{amount} {unit}s") }
}

/// Where a plaintext came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaintextSource {
    /// Decrypted just now
    Decrypted,
    /// Sent by this device during this session
    SentLocally,
    /// Session plaintext cache
    SessionCache,
}

/// Decrypted message ready for display. Zeroized on drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaintextView {
    /// Message id
    pub message_id: MessageId,
    /// Sending member
    pub sender: MemberId,
    /// Epoch
    pub epoch: u64,
    /// Sequence
    pub sequence: u64,
    /// Earlier messages were skipped
    pub gap_before: bool,
    /// Plaintext bytes
    pub plaintext: Zeroizing<Vec<u8>>,
    /// Where the plaintext came from
    pub source: PlaintextSource,
}

/// Per-message result of a batch decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionResult {
    /// Message id
    pub message_id: MessageId,
    /// Sequence, for ordering
    pub sequence: u64,
    /// Outcome
    pub result: Result<PlaintextView, DisplayableError>,
}

/// Whether decrypted plaintext is kept in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaintextCacheMode {
    /// Decrypt on every request
    #[default]
    Disabled,
    /// Keep up to `capacity` plaintexts in memory for this session only
    SessionOnly {
        /// Maximum cached messages; the oldest entry is evicted first
        capacity: usize,
    },
}

struct CachedPlaintext {
    conversation_id: ConversationId,
    epoch: u64,
    plaintext: Zeroizing<Vec<u8>>,
}

#[derive(Default)]
struct PlaintextCache {
    capacity: usize,
    entries: HashMap<MessageId, CachedPlaintext>,
    order: VecDeque<MessageId>,
}

impl PlaintextCache {
    fn with_capacity(capacity: usize) -> Self {
        Self { capacity, ..Self::default() }
    }

    fn insert(&mut self, message_id: MessageId, entry: CachedPlaintext) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.insert(message_id, entry).is_none() {
            self.order.push_back(message_id);
        }
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else { break };
            self.entries.remove(&oldest);
        }
    }

    fn get(&self, message_id: MessageId) -> Option<&CachedPlaintext> {
        self.entries.get(&message_id)
    }

    fn purge_epoch(&mut self, conversation_id: ConversationId, epoch: u64) {
        self.entries.retain(|_, e| e.conversation_id != conversation_id || e.epoch != epoch);
        let entries = &self.entries;
        self.order.retain(|id| entries.contains_key(id));
    }
}

/// Turns delivered messages into plaintext views.
pub struct DecryptionPipeline<K, M, E, D = EpochCipher> {
    retention: Arc<RetentionPolicyEngine<K, E>>,
    messages: M,
    decryptor: D,
    sent: Mutex<PlaintextCache>,
    session: Option<Mutex<PlaintextCache>>,
}

/// Plaintexts remembered for messages this device sent.
const SENT_CACHE_CAPACITY: usize = 1024;

impl<K, M, E, D> DecryptionPipeline<K, M, E, D>
where
    K: KeyStore,
    M: MessageStore,
    E: Environment,
    D: MessageDecryptor,
{
    /// Pipeline reading keys through `retention` and updating processing
    /// state in `messages`.
    pub fn new(
        retention: Arc<RetentionPolicyEngine<K, E>>,
        messages: M,
        decryptor: D,
        cache_mode: PlaintextCacheMode,
    ) -> Self {
        let session = match cache_mode {
            PlaintextCacheMode::Disabled => None,
            PlaintextCacheMode::SessionOnly { capacity } => {
                Some(Mutex::new(PlaintextCache::with_capacity(capacity)))
            },
        };
        Self {
            retention,
            messages,
            decryptor,
            sent: Mutex::new(PlaintextCache::with_capacity(SENT_CACHE_CAPACITY)),
            session,
        }
    }

    /// Remember the plaintext of a message this device sent, so it renders
    /// without a decrypt round trip.
    pub fn remember_sent(&self, message: &Message, plaintext: &[u8]) {
        lock(&self.sent).insert(message.id, CachedPlaintext {
            conversation_id: message.conversation_id,
            epoch: message.epoch,
            plaintext: Zeroizing::new(plaintext.to_vec()),
        });
    }

    /// Whether messages of `epoch` can still be decrypted.
    ///
    /// A storage failure answers false and is logged.
    pub fn can_decrypt_message(&self, conversation_id: ConversationId, epoch: u64) -> bool {
        self.retention.can_decrypt(conversation_id, epoch).unwrap_or_else(|err| {
            tracing::warn!(conversation_id, epoch, %err, "key lookup failed");
            false
        })
    }

    /// Decrypt one message of `conversation_id`.
    pub fn decrypt_message(
        &self,
        message: &Message,
        conversation_id: ConversationId,
    ) -> Result<PlaintextView, DisplayableError> {
        if message.conversation_id != conversation_id {
            return Err(DisplayableError::DecryptionFailed {
                reason: format!(
                    "message belongs to conversation {}, not {conversation_id}",
                    message.conversation_id
                ),
                retryable: false,
            });
        }
        if message.state == ProcessingState::Buffered {
            return Err(DisplayableError::NotYetAvailable);
        }

        // Sent plaintext outlives a missing key, never a retention expiry
        let status = self.retention.key_status(conversation_id, message.epoch);
        if !matches!(status, Ok(KeyStatus::Expired { .. }))
            && let Some(view) = self.sent_view(message)
        {
            return Ok(view);
        }

        let key = match status {
            Ok(KeyStatus::Live(key)) => key,
            Ok(KeyStatus::Expired { expired_for }) => {
                self.purge_epoch(conversation_id, message.epoch);
                return Err(DisplayableError::MessageExpired { expired_for: Some(expired_for) });
            },
            Ok(KeyStatus::Missing) => {
                tracing::debug!(conversation_id, epoch = message.epoch, "no key for epoch");
                return Err(DisplayableError::MessageExpired { expired_for: None });
            },
            Err(err) => {
                tracing::warn!(conversation_id, epoch = message.epoch, %err, "key lookup failed");
                return Err(DisplayableError::DecryptionFailed {
                    reason: err.to_string(),
                    retryable: err.is_transient(),
                });
            },
        };

        if let Some(view) = self.session_view(message) {
            return Ok(view);
        }

        match self.decryptor.decrypt(&key.secret, message) {
            Ok(plaintext) => {
                let plaintext = Zeroizing::new(plaintext);
                if let Some(session) = &self.session {
                    lock(session).insert(message.id, CachedPlaintext {
                        conversation_id,
                        epoch: message.epoch,
                        plaintext: plaintext.clone(),
                    });
                }
                Ok(view(message, plaintext, PlaintextSource::Decrypted))
            },
            Err(err) => {
                tracing::warn!(
                    conversation_id,
                    epoch = message.epoch,
                    sequence = message.sequence,
                    %err,
                    "message decryption failed"
                );
                self.mark_failed(message);
                Err(DisplayableError::DecryptionFailed { reason: err.to_string(), retryable: false })
            },
        }
    }

    /// Decrypt many messages independently, in ascending sequence order.
    pub fn decrypt_messages(
        &self,
        messages: &[Message],
        conversation_id: ConversationId,
    ) -> Vec<DecryptionResult> {
        let mut ordered: Vec<&Message> = messages.iter().collect();
        ordered.sort_by_key(|m| m.order_key());
        ordered
            .into_iter()
            .map(|message| DecryptionResult {
                message_id: message.id,
                sequence: message.sequence,
                result: self.decrypt_message(message, conversation_id),
            })
            .collect()
    }

    fn sent_view(&self, message: &Message) -> Option<PlaintextView> {
        let guard = lock(&self.sent);
        let entry = guard.get(message.id)?;
        Some(view(message, entry.plaintext.clone(), PlaintextSource::SentLocally))
    }

    fn session_view(&self, message: &Message) -> Option<PlaintextView> {
        let session = self.session.as_ref()?;
        let guard = lock(session);
        let entry = guard.get(message.id)?;
        Some(view(message, entry.plaintext.clone(), PlaintextSource::SessionCache))
    }

    fn purge_epoch(&self, conversation_id: ConversationId, epoch: u64) {
        lock(&self.sent).purge_epoch(conversation_id, epoch);
        if let Some(session) = &self.session {
            lock(session).purge_epoch(conversation_id, epoch);
        }
    }

    fn mark_failed(&self, message: &Message) {
        if message.state == ProcessingState::Failed {
            return;
        }
        if let Err(err) = self.messages.update_state(
            message.conversation_id,
            message.sequence,
            ProcessingState::Failed,
            message.gap_before,
        ) {
            tracing::warn!(
                conversation_id = message.conversation_id,
                sequence = message.sequence,
                %err,
                "failed to persist decryption failure"
            );
        }
    }
}

fn view(message: &Message, plaintext: Zeroizing<Vec<u8>>, source: PlaintextSource) -> PlaintextView {
    PlaintextView {
        message_id: message.id,
        sender: message.sender,
        epoch: message.epoch,
        sequence: message.sequence,
        gap_before: message.gap_before,
        plaintext,
        source,
    }
}

fn lock(cache: &Mutex<PlaintextCache>) -> MutexGuard<'_, PlaintextCache> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        env::test_utils::MockEnv, message::fixtures::message, retention::RetentionWindow,
        storage::MemoryStorage,
    };

    type TestPipeline = DecryptionPipeline<MemoryStorage, MemoryStorage, MockEnv>;

    fn setup(mode: PlaintextCacheMode) -> (TestPipeline, MemoryStorage, MockEnv) {
        let env = MockEnv::new();
        let storage = MemoryStorage::new();
        let retention = Arc::new(RetentionPolicyEngine::new(
            storage.clone(),
            env.clone(),
            RetentionWindow::ONE_DAY,
        ));
        (DecryptionPipeline::new(retention, storage.clone(), EpochCipher, mode), storage, env)
    }

    fn sealed(env: &MockEnv, storage: &MemoryStorage, sequence: u64, text: &[u8]) -> Message {
        let secret = EpochSecret::new([3; 32]);
        let mut msg = message(1, sequence);
        if storage.load_key(1, msg.epoch).unwrap().is_none() {
            storage.store_key(1, msg.epoch, &secret, env.wall_clock_secs()).unwrap();
        }
        msg.ciphertext = EpochCipher::seal(&secret, 1, msg.epoch, sequence, text, env);
        msg.state = ProcessingState::Delivered;
        storage.store_message(&msg).unwrap();
        msg
    }

    #[test]
    fn decrypts_delivered_message() {
        let (pipeline, storage, env) = setup(PlaintextCacheMode::Disabled);
        let msg = sealed(&env, &storage, 5, b"hello");

        let view = pipeline.decrypt_message(&msg, 1).unwrap();
        assert_eq!(view.plaintext.as_slice(), b"hello");
        assert_eq!(view.source, PlaintextSource::Decrypted);
    }

    #[test]
    fn buffered_message_is_not_yet_available() {
        let (pipeline, storage, env) = setup(PlaintextCacheMode::Disabled);
        let mut msg = sealed(&env, &storage, 5, b"hello");
        msg.state = ProcessingState::Buffered;

        assert_eq!(pipeline.decrypt_message(&msg, 1), Err(DisplayableError::NotYetAvailable));
    }

    #[test]
    fn expired_key_yields_message_expired() {
        let (pipeline, storage, env) = setup(PlaintextCacheMode::Disabled);
        let msg = sealed(&env, &storage, 5, b"hello");
        env.advance(Duration::from_secs(86_400 + 2 * 3_600));

        let err = pipeline.decrypt_message(&msg, 1).unwrap_err();
        assert_eq!(err, DisplayableError::MessageExpired {
            expired_for: Some(Duration::from_secs(2 * 3_600))
        });
        assert!(!pipeline.can_decrypt_message(1, msg.epoch));
    }

    #[test]
    fn unknown_epoch_is_expired_not_retried() {
        let (pipeline, _storage, _env) = setup(PlaintextCacheMode::Disabled);
        let mut msg = message(1, 5);
        msg.state = ProcessingState::Delivered;

        assert!(!pipeline.can_decrypt_message(1, msg.epoch));
        let err = pipeline.decrypt_message(&msg, 1).unwrap_err();
        assert_eq!(err, DisplayableError::MessageExpired { expired_for: None });
        assert!(!err.is_retryable());
    }

    #[test]
    fn sent_message_renders_without_its_key() {
        let (pipeline, _storage, _env) = setup(PlaintextCacheMode::Disabled);
        let mut msg = message(1, 5);
        msg.state = ProcessingState::Delivered;
        pipeline.remember_sent(&msg, b"from me");

        let view = pipeline.decrypt_message(&msg, 1).unwrap();
        assert_eq!(view.source, PlaintextSource::SentLocally);
        assert_eq!(view.plaintext.as_slice(), b"from me");
    }

    #[test]
    fn corrupt_ciphertext_fails_and_is_marked() {
        let (pipeline, storage, env) = setup(PlaintextCacheMode::Disabled);
        let mut msg = sealed(&env, &storage, 5, b"hello");
        let last = msg.ciphertext.len() - 1;
        msg.ciphertext[last] ^= 0x01;

        let err = pipeline.decrypt_message(&msg, 1).unwrap_err();
        assert!(matches!(err, DisplayableError::DecryptionFailed { retryable: false, .. }));
        assert_eq!(storage.load_message(1, 5).unwrap().unwrap().state, ProcessingState::Failed);
    }

    #[test]
    fn wrong_conversation_is_rejected() {
        let (pipeline, storage, env) = setup(PlaintextCacheMode::Disabled);
        let msg = sealed(&env, &storage, 5, b"hello");
        assert!(pipeline.decrypt_message(&msg, 2).is_err());
    }

    #[test]
    fn batch_resolves_each_message_independently() {
        let (pipeline, storage, env) = setup(PlaintextCacheMode::Disabled);
        let first = sealed(&env, &storage, 2, b"one");
        let mut broken = sealed(&env, &storage, 3, b"two");
        broken.ciphertext.truncate(4);
        let third = sealed(&env, &storage, 4, b"three");

        let results = pipeline.decrypt_messages(&[third, broken, first], 1);
        let sequences: Vec<u64> = results.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![2, 3, 4]);
        assert!(results[0].result.is_ok());
        assert!(results[1].result.is_err());
        assert_eq!(results[2].result.as_ref().unwrap().plaintext.as_slice(), b"three");
    }

    #[test]
    fn sent_messages_render_from_memory_until_key_expires() {
        let (pipeline, storage, env) = setup(PlaintextCacheMode::Disabled);
        let mut msg = sealed(&env, &storage, 5, b"mine");
        pipeline.remember_sent(&msg, b"mine");
        msg.ciphertext.clear();

        let view = pipeline.decrypt_message(&msg, 1).unwrap();
        assert_eq!(view.source, PlaintextSource::SentLocally);

        env.advance(Duration::from_secs(2 * 86_400));
        assert!(matches!(
            pipeline.decrypt_message(&msg, 1),
            Err(DisplayableError::MessageExpired { .. })
        ));
    }

    #[test]
    fn session_cache_is_opt_in_and_bounded() {
        let (pipeline, storage, env) = setup(PlaintextCacheMode::SessionOnly { capacity: 1 });
        let a = sealed(&env, &storage, 5, b"a");
        let b = sealed(&env, &storage, 6, b"b");

        pipeline.decrypt_message(&a, 1).unwrap();
        assert_eq!(pipeline.decrypt_message(&a, 1).unwrap().source, PlaintextSource::SessionCache);

        pipeline.decrypt_message(&b, 1).unwrap();
        assert_eq!(pipeline.decrypt_message(&a, 1).unwrap().source, PlaintextSource::Decrypted);
    }

    #[test]
    fn user_messages_are_stable() {
        insta::assert_snapshot!(
            DisplayableError::MessageExpired { expired_for: Some(Duration::from_secs(3 * 3_600)) }
                .user_message(),
            @"Message expired 3 hours ago. Its key was removed by your retention setting."
        );
        insta::assert_snapshot!(
            DisplayableError::MessageExpired { expired_for: Some(Duration::from_secs(86_400)) }
                .user_message(),
            @"Message expired 1 day ago. Its key was removed by your retention setting."
        );
        insta::assert_snapshot!(
            DisplayableError::MessageExpired { expired_for: Some(Duration::from_secs(5)) }
                .user_message(),
            @"Message expired less than a minute ago. Its key was removed by your retention setting."
        );
        insta::assert_snapshot!(
            DisplayableError::MessageExpired { expired_for: None }.user_message(),
            @"Message expired. Its key is no longer on this device."
        );
        insta::assert_snapshot!(
            DisplayableError::DecryptionFailed { reason: "tag".into(), retryable: false }
                .user_message(),
            @"This message could not be decrypted."
        );
        insta::assert_snapshot!(
            DisplayableError::DecryptionFailed { reason: "io".into(), retryable: true }
                .user_message(),
            @"This message can't be decrypted right now. It will be retried."
        );
        insta::assert_snapshot!(
            DisplayableError::NotYetAvailable.user_message(),
            @"Waiting for earlier messages to arrive."
        );
    }
}
