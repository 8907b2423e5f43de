use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use lockstep_crypto::EpochSecret;

use super::{EpochKey, KeyMetadata, KeyStore, MessageStore, StorageError, Tombstone};
use crate::message::{ConversationId, Message, ProcessingState};

/// In-memory storage implementing both stores, for tests and simulation.
///
/// All state lives behind one `Arc<Mutex<>>`, so clones share it and every
/// operation, including `expire_key`, is atomic. A poisoned lock is recovered
/// rather than propagated: the maps are never left half-updated.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

#[derive(Default)]
struct MemoryStorageInner {
    /// Live epoch keys
    keys: HashMap<(ConversationId, u64), (EpochSecret, u64)>,

    /// Deleted epoch keys
    tombstones: HashMap<(ConversationId, u64), Tombstone>,

    /// Messages per conversation, ordered by sequence
    messages: HashMap<ConversationId, BTreeMap<u64, Message>>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys. Useful for tests.
    pub fn key_count(&self) -> usize {
        self.lock().keys.len()
    }

    /// Total number of stored messages across all conversations.
    pub fn message_count(&self) -> usize {
        self.lock().messages.values().map(BTreeMap::len).sum()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStorageInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyStore for MemoryStorage {
    fn store_key(
        &self,
        conversation_id: ConversationId,
        epoch: u64,
        secret: &EpochSecret,
        created_at_secs: u64,
    ) -> Result<(), StorageError> {
        let mut inner = self.lock();
        if inner.tombstones.contains_key(&(conversation_id, epoch)) {
            return Err(StorageError::Tombstoned { conversation_id, epoch });
        }

        let created = inner
            .keys
            .get(&(conversation_id, epoch))
            .map_or(created_at_secs, |(_, existing)| *existing);
        inner.keys.insert((conversation_id, epoch), (secret.clone(), created));
        Ok(())
    }

    fn load_key(
        &self,
        conversation_id: ConversationId,
        epoch: u64,
    ) -> Result<Option<EpochKey>, StorageError> {
        let inner = self.lock();
        Ok(inner.keys.get(&(conversation_id, epoch)).map(|(secret, created_at_secs)| EpochKey {
            metadata: KeyMetadata { conversation_id, epoch, created_at_secs: *created_at_secs },
            secret: secret.clone(),
        }))
    }

    fn list_keys(&self) -> Result<Vec<KeyMetadata>, StorageError> {
        let inner = self.lock();
        Ok(inner
            .keys
            .iter()
            .map(|(&(conversation_id, epoch), &(_, created_at_secs))| KeyMetadata {
                conversation_id,
                epoch,
                created_at_secs,
            })
            .collect())
    }

    fn expire_key(
        &self,
        conversation_id: ConversationId,
        epoch: u64,
        cutoff_secs: u64,
        now_secs: u64,
    ) -> Result<bool, StorageError> {
        let mut inner = self.lock();
        let Some(&(_, created_at_secs)) = inner.keys.get(&(conversation_id, epoch)) else {
            return Ok(false);
        };
        if created_at_secs >= cutoff_secs {
            return Ok(false);
        }

        inner.keys.remove(&(conversation_id, epoch));
        inner
            .tombstones
            .insert((conversation_id, epoch), Tombstone { created_at_secs, deleted_at_secs: now_secs });
        Ok(true)
    }

    fn tombstone(
        &self,
        conversation_id: ConversationId,
        epoch: u64,
    ) -> Result<Option<Tombstone>, StorageError> {
        Ok(self.lock().tombstones.get(&(conversation_id, epoch)).copied())
    }
}

impl MessageStore for MemoryStorage {
    fn store_message(&self, message: &Message) -> Result<bool, StorageError> {
        let mut inner = self.lock();
        let log = inner.messages.entry(message.conversation_id).or_default();
        if log.contains_key(&message.sequence) {
            return Ok(false);
        }
        log.insert(message.sequence, message.clone());
        Ok(true)
    }

    fn load_message(
        &self,
        conversation_id: ConversationId,
        sequence: u64,
    ) -> Result<Option<Message>, StorageError> {
        let inner = self.lock();
        Ok(inner.messages.get(&conversation_id).and_then(|log| log.get(&sequence)).cloned())
    }

    fn load_messages(
        &self,
        conversation_id: ConversationId,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let inner = self.lock();
        let Some(log) = inner.messages.get(&conversation_id) else {
            return Ok(Vec::new());
        };

        let messages = match after {
            Some(after) if after == u64::MAX => Vec::new(),
            Some(after) => log.range(after + 1..).take(limit).map(|(_, m)| m.clone()).collect(),
            None => log.values().take(limit).cloned().collect(),
        };
        Ok(messages)
    }

    fn update_state(
        &self,
        conversation_id: ConversationId,
        sequence: u64,
        state: ProcessingState,
        gap_before: bool,
    ) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let message = inner
            .messages
            .get_mut(&conversation_id)
            .and_then(|log| log.get_mut(&sequence))
            .ok_or(StorageError::NotFound { conversation_id, sequence })?;
        message.state = state;
        message.gap_before = gap_before;
        Ok(())
    }

    fn last_processed(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Message>, StorageError> {
        let inner = self.lock();
        Ok(inner
            .messages
            .get(&conversation_id)
            .and_then(|log| log.values().rev().find(|m| m.state.is_processed()))
            .cloned())
    }

    fn list_conversations(&self) -> Result<Vec<ConversationId>, StorageError> {
        Ok(self.lock().messages.keys().copied().collect())
    }
}
