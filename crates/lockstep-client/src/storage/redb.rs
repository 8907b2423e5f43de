//! Redb-backed Secure Key Store and Durable Message Store.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Epoch
//! secrets are sealed under the device master key before they reach disk;
//! messages are stored as the ciphertext that arrived.

use std::{path::Path, sync::Arc};

use lockstep_core::{
    message::{ConversationId, Message, ProcessingState},
    storage::{EpochKey, KeyMetadata, KeyStore, MessageStore, StorageError, Tombstone},
};
use lockstep_crypto::{AT_REST_NONCE_SIZE, EpochSecret, MasterKey, open_at_rest, seal_at_rest};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

/// Table: epoch_keys
/// Key: (conversation_id: u128, epoch: u64) as big-endian bytes [24 bytes]
/// Value: CBOR-encoded `StoredKey`
const EPOCH_KEYS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("epoch_keys");

/// Table: key_tombstones
/// Key: same layout as `epoch_keys`
/// Value: CBOR-encoded `Tombstone`
const KEY_TOMBSTONES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("key_tombstones");

/// Table: messages
/// Key: (conversation_id: u128, sequence: u64) as big-endian bytes [24 bytes]
/// Value: CBOR-encoded `Message`
const MESSAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("messages");

/// Table: conversations
/// Key: conversation_id as big-endian bytes [16 bytes]
/// Value: empty
const CONVERSATIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("conversations");

const EMPTY: &[u8] = &[];

/// Epoch key record as written to disk.
#[derive(Serialize, Deserialize)]
struct StoredKey {
    created_at_secs: u64,
    /// `seal_at_rest` output; the record key is the associated data
    sealed: Vec<u8>,
}

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
    master: Arc<MasterKey>,
}

impl RedbStorage {
    /// Open or create a database at `path`, sealing keys under `master`.
    ///
    /// Opening an existing database with a different master key succeeds,
    /// but every stored epoch key will then fail to load with
    /// [`StorageError::Sealing`].
    pub fn open(path: impl AsRef<Path>, master: MasterKey) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        {
            let _ = txn.open_table(EPOCH_KEYS).map_err(io)?;
            let _ = txn.open_table(KEY_TOMBSTONES).map_err(io)?;
            let _ = txn.open_table(MESSAGES).map_err(io)?;
            let _ = txn.open_table(CONVERSATIONS).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db), master: Arc::new(master) })
    }

    fn seal(&self, record_key: &[u8], secret: &EpochSecret) -> Result<Vec<u8>, StorageError> {
        let mut nonce = [0u8; AT_REST_NONCE_SIZE];
        getrandom::fill(&mut nonce).map_err(io)?;
        Ok(seal_at_rest(&self.master, record_key, secret.as_bytes(), nonce))
    }

    fn unseal(&self, record_key: &[u8], stored: &StoredKey) -> Result<EpochSecret, StorageError> {
        let plaintext = open_at_rest(&self.master, record_key, &stored.sealed)?;
        Ok(EpochSecret::from_slice(&plaintext)?)
    }
}

impl KeyStore for RedbStorage {
    fn store_key(
        &self,
        conversation_id: ConversationId,
        epoch: u64,
        secret: &EpochSecret,
        created_at_secs: u64,
    ) -> Result<(), StorageError> {
        let key = encode_pair_key(conversation_id, epoch);
        let txn = self.db.begin_write().map_err(io)?;
        {
            let tombstones = txn.open_table(KEY_TOMBSTONES).map_err(io)?;
            if tombstones.get(key.as_slice()).map_err(io)?.is_some() {
                return Err(StorageError::Tombstoned { conversation_id, epoch });
            }

            let mut keys = txn.open_table(EPOCH_KEYS).map_err(io)?;
            let existing_created = match keys.get(key.as_slice()).map_err(io)? {
                Some(value) => Some(decode::<StoredKey>(value.value())?.created_at_secs),
                None => None,
            };

            let stored = StoredKey {
                created_at_secs: existing_created.unwrap_or(created_at_secs),
                sealed: self.seal(&key, secret)?,
            };
            keys.insert(key.as_slice(), encode(&stored)?.as_slice()).map_err(io)?;
        }
        txn.commit().map_err(io)?;
        Ok(())
    }

    fn load_key(
        &self,
        conversation_id: ConversationId,
        epoch: u64,
    ) -> Result<Option<EpochKey>, StorageError> {
        let key = encode_pair_key(conversation_id, epoch);
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(EPOCH_KEYS).map_err(io)?;

        let Some(value) = table.get(key.as_slice()).map_err(io)? else {
            return Ok(None);
        };
        let stored: StoredKey = decode(value.value())?;
        let secret = self.unseal(&key, &stored)?;
        Ok(Some(EpochKey {
            metadata: KeyMetadata {
                conversation_id,
                epoch,
                created_at_secs: stored.created_at_secs,
            },
            secret,
        }))
    }

    fn list_keys(&self) -> Result<Vec<KeyMetadata>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(EPOCH_KEYS).map_err(io)?;

        let mut keys = Vec::new();
        for entry in table.iter().map_err(io)? {
            let (key, value) = entry.map_err(io)?;
            let (conversation_id, epoch) = decode_pair_key(key.value())?;
            let stored: StoredKey = decode(value.value())?;
            keys.push(KeyMetadata {
                conversation_id,
                epoch,
                created_at_secs: stored.created_at_secs,
            });
        }
        Ok(keys)
    }

    fn expire_key(
        &self,
        conversation_id: ConversationId,
        epoch: u64,
        cutoff_secs: u64,
        now_secs: u64,
    ) -> Result<bool, StorageError> {
        let key = encode_pair_key(conversation_id, epoch);
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut keys = txn.open_table(EPOCH_KEYS).map_err(io)?;
            let created_at_secs = match keys.get(key.as_slice()).map_err(io)? {
                Some(value) => decode::<StoredKey>(value.value())?.created_at_secs,
                None => return Ok(false),
            };
            if created_at_secs >= cutoff_secs {
                return Ok(false);
            }

            keys.remove(key.as_slice()).map_err(io)?;
            let mut tombstones = txn.open_table(KEY_TOMBSTONES).map_err(io)?;
            let tombstone = Tombstone { created_at_secs, deleted_at_secs: now_secs };
            tombstones.insert(key.as_slice(), encode(&tombstone)?.as_slice()).map_err(io)?;
        }
        txn.commit().map_err(io)?;
        Ok(true)
    }

    fn tombstone(
        &self,
        conversation_id: ConversationId,
        epoch: u64,
    ) -> Result<Option<Tombstone>, StorageError> {
        let key = encode_pair_key(conversation_id, epoch);
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(KEY_TOMBSTONES).map_err(io)?;

        match table.get(key.as_slice()).map_err(io)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }
}

impl MessageStore for RedbStorage {
    fn store_message(&self, message: &Message) -> Result<bool, StorageError> {
        let key = encode_pair_key(message.conversation_id, message.sequence);
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut messages = txn.open_table(MESSAGES).map_err(io)?;
            if messages.get(key.as_slice()).map_err(io)?.is_some() {
                return Ok(false);
            }
            messages.insert(key.as_slice(), encode(message)?.as_slice()).map_err(io)?;

            let mut conversations = txn.open_table(CONVERSATIONS).map_err(io)?;
            let conversation_key = message.conversation_id.to_be_bytes();
            conversations.insert(conversation_key.as_slice(), EMPTY).map_err(io)?;
        }
        txn.commit().map_err(io)?;
        Ok(true)
    }

    fn load_message(
        &self,
        conversation_id: ConversationId,
        sequence: u64,
    ) -> Result<Option<Message>, StorageError> {
        let key = encode_pair_key(conversation_id, sequence);
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(MESSAGES).map_err(io)?;

        match table.get(key.as_slice()).map_err(io)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn load_messages(
        &self,
        conversation_id: ConversationId,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let start = match after {
            Some(after) => match after.checked_add(1) {
                Some(start) => start,
                None => return Ok(Vec::new()),
            },
            None => 0,
        };
        let start_key = encode_pair_key(conversation_id, start);
        let end_key = encode_pair_key(conversation_id, u64::MAX);

        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(MESSAGES).map_err(io)?;

        let mut messages = Vec::with_capacity(limit.min(256));
        for entry in table.range(start_key.as_slice()..=end_key.as_slice()).map_err(io)? {
            if messages.len() >= limit {
                break;
            }
            let (_, value) = entry.map_err(io)?;
            messages.push(decode(value.value())?);
        }
        Ok(messages)
    }

    fn update_state(
        &self,
        conversation_id: ConversationId,
        sequence: u64,
        state: ProcessingState,
        gap_before: bool,
    ) -> Result<(), StorageError> {
        let key = encode_pair_key(conversation_id, sequence);
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(MESSAGES).map_err(io)?;
            let mut message: Message = match table.get(key.as_slice()).map_err(io)? {
                Some(value) => decode(value.value())?,
                None => return Err(StorageError::NotFound { conversation_id, sequence }),
            };
            if message.state == state && message.gap_before == gap_before {
                return Ok(());
            }
            message.state = state;
            message.gap_before = gap_before;
            table.insert(key.as_slice(), encode(&message)?.as_slice()).map_err(io)?;
        }
        txn.commit().map_err(io)?;
        Ok(())
    }

    fn last_processed(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Message>, StorageError> {
        let start_key = encode_pair_key(conversation_id, 0);
        let end_key = encode_pair_key(conversation_id, u64::MAX);

        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(MESSAGES).map_err(io)?;

        for entry in table.range(start_key.as_slice()..=end_key.as_slice()).map_err(io)?.rev() {
            let (_, value) = entry.map_err(io)?;
            let message: Message = decode(value.value())?;
            if message.state.is_processed() {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    fn list_conversations(&self) -> Result<Vec<ConversationId>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(CONVERSATIONS).map_err(io)?;

        let mut conversations = Vec::new();
        for entry in table.iter().map_err(io)? {
            let (key, _) = entry.map_err(io)?;
            let bytes: [u8; 16] = key.value().try_into().map_err(|_| {
                StorageError::Serialization("conversation key is not 16 bytes".into())
            })?;
            conversations.push(u128::from_be_bytes(bytes));
        }
        Ok(conversations)
    }
}

fn io(err: impl std::fmt::Display) -> StorageError {
    StorageError::Io(err.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Encode `(conversation_id, n)` as a 24-byte big-endian key.
///
/// Layout: [conversation_id: 16 bytes BE][n: 8 bytes BE], so lexicographic
/// order matches numeric order within a conversation.
fn encode_pair_key(conversation_id: ConversationId, n: u64) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..16].copy_from_slice(&conversation_id.to_be_bytes());
    key[16..].copy_from_slice(&n.to_be_bytes());
    key
}

fn decode_pair_key(key: &[u8]) -> Result<(ConversationId, u64), StorageError> {
    let malformed =
        || StorageError::Serialization(format!("malformed record key of {} bytes", key.len()));
    let conversation: [u8; 16] =
        key.get(..16).and_then(|b| b.try_into().ok()).ok_or_else(malformed)?;
    let n: [u8; 8] = key.get(16..24).and_then(|b| b.try_into().ok()).ok_or_else(malformed)?;
    Ok((u128::from_be_bytes(conversation), u64::from_be_bytes(n)))
}
