//! Chaotic storage wrapper for fault injection testing
//!
//! Randomly fails operations to prove that cleanup passes and delivery keep
//! going when individual storage calls fail.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use lockstep_crypto::EpochSecret;

use super::{EpochKey, KeyMetadata, KeyStore, MessageStore, StorageError, Tombstone};
use crate::message::{ConversationId, Message, ProcessingState};

/// Chaotic storage wrapper that randomly injects I/O failures
///
/// Delegates to an underlying storage implementation but fails operations
/// with the configured probability. Failures are always
/// [`StorageError::Io`], i.e. transient.
#[derive(Clone)]
pub struct ChaoticStorage<S> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    /// Operation counter
    operation_count: Arc<AtomicUsize>,
}

/// Linear congruential generator, so chaos runs are reproducible per seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S> ChaoticStorage<S> {
    /// Wrap `inner` with the default seed.
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Wrap `inner` with an explicit seed. The rate is clamped to [0.0, 1.0].
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        Self {
            inner,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            rng: Arc::new(Mutex::new(ChaoticRng { state: seed })),
            operation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of storage operations attempted.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    fn inject(&self, operation: &str) -> Result<(), StorageError> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);
        let roll = self.rng.lock().unwrap_or_else(PoisonError::into_inner).next();
        if roll < self.failure_rate {
            return Err(StorageError::Io(format!("chaotic failure injection in {operation}")));
        }
        Ok(())
    }
}

impl<S: KeyStore> KeyStore for ChaoticStorage<S> {
    fn store_key(
        &self,
        conversation_id: ConversationId,
        epoch: u64,
        secret: &EpochSecret,
        created_at_secs: u64,
    ) -> Result<(), StorageError> {
        self.inject("store_key")?;
        self.inner.store_key(conversation_id, epoch, secret, created_at_secs)
    }

    fn load_key(
        &self,
        conversation_id: ConversationId,
        epoch: u64,
    ) -> Result<Option<EpochKey>, StorageError> {
        self.inject("load_key")?;
        self.inner.load_key(conversation_id, epoch)
    }

    fn list_keys(&self) -> Result<Vec<KeyMetadata>, StorageError> {
        self.inject("list_keys")?;
        self.inner.list_keys()
    }

    fn expire_key(
        &self,
        conversation_id: ConversationId,
        epoch: u64,
        cutoff_secs: u64,
        now_secs: u64,
    ) -> Result<bool, StorageError> {
        self.inject("expire_key")?;
        self.inner.expire_key(conversation_id, epoch, cutoff_secs, now_secs)
    }

    fn tombstone(
        &self,
        conversation_id: ConversationId,
        epoch: u64,
    ) -> Result<Option<Tombstone>, StorageError> {
        self.inject("tombstone")?;
        self.inner.tombstone(conversation_id, epoch)
    }
}

impl<S: MessageStore> MessageStore for ChaoticStorage<S> {
    fn store_message(&self, message: &Message) -> Result<bool, StorageError> {
        self.inject("store_message")?;
        self.inner.store_message(message)
    }

    fn load_message(
        &self,
        conversation_id: ConversationId,
        sequence: u64,
    ) -> Result<Option<Message>, StorageError> {
        self.inject("load_message")?;
        self.inner.load_message(conversation_id, sequence)
    }

    fn load_messages(
        &self,
        conversation_id: ConversationId,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        self.inject("load_messages")?;
        self.inner.load_messages(conversation_id, after, limit)
    }

    fn update_state(
        &self,
        conversation_id: ConversationId,
        sequence: u64,
        state: ProcessingState,
        gap_before: bool,
    ) -> Result<(), StorageError> {
        self.inject("update_state")?;
        self.inner.update_state(conversation_id, sequence, state, gap_before)
    }

    fn last_processed(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Message>, StorageError> {
        self.inject("last_processed")?;
        self.inner.last_processed(conversation_id)
    }

    fn list_conversations(&self) -> Result<Vec<ConversationId>, StorageError> {
        self.inject("list_conversations")?;
        self.inner.list_conversations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{message::fixtures::message, storage::MemoryStorage};

    #[test]
    fn zero_failure_rate_never_fails() {
        let storage = ChaoticStorage::new(MemoryStorage::new(), 0.0);
        for sequence in 1..=100 {
            assert!(storage.store_message(&message(1, sequence)).is_ok());
        }
        assert_eq!(storage.operation_count(), 100);
    }

    #[test]
    fn full_failure_rate_always_fails_transiently() {
        let storage = ChaoticStorage::new(MemoryStorage::new(), 1.0);
        let err = storage.list_keys().unwrap_err();
        assert!(err.is_transient());
        assert_eq!(storage.inner().key_count(), 0);
    }

    #[test]
    fn same_seed_same_failures() {
        let pattern = |seed| {
            let storage = ChaoticStorage::with_seed(MemoryStorage::new(), 0.5, seed);
            (1..=32).map(|s| storage.store_message(&message(1, s)).is_ok()).collect::<Vec<_>>()
        };
        assert_eq!(pattern(42), pattern(42));
    }

    #[test]
    fn rate_is_clamped() {
        let storage = ChaoticStorage::new(MemoryStorage::new(), 7.0);
        assert!(storage.list_conversations().is_err());
    }
}
