//! Retention policy behavior end to end: keys recorded over time, policy
//! changes, cleanup passes, and what the decryption pipeline reports.

use std::{sync::Arc, time::Duration};

use lockstep_core::{
    DecryptionPipeline, DisplayableError, EpochCipher, Environment, KeyStore, MessageStore,
    PlaintextCacheMode, RetentionPolicyEngine, RetentionWindow,
    env::test_utils::MockEnv,
    message::{Message, ProcessingState},
    storage::{ChaoticStorage, MemoryStorage},
};
use lockstep_crypto::EpochSecret;

const DAY: Duration = Duration::from_secs(86_400);
const CONVERSATION: u128 = 77;

fn secret(epoch: u64) -> EpochSecret {
    EpochSecret::new([epoch as u8 + 1; 32])
}

fn sealed_message(env: &MockEnv, epoch: u64, sequence: u64, text: &[u8]) -> Message {
    Message {
        id: u128::from(sequence),
        conversation_id: CONVERSATION,
        sender: 3,
        epoch,
        sequence,
        ciphertext: EpochCipher::seal(&secret(epoch), CONVERSATION, epoch, sequence, text, env),
        state: ProcessingState::Delivered,
        gap_before: false,
        received_at_secs: env.wall_clock_secs(),
    }
}

/// Four epochs whose keys end up 40, 20, 10 and 1 days old.
fn aged_history(
    engine: &RetentionPolicyEngine<MemoryStorage, MockEnv>,
    storage: &MemoryStorage,
    env: &MockEnv,
) -> Vec<Message> {
    let mut messages = Vec::new();
    for (epoch, wait_days) in [(0u64, 20u32), (1, 10), (2, 9), (3, 1)] {
        engine.record_epoch_key(CONVERSATION, epoch, &secret(epoch)).unwrap();
        let message = sealed_message(env, epoch, epoch + 1, format!("epoch {epoch}").as_bytes());
        storage.store_message(&message).unwrap();
        messages.push(message);
        env.advance(DAY * wait_days);
    }
    messages
}

#[test]
fn shortening_the_window_expires_older_epochs() {
    let env = MockEnv::new();
    let storage = MemoryStorage::new();
    let engine = Arc::new(RetentionPolicyEngine::new(
        storage.clone(),
        env.clone(),
        RetentionWindow::THIRTY_DAYS,
    ));
    let pipeline = DecryptionPipeline::new(
        Arc::clone(&engine),
        storage.clone(),
        EpochCipher,
        PlaintextCacheMode::Disabled,
    );
    let messages = aged_history(&engine, &storage, &env);

    // Under 30 days only the 40-day-old epoch is gone.
    let report = engine.perform_cleanup().unwrap();
    assert_eq!(report.deleted, 1);
    let readable: Vec<bool> = (0..4).map(|e| engine.can_decrypt(CONVERSATION, e).unwrap()).collect();
    assert_eq!(readable, vec![false, true, true, true]);

    engine.update_policy(RetentionWindow::ONE_WEEK);

    // The stricter window applies at once, before any cleanup runs.
    let readable: Vec<bool> = (0..4).map(|e| engine.can_decrypt(CONVERSATION, e).unwrap()).collect();
    assert_eq!(readable, vec![false, false, false, true]);

    let results = pipeline.decrypt_messages(&messages, CONVERSATION);
    assert_eq!(results[1].result, Err(DisplayableError::MessageExpired {
        expired_for: Some(DAY * 13)
    }));
    assert_eq!(results[3].result.as_ref().unwrap().plaintext.as_slice(), b"epoch 3");

    engine.perform_cleanup().unwrap();
    assert_eq!(storage.key_count(), 1);

    // Widening the window again does not resurrect deleted keys.
    engine.update_policy(RetentionWindow::NINETY_DAYS);
    let readable: Vec<bool> = (0..4).map(|e| engine.can_decrypt(CONVERSATION, e).unwrap()).collect();
    assert_eq!(readable, vec![false, false, false, true]);
}

#[test]
fn deleted_epoch_cannot_be_stored_again() {
    let env = MockEnv::new();
    let storage = MemoryStorage::new();
    let engine = RetentionPolicyEngine::new(storage.clone(), env.clone(), RetentionWindow::ONE_DAY);

    engine.record_epoch_key(CONVERSATION, 0, &secret(0)).unwrap();
    env.advance(DAY * 2);
    engine.perform_cleanup().unwrap();

    assert!(engine.record_epoch_key(CONVERSATION, 0, &secret(0)).is_err());
    assert!(!engine.can_decrypt(CONVERSATION, 0).unwrap());
}

#[test]
fn cleanup_converges_under_storage_faults() {
    let env = MockEnv::new();
    let memory = MemoryStorage::new();
    let chaotic = ChaoticStorage::with_seed(memory.clone(), 0.3, 42);
    let engine = RetentionPolicyEngine::new(chaotic, env.clone(), RetentionWindow::ONE_WEEK);

    for epoch in 0..50 {
        memory.store_key(CONVERSATION, epoch, &secret(epoch), env.wall_clock_secs()).unwrap();
        env.advance(Duration::from_secs(3_600));
    }
    env.advance(DAY * 7);

    // Passes may fail partially; repeated passes must converge and never
    // touch keys still inside the window.
    let mut passes = 0;
    while memory.key_count() > 0 && passes < 50 {
        let _ = engine.perform_cleanup();
        passes += 1;
    }

    let now = env.wall_clock_secs();
    let window = RetentionWindow::ONE_WEEK.as_secs();
    for key in memory.list_keys().unwrap() {
        assert!(now - key.created_at_secs <= window, "key past window survived: {key:?}");
    }
    for epoch in 0..50 {
        if let Some(tombstone) = memory.tombstone(CONVERSATION, epoch).unwrap() {
            assert!(now - tombstone.created_at_secs > window);
        }
    }
    assert!(engine.key_store().operation_count() > 0);
}
