//! MLS groups record one epoch key per epoch, and every member derives the
//! same key for the same epoch.

use std::sync::Arc;

use lockstep_core::{
    EpochCipher, Environment, RetentionPolicyEngine, RetentionWindow,
    env::test_utils::MockEnv,
    message::{Message, ProcessingState},
    mls::{ConversationGroup, EpochKeyRecorder, GroupConfig, MlsAction},
    pipeline::{DecryptionPipeline, PlaintextCacheMode},
    storage::MemoryStorage,
};

const CONVERSATION: u128 = 0x1234_5678_9abc_def0_1234_5678_9abc_def0;

fn recorded_epochs(actions: &[MlsAction]) -> Vec<u64> {
    actions
        .iter()
        .filter_map(|a| match a {
            MlsAction::RecordEpochKey { epoch, .. } => Some(*epoch),
            _ => None,
        })
        .collect()
}

fn welcome_of(actions: &[MlsAction]) -> Vec<u8> {
    actions
        .iter()
        .find_map(|a| match a {
            MlsAction::SendWelcome { welcome, .. } => Some(welcome.clone()),
            _ => None,
        })
        .expect("add_members should produce a Welcome")
}

fn commit_of(actions: &[MlsAction]) -> Vec<u8> {
    actions
        .iter()
        .find_map(|a| match a {
            MlsAction::SendCommit(commit) => Some(commit.clone()),
            _ => None,
        })
        .expect("add_members should produce a commit")
}

#[test]
fn create_records_epoch_zero() {
    let env = MockEnv::with_crypto_rng();
    let (group, actions) =
        ConversationGroup::create(env, CONVERSATION, 1, GroupConfig::default()).unwrap();

    assert_eq!(group.epoch(), 0);
    assert_eq!(recorded_epochs(&actions), vec![0]);
    assert_eq!(group.members(), vec![1]);
}

#[test]
fn members_agree_on_epoch_secrets() {
    let env = MockEnv::with_crypto_rng();
    let config = GroupConfig::default();

    let (mut alice, _) = ConversationGroup::create(env.clone(), CONVERSATION, 1, config).unwrap();

    // Bob joins: alice stages, merges, bob consumes the Welcome.
    let (bob_kp, bob_pending) = ConversationGroup::generate_key_package(env.clone(), 2).unwrap();
    let actions = alice.add_members_from_bytes(&[bob_kp]).unwrap();
    assert!(alice.has_pending_commit());
    assert_eq!(recorded_epochs(&actions), Vec::<u64>::new());
    let welcome = welcome_of(&actions);

    let merged = alice.merge_pending_commit().unwrap();
    assert_eq!(recorded_epochs(&merged), vec![1]);

    let (mut bob, joined) =
        ConversationGroup::join_from_welcome(CONVERSATION, 2, &welcome, bob_pending, config)
            .unwrap();
    assert_eq!(recorded_epochs(&joined), vec![1]);
    assert_eq!(alice.export_epoch_secret().unwrap(), bob.export_epoch_secret().unwrap());

    // Carol joins: bob learns of it through alice's commit.
    let (carol_kp, _carol_pending) = ConversationGroup::generate_key_package(env, 3).unwrap();
    let actions = alice.add_members_from_bytes(&[carol_kp]).unwrap();
    let commit = commit_of(&actions);
    alice.merge_pending_commit().unwrap();

    let processed = bob.process_handshake(&commit).unwrap();
    assert_eq!(recorded_epochs(&processed), vec![2]);
    assert_eq!(bob.epoch(), 2);
    assert_eq!(alice.export_epoch_secret().unwrap(), bob.export_epoch_secret().unwrap());

    let mut members = bob.members();
    members.sort_unstable();
    assert_eq!(members, vec![1, 2, 3]);
}

#[test]
fn merge_without_pending_commit_fails() {
    let env = MockEnv::with_crypto_rng();
    let (mut group, _) =
        ConversationGroup::create(env, CONVERSATION, 1, GroupConfig::default()).unwrap();
    assert!(group.merge_pending_commit().is_err());
}

#[test]
fn recorded_keys_decrypt_messages_from_other_members() {
    let env = MockEnv::with_crypto_rng();
    let config = GroupConfig::default();

    let alice_store = MemoryStorage::new();
    let alice_retention = Arc::new(RetentionPolicyEngine::new(
        alice_store.clone(),
        env.clone(),
        RetentionWindow::default(),
    ));
    let alice_recorder = EpochKeyRecorder::new(Arc::clone(&alice_retention));

    let bob_store = MemoryStorage::new();
    let bob_retention = Arc::new(RetentionPolicyEngine::new(
        bob_store.clone(),
        env.clone(),
        RetentionWindow::default(),
    ));
    let bob_recorder = EpochKeyRecorder::new(Arc::clone(&bob_retention));

    let (mut alice, created) =
        ConversationGroup::create(env.clone(), CONVERSATION, 1, config).unwrap();
    assert!(alice_recorder.apply(created).is_empty());

    let (bob_kp, bob_pending) = ConversationGroup::generate_key_package(env.clone(), 2).unwrap();
    let actions = alice.add_members_from_bytes(&[bob_kp]).unwrap();
    let welcome = welcome_of(&actions);
    alice_recorder.apply(alice.merge_pending_commit().unwrap());

    let (bob, joined) =
        ConversationGroup::join_from_welcome(CONVERSATION, 2, &welcome, bob_pending, config)
            .unwrap();
    bob_recorder.apply(joined);

    // Alice seals with her copy of the epoch 1 key; Bob opens with his.
    let alice_secret = alice_retention.live_key(CONVERSATION, 1).unwrap().unwrap().secret;
    let message = Message {
        id: 1,
        conversation_id: CONVERSATION,
        sender: 1,
        epoch: 1,
        sequence: 1,
        ciphertext: EpochCipher::seal(&alice_secret, CONVERSATION, 1, 1, b"hi bob", &env),
        state: ProcessingState::Delivered,
        gap_before: false,
        received_at_secs: env.wall_clock_secs(),
    };

    let pipeline =
        DecryptionPipeline::new(bob_retention, bob_store, EpochCipher, PlaintextCacheMode::Disabled);
    let view = pipeline.decrypt_message(&message, bob.conversation_id()).unwrap();
    assert_eq!(view.plaintext.as_slice(), b"hi bob");

    // Bob never saw epoch 0.
    assert!(!pipeline.can_decrypt_message(CONVERSATION, 0));
}
