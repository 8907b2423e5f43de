//! Pipeline state surviving a restart on the redb store.

use std::time::Duration;

use async_trait::async_trait;
use lockstep_client::{
    ClientConfig, Cursor, HistoryApi, HistoryError, HistoryPage, MasterKeySource, Pipeline,
    RedbStorage, StaticMasterKey,
};
use lockstep_core::{
    DisplayableError, EpochCipher, MessageStore, ProcessingState, RetentionWindow,
    env::test_utils::MockEnv, message::Message,
};
use lockstep_crypto::{EpochSecret, MasterKey};
use tempfile::tempdir;

const CONVERSATION: u128 = 0xFEED;
const DAY: Duration = Duration::from_secs(86_400);

/// Server that has nothing to offer.
struct EmptyHistory;

#[async_trait]
impl HistoryApi for EmptyHistory {
    async fn get_messages(
        &self,
        _conversation_id: u128,
        _limit: usize,
        _since: Option<Cursor>,
    ) -> Result<HistoryPage, HistoryError> {
        Ok(HistoryPage::default())
    }
}

fn sealed(env: &MockEnv, secret: &EpochSecret, sequence: u64, text: &[u8]) -> Message {
    Message {
        id: u128::from(sequence),
        conversation_id: CONVERSATION,
        sender: 4,
        epoch: 0,
        sequence,
        ciphertext: EpochCipher::seal(secret, CONVERSATION, 0, sequence, text, env),
        state: ProcessingState::Buffered,
        gap_before: false,
        received_at_secs: 0,
    }
}

#[tokio::test]
async fn delivered_messages_and_keys_survive_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("device.redb");
    let source = StaticMasterKey::new(MasterKey::new([3; 32]));
    let env = MockEnv::new();
    let secret = EpochSecret::new([8; 32]);
    let config = ClientConfig { proactive_recovery: false, ..ClientConfig::default() };

    {
        let storage = RedbStorage::open(&path, source.load_or_create().unwrap()).unwrap();
        let (pipeline, mut rx) =
            Pipeline::new(config, storage, EmptyHistory, env.clone(), EpochCipher);
        pipeline.retention().record_epoch_key(CONVERSATION, 0, &secret).unwrap();

        for (sequence, text) in [(1, b"one"), (2, b"two"), (4, b"for")] {
            pipeline.receive(sealed(&env, &secret, sequence, text)).await.unwrap();
        }
        assert_eq!(rx.recv().await.unwrap().sequence, 1);
        assert_eq!(rx.recv().await.unwrap().sequence, 2);
    }

    env.advance(DAY);
    let storage = RedbStorage::open(&path, source.load_or_create().unwrap()).unwrap();
    let (pipeline, mut rx) =
        Pipeline::new(config, storage.clone(), EmptyHistory, env.clone(), EpochCipher);
    pipeline.open_conversation(CONVERSATION).await.unwrap();

    let status = pipeline.status(CONVERSATION).unwrap();
    assert_eq!(status.buffer.next_expected, 3);
    assert_eq!(status.buffer.pending, vec![4]);

    pipeline.receive(sealed(&env, &secret, 3, b"three")).await.unwrap();
    let third = rx.recv().await.unwrap();
    let fourth = rx.recv().await.unwrap();
    assert_eq!((third.sequence, fourth.sequence), (3, 4));
    assert_eq!(storage.last_processed(CONVERSATION).unwrap().unwrap().sequence, 4);

    let view = pipeline.decrypt_message(fourth.clone(), CONVERSATION).await.unwrap();
    assert_eq!(view.plaintext.as_slice(), b"for");

    let report = pipeline.set_retention_policy(RetentionWindow::Hours(12)).await.unwrap();
    assert_eq!(report.deleted, 1);
    let err = pipeline.decrypt_message(fourth, CONVERSATION).await.unwrap_err();
    let expired_for = Some(Duration::from_secs(12 * 3_600));
    assert_eq!(err, DisplayableError::MessageExpired { expired_for });
}
