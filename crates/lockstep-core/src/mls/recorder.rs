//! Executes `RecordEpochKey` actions.

use std::sync::Arc;

use super::MlsAction;
use crate::{env::Environment, retention::RetentionPolicyEngine, storage::KeyStore};

/// Stores exported epoch secrets as groups enter new epochs.
///
/// A failure to store a key is logged and does not fail the MLS operation
/// that produced it; messages of that epoch will surface as undecryptable.
pub struct EpochKeyRecorder<K, E> {
    retention: Arc<RetentionPolicyEngine<K, E>>,
}

impl<K: KeyStore, E: Environment> EpochKeyRecorder<K, E> {
    /// Recorder writing through `retention`.
    pub fn new(retention: Arc<RetentionPolicyEngine<K, E>>) -> Self {
        Self { retention }
    }

    /// Execute the `RecordEpochKey` actions and return the rest for the
    /// caller.
    pub fn apply(&self, actions: Vec<MlsAction>) -> Vec<MlsAction> {
        actions
            .into_iter()
            .filter_map(|action| match action {
                MlsAction::RecordEpochKey { conversation_id, epoch, secret } => {
                    if let Err(err) = self.retention.record_epoch_key(conversation_id, epoch, &secret)
                    {
                        tracing::warn!(conversation_id, epoch, %err, "failed to record epoch key");
                    }
                    None
                },
                other => Some(other),
            })
            .collect()
    }
}
