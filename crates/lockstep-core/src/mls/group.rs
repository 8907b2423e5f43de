//! Conversation group wrapper.
//!
//! Every operation that moves the group into a new epoch (creation, joining
//! from a Welcome, merging our own commit, processing someone else's) ends
//! with a [`MlsAction::RecordEpochKey`] carrying that epoch's exported
//! secret. Drivers hand the actions to an
//! [`EpochKeyRecorder`](super::EpochKeyRecorder).

use lockstep_crypto::{EPOCH_SECRET_SIZE, EpochSecret};
use openmls::{
    key_packages::KeyPackageIn,
    prelude::{
        BasicCredential, Ciphersuite, CredentialWithKey, KeyPackage, MlsMessageBodyIn,
        MlsMessageIn, ProcessedMessageContent, ProtocolMessage, ProtocolVersion, StagedWelcome,
    },
};
use openmls_basic_credential::SignatureKeyPair;
use openmls_traits::OpenMlsProvider;
use tls_codec::{Deserialize, Serialize};

use super::{GroupConfig, error::MlsError, provider::MlsProvider};
use crate::{
    env::Environment,
    message::{ConversationId, MemberId},
};

/// Exporter label for epoch secrets.
pub const EPOCH_SECRET_LABEL: &str = "lockstep epoch secret";

pub(crate) const CIPHERSUITE: Ciphersuite =
    Ciphersuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519;

/// Private key material needed to process a Welcome.
///
/// Returned by [`ConversationGroup::generate_key_package`] and consumed by
/// [`ConversationGroup::join_from_welcome`].
pub struct PendingJoinState<E: Environment> {
    provider: MlsProvider<E>,
    signer: SignatureKeyPair,
}

/// Work for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MlsAction {
    /// Store the secret of an epoch the group just entered
    RecordEpochKey {
        /// Conversation
        conversation_id: ConversationId,
        /// Epoch entered
        epoch: u64,
        /// Exported secret
        secret: EpochSecret,
    },

    /// Send a commit to the conversation
    SendCommit(Vec<u8>),

    /// Send a Welcome to members being added
    SendWelcome {
        /// Members the Welcome admits
        recipients: Vec<MemberId>,
        /// TLS-serialized Welcome
        welcome: Vec<u8>,
    },

    /// We are no longer a member
    RemoveGroup {
        /// Why
        reason: String,
    },
}

/// One conversation's MLS group.
///
/// # Invariants
///
/// - Epoch only increases
/// - Every epoch the group enters produces exactly one `RecordEpochKey`
pub struct ConversationGroup<E: Environment> {
    conversation_id: ConversationId,
    member_id: MemberId,
    mls_group: openmls::group::MlsGroup,
    signer: SignatureKeyPair,
    provider: MlsProvider<E>,
}

fn member_credential(
    member_id: MemberId,
) -> Result<(SignatureKeyPair, CredentialWithKey), MlsError> {
    let signer = SignatureKeyPair::new(CIPHERSUITE.signature_algorithm())
        .map_err(|e| MlsError::Crypto(format!("failed to generate keypair: {e}")))?;
    let credential = BasicCredential::new(member_id.to_le_bytes().to_vec());
    let credential_with_key =
        CredentialWithKey { credential: credential.into(), signature_key: signer.public().into() };
    Ok((signer, credential_with_key))
}

fn member_id_of(credential_bytes: &[u8]) -> Option<MemberId> {
    let bytes: [u8; 8] = credential_bytes.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

impl<E: Environment> ConversationGroup<E> {
    /// Create a new group at epoch 0 with ourselves as the only member.
    pub fn create(
        env: E,
        conversation_id: ConversationId,
        member_id: MemberId,
        config: GroupConfig,
    ) -> Result<(Self, Vec<MlsAction>), MlsError> {
        let provider = MlsProvider::new(env, member_id);
        let (signer, credential_with_key) = member_credential(member_id)?;

        let mls_group = openmls::group::MlsGroup::new(
            &provider,
            &signer,
            &config.create_config(),
            credential_with_key,
        )
        .map_err(|e| MlsError::Crypto(format!("failed to create MLS group: {e}")))?;

        let group = Self { conversation_id, member_id, mls_group, signer, provider };
        tracing::info!(conversation_id, member_id, "created conversation group");

        let actions = vec![group.record_current_epoch()?];
        Ok((group, actions))
    }

    /// Key package for joining someone else's group.
    ///
    /// Returns the serialized key package plus the private state that must be
    /// kept until the Welcome arrives.
    pub fn generate_key_package(
        env: E,
        member_id: MemberId,
    ) -> Result<(Vec<u8>, PendingJoinState<E>), MlsError> {
        let provider = MlsProvider::new(env, member_id);
        let (signer, credential_with_key) = member_credential(member_id)?;

        let bundle = KeyPackage::builder()
            .build(CIPHERSUITE, &provider, &signer, credential_with_key)
            .map_err(|e| MlsError::Crypto(format!("failed to build key package: {e}")))?;

        let serialized = bundle
            .key_package()
            .tls_serialize_detached()
            .map_err(|e| MlsError::Serialization(format!("failed to serialize key package: {e}")))?;

        tracing::debug!(member_id = provider.member_id(), "generated key package");
        Ok((serialized, PendingJoinState { provider, signer }))
    }

    /// Join a group from a Welcome.
    pub fn join_from_welcome(
        conversation_id: ConversationId,
        member_id: MemberId,
        welcome_bytes: &[u8],
        pending: PendingJoinState<E>,
        config: GroupConfig,
    ) -> Result<(Self, Vec<MlsAction>), MlsError> {
        let PendingJoinState { provider, signer } = pending;

        let message = MlsMessageIn::tls_deserialize_exact(welcome_bytes)
            .map_err(|e| MlsError::Serialization(format!("failed to decode Welcome: {e}")))?;
        let MlsMessageBodyIn::Welcome(welcome) = message.extract() else {
            return Err(MlsError::UnexpectedContent("expected a Welcome"));
        };

        let mls_group =
            StagedWelcome::new_from_welcome(&provider, &config.join_config(), welcome, None)
                .map_err(|e| MlsError::Crypto(format!("failed to stage Welcome: {e}")))?
                .into_group(&provider)
                .map_err(|e| MlsError::Crypto(format!("failed to join from Welcome: {e}")))?;

        let group = Self { conversation_id, member_id, mls_group, signer, provider };
        tracing::info!(conversation_id, member_id, epoch = group.epoch(), "joined from Welcome");

        let actions = vec![group.record_current_epoch()?];
        Ok((group, actions))
    }

    /// Current epoch.
    pub fn epoch(&self) -> u64 {
        self.mls_group.epoch().as_u64()
    }

    /// Conversation this group belongs to.
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Our member id.
    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    /// Member ids currently in the group.
    pub fn members(&self) -> Vec<MemberId> {
        self.mls_group
            .members()
            .filter_map(|m| member_id_of(m.credential.serialized_content()))
            .collect()
    }

    /// Whether we have staged a commit that is not merged yet.
    pub fn has_pending_commit(&self) -> bool {
        self.mls_group.pending_commit().is_some()
    }

    /// Export the current epoch's secret.
    ///
    /// Context binds the secret to the conversation id.
    pub fn export_epoch_secret(&self) -> Result<EpochSecret, MlsError> {
        let bytes = self
            .mls_group
            .export_secret(
                self.provider.crypto(),
                EPOCH_SECRET_LABEL,
                &self.conversation_id.to_be_bytes(),
                EPOCH_SECRET_SIZE,
            )
            .map_err(|e| MlsError::Crypto(format!("failed to export epoch secret: {e}")))?;
        EpochSecret::from_slice(&bytes).map_err(|e| MlsError::Crypto(e.to_string()))
    }

    /// Stage a commit adding the members behind `key_packages_bytes`.
    ///
    /// The epoch does not change until [`Self::merge_pending_commit`].
    pub fn add_members_from_bytes(
        &mut self,
        key_packages_bytes: &[Vec<u8>],
    ) -> Result<Vec<MlsAction>, MlsError> {
        let key_packages = key_packages_bytes
            .iter()
            .map(|bytes| {
                let kp_in = KeyPackageIn::tls_deserialize(&mut bytes.as_slice())
                    .map_err(|e| MlsError::Serialization(format!("invalid key package: {e}")))?;
                kp_in.validate(self.provider.crypto(), ProtocolVersion::Mls10).map_err(|e| {
                    MlsError::Crypto(format!("invalid key package signature: {e:?}"))
                })
            })
            .collect::<Result<Vec<KeyPackage>, MlsError>>()?;

        let recipients = key_packages
            .iter()
            .filter_map(|kp| member_id_of(kp.leaf_node().credential().serialized_content()))
            .collect();

        let (commit, welcome, _group_info) = self
            .mls_group
            .add_members(&self.provider, &self.signer, &key_packages)
            .map_err(|e| MlsError::Crypto(format!("failed to add members: {e}")))?;

        let commit = commit
            .tls_serialize_detached()
            .map_err(|e| MlsError::Serialization(format!("failed to serialize commit: {e}")))?;
        let welcome = welcome
            .tls_serialize_detached()
            .map_err(|e| MlsError::Serialization(format!("failed to serialize Welcome: {e}")))?;

        Ok(vec![MlsAction::SendCommit(commit), MlsAction::SendWelcome { recipients, welcome }])
    }

    /// Merge our own staged commit after the server accepted it.
    pub fn merge_pending_commit(&mut self) -> Result<Vec<MlsAction>, MlsError> {
        if !self.has_pending_commit() {
            return Err(MlsError::NoPendingCommit);
        }
        let old_epoch = self.epoch();

        self.mls_group
            .merge_pending_commit(&self.provider)
            .map_err(|e| MlsError::Crypto(format!("failed to merge pending commit: {e}")))?;

        debug_assert!(self.epoch() > old_epoch, "epoch must increase after merge");
        tracing::debug!(
            conversation_id = self.conversation_id,
            epoch = self.epoch(),
            "merged own commit"
        );
        Ok(vec![self.record_current_epoch()?])
    }

    /// Process a handshake message from another member.
    ///
    /// Commits advance the epoch and yield `RecordEpochKey`; proposals are
    /// logged and otherwise ignored. Application content never travels over
    /// this path.
    pub fn process_handshake(&mut self, bytes: &[u8]) -> Result<Vec<MlsAction>, MlsError> {
        let message = MlsMessageIn::tls_deserialize_exact(bytes)
            .map_err(|e| MlsError::Serialization(format!("failed to decode MLS message: {e}")))?;
        let protocol_message: ProtocolMessage = message
            .try_into()
            .map_err(|e| MlsError::Serialization(format!("not a protocol message: {e:?}")))?;

        let processed = self
            .mls_group
            .process_message(&self.provider, protocol_message)
            .map_err(|e| MlsError::Crypto(format!("failed to process message: {e}")))?;

        match processed.into_content() {
            ProcessedMessageContent::StagedCommitMessage(staged_commit) => {
                let old_epoch = self.epoch();
                self.mls_group
                    .merge_staged_commit(&self.provider, *staged_commit)
                    .map_err(|e| MlsError::Crypto(format!("failed to merge commit: {e}")))?;
                debug_assert!(self.epoch() > old_epoch, "epoch must increase after commit");

                if !self.mls_group.is_active() {
                    tracing::info!(conversation_id = self.conversation_id, "removed from group");
                    return Ok(vec![MlsAction::RemoveGroup {
                        reason: "removed from group by commit".to_string(),
                    }]);
                }
                Ok(vec![self.record_current_epoch()?])
            },
            ProcessedMessageContent::ProposalMessage(_)
            | ProcessedMessageContent::ExternalJoinProposalMessage(_) => {
                tracing::debug!(
                    conversation_id = self.conversation_id,
                    epoch = self.epoch(),
                    "ignoring proposal"
                );
                Ok(Vec::new())
            },
            ProcessedMessageContent::ApplicationMessage(_) => {
                Err(MlsError::UnexpectedContent("application message on handshake path"))
            },
        }
    }

    fn record_current_epoch(&self) -> Result<MlsAction, MlsError> {
        Ok(MlsAction::RecordEpochKey {
            conversation_id: self.conversation_id,
            epoch: self.epoch(),
            secret: self.export_epoch_secret()?,
        })
    }
}
