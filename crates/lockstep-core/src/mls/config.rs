//! Group tuning.

use openmls::prelude::{
    MlsGroupCreateConfig, MlsGroupJoinConfig, PURE_CIPHERTEXT_WIRE_FORMAT_POLICY,
    SenderRatchetConfiguration,
};

/// Tuning applied to every conversation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupConfig {
    /// Past epochs whose MLS state OpenMLS keeps for late handshake messages
    pub max_past_epochs: usize,
    /// Out-of-order generations tolerated by the MLS secret tree
    pub out_of_order_tolerance: u32,
    /// Maximum forward jump in generations
    pub maximum_forward_distance: u32,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self { max_past_epochs: 5, out_of_order_tolerance: 10, maximum_forward_distance: 2000 }
    }
}

impl GroupConfig {
    pub(crate) fn create_config(&self) -> MlsGroupCreateConfig {
        MlsGroupCreateConfig::builder()
            .ciphersuite(super::group::CIPHERSUITE)
            .use_ratchet_tree_extension(true)
            .wire_format_policy(PURE_CIPHERTEXT_WIRE_FORMAT_POLICY)
            .max_past_epochs(self.max_past_epochs)
            .sender_ratchet_configuration(self.sender_ratchet())
            .build()
    }

    pub(crate) fn join_config(&self) -> MlsGroupJoinConfig {
        MlsGroupJoinConfig::builder()
            .use_ratchet_tree_extension(true)
            .wire_format_policy(PURE_CIPHERTEXT_WIRE_FORMAT_POLICY)
            .max_past_epochs(self.max_past_epochs)
            .sender_ratchet_configuration(self.sender_ratchet())
            .build()
    }

    fn sender_ratchet(&self) -> SenderRatchetConfiguration {
        SenderRatchetConfiguration::new(self.out_of_order_tolerance, self.maximum_forward_distance)
    }
}
