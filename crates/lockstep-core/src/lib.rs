//! Lockstep Core
//!
//! Client-side message pipeline for end-to-end encrypted group conversations.
//! Everything here is Sans-IO: time and randomness come from an
//! [`env::Environment`], storage sits behind traits, and network work is
//! described as requests for the caller to execute.
//!
//! # Pipeline
//!
//! ```text
//! server ──► OrderedDelivery ──(in order)──► consumer ──► DecryptionPipeline
//!                 │    ▲                                        │
//!          gap    │    │ history pages                          │ key lookup
//!                 ▼    │                                        ▼
//!          RecoveryCoordinator                       RetentionPolicyEngine
//!                                                               │
//!                                          MLS epoch change ──► KeyStore
//! ```
//!
//! # Components
//!
//! - [`delivery::OrderedDelivery`]: per-conversation reorder buffers
//! - [`recovery::RecoveryCoordinator`]: turns gaps into history fetches
//! - [`retention::RetentionPolicyEngine`]: decides which epoch keys live
//! - [`pipeline::DecryptionPipeline`]: ciphertext to displayable plaintext
//! - [`mls::ConversationGroup`]: MLS group that exports one secret per epoch
//! - [`storage`]: key and message store traits with in-memory impls

#![forbid(unsafe_code)]

pub mod delivery;
pub mod env;
pub mod message;
pub mod mls;
pub mod pipeline;
pub mod recovery;
pub mod retention;
pub mod storage;

pub use delivery::{BufferStatus, OrderedDelivery, SubmitOutcome, SubmitReport};
pub use env::Environment;
pub use message::{ConversationId, MemberId, Message, MessageId, ProcessingState};
pub use pipeline::{
    DecryptionPipeline, DecryptionResult, DisplayableError, EpochCipher, MessageDecryptor,
    PlaintextCacheMode, PlaintextSource, PlaintextView,
};
pub use recovery::{
    FailureOutcome, FetchOutcome, FetchRequest, RecoveryConfig, RecoveryCoordinator,
    RecoveryTrigger,
};
pub use retention::{CleanupReport, KeyStatus, RetentionPolicyEngine, RetentionWindow};
pub use storage::{KeyStore, MessageStore, StorageError};
