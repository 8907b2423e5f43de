//! MLS (Messaging Layer Security) adapter.
//!
//! Wraps `OpenMLS` just far enough to learn when a conversation enters a new
//! epoch and to export that epoch's secret into the key store. The MLS wire
//! protocol itself is OpenMLS's business.
//!
//! # Components
//!
//! - [`group`]: Conversation group wrapper producing [`MlsAction`]s
//! - [`recorder`]: Executes `RecordEpochKey` actions against the retention
//!   engine
//! - [`config`]: Group tuning
//! - [`provider`]: `OpenMLS` provider integration
//! - [`error`]: MLS-specific error types

pub mod config;
pub mod error;
pub mod group;
pub mod provider;
pub mod recorder;

pub use config::GroupConfig;
pub use error::MlsError;
pub use group::{ConversationGroup, EPOCH_SECRET_LABEL, MlsAction, PendingJoinState};
pub use provider::MlsProvider;
pub use recorder::EpochKeyRecorder;
