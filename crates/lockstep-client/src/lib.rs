//! Lockstep client runtime.
//!
//! Production glue around [`lockstep_core`]: a Tokio driver for the ordered
//! delivery and gap recovery state machines, redb-backed storage with epoch
//! secrets sealed under a device master key from the OS keychain, and a
//! background retention cleanup task.
//!
//! # Components
//!
//! - [`Pipeline`]: receive, recover, deliver and decrypt messages
//! - [`CleanupScheduler`]: periodic retention cleanup
//! - [`RedbStorage`]: Secure Key Store and Durable Message Store on disk
//! - [`HistoryApi`]: the server's history endpoint, implemented by the host
//! - [`SystemEnv`]: real clocks and OS randomness

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod history;
pub mod pipeline;
pub mod scheduler;
pub mod storage;
mod system_env;

pub use config::ClientConfig;
pub use error::{ClientError, HistoryError};
pub use history::{Cursor, HistoryApi, HistoryPage, MessageEvent};
pub use pipeline::{ConversationStatus, Pipeline, RecoveryResult};
pub use scheduler::CleanupScheduler;
pub use storage::{KeychainMasterKey, MasterKeySource, RedbStorage, StaticMasterKey};
pub use system_env::SystemEnv;
