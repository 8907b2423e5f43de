//! Durable storage for the client runtime.
//!
//! - [`RedbStorage`]: Secure Key Store and Durable Message Store in one redb
//!   file, epoch secrets sealed under the device master key
//! - [`master_key`]: where that master key comes from

pub mod master_key;
mod redb;

pub use lockstep_core::storage::{ChaoticStorage, MemoryStorage, StorageError};
pub use master_key::{KeychainMasterKey, MasterKeySource, StaticMasterKey};

pub use self::redb::RedbStorage;
