//! Lockstep maintenance tool.
//!
//! # Usage
//!
//! ```bash
//! # Apply a retention window to a device database
//! lockstep cleanup --db ~/.lockstep/device.redb --retention 7d
//!
//! # Show stored conversations and epoch keys
//! lockstep inspect --db ~/.lockstep/device.redb
//! ```

use std::{collections::BTreeMap, path::PathBuf};

use clap::{Parser, Subcommand};
use lockstep_client::{KeychainMasterKey, MasterKeySource, RedbStorage, SystemEnv};
use lockstep_core::{
    RetentionPolicyEngine, RetentionWindow,
    storage::{KeyStore, MessageStore},
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Lockstep device storage maintenance
#[derive(Parser, Debug)]
#[command(name = "lockstep")]
#[command(about = "Inspect and maintain a Lockstep device database")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Keychain service holding the device master key
    #[arg(long, default_value = lockstep_client::storage::master_key::DEFAULT_SERVICE, global = true)]
    keychain_service: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one retention cleanup pass
    Cleanup {
        /// Path to the device database
        #[arg(long)]
        db: PathBuf,

        /// Retention window (24h, 7d, 30d, 90d, or any `<n>h` / `<n>d`)
        #[arg(long, default_value = "30d")]
        retention: RetentionWindow,
    },
    /// Summarize stored conversations and keys
    Inspect {
        /// Path to the device database
        #[arg(long)]
        db: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let master = KeychainMasterKey::new(
        args.keychain_service,
        lockstep_client::storage::master_key::DEFAULT_ACCOUNT,
    );

    match args.command {
        Command::Cleanup { db, retention } => {
            let storage = RedbStorage::open(&db, master.load_or_create()?)?;
            let engine = RetentionPolicyEngine::new(storage, SystemEnv::new(), retention);
            let report = tokio::task::spawn_blocking(move || engine.perform_cleanup()).await??;
            tracing::info!(
                %retention,
                scanned = report.scanned,
                deleted = report.deleted,
                retained = report.retained,
                failed = report.failed,
                "cleanup finished"
            );
        },
        Command::Inspect { db } => {
            let storage = RedbStorage::open(&db, master.load_or_create()?)?;
            tokio::task::spawn_blocking(move || inspect(&storage)).await??;
        },
    }

    Ok(())
}

fn inspect(storage: &RedbStorage) -> Result<(), lockstep_core::StorageError> {
    let mut keys: BTreeMap<u128, Vec<u64>> = BTreeMap::new();
    for metadata in storage.list_keys()? {
        keys.entry(metadata.conversation_id).or_default().push(metadata.epoch);
    }

    let mut conversations = storage.list_conversations()?;
    conversations.extend(keys.keys().copied());
    conversations.sort_unstable();
    conversations.dedup();

    tracing::info!(conversations = conversations.len(), "device database");
    for conversation_id in conversations {
        let epochs = keys.get(&conversation_id).map_or(&[][..], Vec::as_slice);
        let last_processed = storage.last_processed(conversation_id)?.map(|m| m.sequence);
        tracing::info!(
            conversation_id = %format_args!("{conversation_id:032x}"),
            ?epochs,
            ?last_processed,
            "conversation"
        );
    }
    Ok(())
}
