//! Retention Policy Engine.
//!
//! Bounds how long epoch keys live on the device. A key older than the
//! retention window can no longer decrypt anything and is deleted by the next
//! cleanup pass (or lazily, the first time someone asks for it).
//!
//! # Invariants
//!
//! - `can_decrypt` is true iff the key exists and `now - created_at <= window`.
//! - Once `can_decrypt` has answered false for a key, it never answers true
//!   again: the key is deleted and tombstoned on the spot.
//! - Expiry is check-and-delete in one store operation.

use std::{
    fmt,
    str::FromStr,
    sync::{PoisonError, RwLock},
    time::Duration,
};

use lockstep_crypto::EpochSecret;
use thiserror::Error;

use crate::{
    env::Environment,
    message::ConversationId,
    storage::{EpochKey, KeyStore, StorageError},
};

/// Default interval between cleanup passes.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

const SECS_PER_HOUR: u64 = 60 * 60;
const SECS_PER_DAY: u64 = 24 * SECS_PER_HOUR;

/// How long epoch keys are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetentionWindow {
    /// Keep keys for this many hours
    Hours(u32),
    /// Keep keys for this many days
    Days(u32),
}

impl RetentionWindow {
    /// 24 hours
    pub const ONE_DAY: Self = Self::Hours(24);
    /// 7 days
    pub const ONE_WEEK: Self = Self::Days(7);
    /// 30 days (default)
    pub const THIRTY_DAYS: Self = Self::Days(30);
    /// 90 days
    pub const NINETY_DAYS: Self = Self::Days(90);

    /// The presets offered to users.
    pub const PRESETS: [Self; 4] =
        [Self::ONE_DAY, Self::ONE_WEEK, Self::THIRTY_DAYS, Self::NINETY_DAYS];

    /// Window length in seconds.
    pub fn as_secs(self) -> u64 {
        match self {
            Self::Hours(hours) => u64::from(hours) * SECS_PER_HOUR,
            Self::Days(days) => u64::from(days) * SECS_PER_DAY,
        }
    }

    /// Window length.
    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.as_secs())
    }
}

impl Default for RetentionWindow {
    fn default() -> Self {
        Self::THIRTY_DAYS
    }
}

impl fmt::Display for RetentionWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hours(hours) => write!(f, "{hours}h"),
            Self::Days(days) => write!(f, "{days}d"),
        }
    }
}

/// Error parsing a [`RetentionWindow`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid retention window {input:?}: expected <n>h or <n>d with n > 0")]
pub struct ParseRetentionError {
    input: String,
}

impl FromStr for RetentionWindow {
    type Err = ParseRetentionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseRetentionError { input: s.to_string() };
        let trimmed = s.trim();
        let Some((unit_at, _)) = trimmed.char_indices().last() else {
            return Err(err());
        };
        let (amount, unit) = trimmed.split_at(unit_at);
        let amount: u32 = amount.parse().map_err(|_| err())?;
        if amount == 0 {
            return Err(err());
        }
        match unit {
            "h" | "H" => Ok(Self::Hours(amount)),
            "d" | "D" => Ok(Self::Days(amount)),
            _ => Err(err()),
        }
    }
}

/// Where a key stands relative to the retention window.
#[derive(Debug, Clone)]
pub enum KeyStatus {
    /// Within the window
    Live(EpochKey),
    /// Past the window (deleted now or earlier)
    Expired {
        /// How long ago the key crossed the window
        expired_for: Duration,
    },
    /// Never stored on this device
    Missing,
}

/// Summary of one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Keys examined
    pub scanned: usize,
    /// Keys deleted
    pub deleted: usize,
    /// Keys kept
    pub retained: usize,
    /// Keys whose deletion failed and will be retried next pass
    pub failed: usize,
}

/// Applies the retention window to a [`KeyStore`].
pub struct RetentionPolicyEngine<K, E> {
    keys: K,
    env: E,
    window: RwLock<RetentionWindow>,
}

impl<K: KeyStore, E: Environment> RetentionPolicyEngine<K, E> {
    /// Engine over `keys` with the given window.
    pub fn new(keys: K, env: E, window: RetentionWindow) -> Self {
        Self { keys, env, window: RwLock::new(window) }
    }

    /// Current window.
    pub fn window(&self) -> RetentionWindow {
        *self.window.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the window. Takes effect for every later check; keys already
    /// past the new window are deleted by the next cleanup pass.
    pub fn update_policy(&self, window: RetentionWindow) {
        let previous = std::mem::replace(
            &mut *self.window.write().unwrap_or_else(PoisonError::into_inner),
            window,
        );
        tracing::info!(%previous, %window, "retention policy updated");
    }

    /// Underlying key store.
    pub fn key_store(&self) -> &K {
        &self.keys
    }

    /// Store the secret of a freshly entered epoch.
    pub fn record_epoch_key(
        &self,
        conversation_id: ConversationId,
        epoch: u64,
        secret: &EpochSecret,
    ) -> Result<(), StorageError> {
        let now = self.env.wall_clock_secs();
        self.keys.store_key(conversation_id, epoch, secret, now)?;
        tracing::debug!(conversation_id, epoch, "epoch key stored");
        Ok(())
    }

    /// Whether messages of `epoch` can still be decrypted.
    pub fn can_decrypt(
        &self,
        conversation_id: ConversationId,
        epoch: u64,
    ) -> Result<bool, StorageError> {
        Ok(matches!(self.key_status(conversation_id, epoch)?, KeyStatus::Live(_)))
    }

    /// The key for `epoch` if it is still within the window.
    pub fn live_key(
        &self,
        conversation_id: ConversationId,
        epoch: u64,
    ) -> Result<Option<EpochKey>, StorageError> {
        match self.key_status(conversation_id, epoch)? {
            KeyStatus::Live(key) => Ok(Some(key)),
            _ => Ok(None),
        }
    }

    /// Load and classify the key for `epoch`.
    ///
    /// A key found past the window is deleted immediately, so the answer can
    /// never flip back if the window is later widened.
    pub fn key_status(
        &self,
        conversation_id: ConversationId,
        epoch: u64,
    ) -> Result<KeyStatus, StorageError> {
        let now = self.env.wall_clock_secs();
        let window = self.window().as_secs();

        if let Some(key) = self.keys.load_key(conversation_id, epoch)? {
            let created = key.metadata.created_at_secs;
            let age = now.saturating_sub(created);
            if age <= window {
                return Ok(KeyStatus::Live(key));
            }

            let cutoff = now - window;
            if let Err(err) = self.keys.expire_key(conversation_id, epoch, cutoff, now) {
                tracing::warn!(conversation_id, epoch, %err, "lazy key expiry failed");
            }
            return Ok(KeyStatus::Expired { expired_for: Duration::from_secs(age - window) });
        }

        match self.keys.tombstone(conversation_id, epoch)? {
            Some(tombstone) => {
                let crossed = tombstone
                    .created_at_secs
                    .saturating_add(window)
                    .min(tombstone.deleted_at_secs);
                Ok(KeyStatus::Expired { expired_for: Duration::from_secs(now.saturating_sub(crossed)) })
            },
            None => Ok(KeyStatus::Missing),
        }
    }

    /// Delete every key past the window.
    ///
    /// A failure on one key is logged and counted; the pass continues with
    /// the rest. Only a failure to list keys aborts the pass.
    pub fn perform_cleanup(&self) -> Result<CleanupReport, StorageError> {
        let now = self.env.wall_clock_secs();
        let window = self.window();
        let keys = self.keys.list_keys()?;
        let mut report = CleanupReport { scanned: keys.len(), ..CleanupReport::default() };

        let Some(cutoff) = now.checked_sub(window.as_secs()) else {
            report.retained = keys.len();
            return Ok(report);
        };

        for key in keys {
            if key.created_at_secs >= cutoff {
                report.retained += 1;
                continue;
            }

            match self.keys.expire_key(key.conversation_id, key.epoch, cutoff, now) {
                Ok(true) => {
                    report.deleted += 1;
                    tracing::debug!(
                        conversation_id = key.conversation_id,
                        epoch = key.epoch,
                        "epoch key expired"
                    );
                },
                Ok(false) => report.retained += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(
                        conversation_id = key.conversation_id,
                        epoch = key.epoch,
                        %err,
                        "failed to expire epoch key"
                    );
                },
            }
        }

        tracing::info!(
            %window,
            scanned = report.scanned,
            deleted = report.deleted,
            retained = report.retained,
            failed = report.failed,
            "retention cleanup finished"
        );
        Ok(report)
    }
}
