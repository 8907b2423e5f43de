//! Runtime configuration.

use std::time::Duration;

use lockstep_core::{
    PlaintextCacheMode, RecoveryConfig, RetentionWindow,
    delivery::DEFAULT_GAP_TIMEOUT,
    recovery::{DEFAULT_BACKOFF_BASE, DEFAULT_MAX_ATTEMPTS, DEFAULT_PAGE_SIZE},
    retention::DEFAULT_CLEANUP_INTERVAL,
};

/// Pipeline configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// How long epoch keys stay on the device
    pub retention: RetentionWindow,
    /// Time between background cleanup passes
    pub cleanup_interval: Duration,
    /// How long a gap may stay open before recovery is forced
    pub gap_timeout: Duration,
    /// How often the gap monitor checks for timed-out gaps
    pub gap_check_interval: Duration,
    /// History page size used for recovery and initial loads
    pub page_size: usize,
    /// Fetch attempts before a recovery gives up
    pub recovery_attempts: u32,
    /// First retry delay; doubles on each further attempt
    pub recovery_backoff: Duration,
    /// Fetch the missing range as soon as a gap opens
    pub proactive_recovery: bool,
    /// In-memory plaintext caching
    pub plaintext_cache: PlaintextCacheMode,
    /// First sequence expected in a conversation with no history
    pub sequence_baseline: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retention: RetentionWindow::default(),
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            gap_timeout: DEFAULT_GAP_TIMEOUT,
            gap_check_interval: Duration::from_secs(30),
            page_size: DEFAULT_PAGE_SIZE,
            recovery_attempts: DEFAULT_MAX_ATTEMPTS,
            recovery_backoff: DEFAULT_BACKOFF_BASE,
            proactive_recovery: true,
            plaintext_cache: PlaintextCacheMode::Disabled,
            sequence_baseline: 1,
        }
    }
}

impl ClientConfig {
    /// Recovery tuning derived from this configuration.
    pub fn recovery(&self) -> RecoveryConfig {
        RecoveryConfig {
            page_size: self.page_size,
            max_attempts: self.recovery_attempts.max(1),
            backoff_base: self.recovery_backoff,
            proactive: self.proactive_recovery,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.retention, RetentionWindow::THIRTY_DAYS);
        assert_eq!(config.cleanup_interval, Duration::from_secs(24 * 60 * 60));
        assert_eq!(config.gap_timeout, Duration::from_secs(5 * 60));
        assert_eq!(config.page_size, 100);
        assert_eq!(config.plaintext_cache, PlaintextCacheMode::Disabled);
    }

    #[test]
    fn recovery_needs_at_least_one_attempt() {
        let config = ClientConfig { recovery_attempts: 0, ..ClientConfig::default() };
        assert_eq!(config.recovery().max_attempts, 1);
    }
}
