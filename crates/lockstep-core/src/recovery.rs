//! Gap Recovery Coordinator.
//!
//! Decides when to fetch a missing range from history and what to do with the
//! result. Sans-IO: it never performs the fetch itself. Drivers call
//! [`RecoveryCoordinator::on_gap`] / [`RecoveryCoordinator::poll_timeouts`] to
//! obtain [`FetchRequest`]s, execute them, and report back through
//! `on_fetch_success` / `on_fetch_failure` / `on_fetch_cancelled`.
//!
//! ```text
//!  Idle ──gap──► GapDetected ──proactive | timeout──► Recovering
//!   ▲                 ▲                                  │
//!   │                 └──── cancelled | deferred ────────┤
//!   └──────── Resolved | Skipped | Cleared ◄─────────────┘
//! ```
//!
//! At most one fetch is in flight per conversation, and the gap timeout
//! starts at most one recovery per missing range.
//!
//! A hole is only skipped or cleared once it has been open for the full gap
//! timeout. Before that, a fetch that cannot fill it defers: the conversation
//! returns to `GapDetected` and late arrivals still get their chance.

use std::{
    collections::HashMap,
    ops::Sub,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::{
    delivery::OrderedDelivery,
    message::{ConversationId, Message},
};

/// Default number of messages requested per history page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Default number of fetch attempts before the buffer is cleared.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry. Doubles on every retry.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Recovery tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// Messages requested per history page
    pub page_size: usize,
    /// Fetch attempts before giving up and clearing the buffer
    pub max_attempts: u32,
    /// Delay before the first retry
    pub backoff_base: Duration,
    /// Fetch as soon as a gap opens instead of waiting for the timeout
    pub proactive: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            proactive: true,
        }
    }
}

/// What started a recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryTrigger {
    /// First out-of-order arrival
    Proactive,
    /// Gap stayed open for the full timeout
    GapTimeout,
    /// Explicit request from the application (e.g. reconnect)
    Manual,
}

/// Public view of a conversation's recovery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// No gap
    Idle,
    /// A gap is open and no fetch is running
    GapDetected,
    /// A fetch is running or waiting to retry
    Recovering {
        /// 1-based attempt number
        attempt: u32,
        /// What started this recovery
        trigger: RecoveryTrigger,
    },
}

/// Instruction to fetch history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    /// Conversation to fetch
    pub conversation_id: ConversationId,
    /// Fetch messages with sequence strictly greater than this
    pub after_sequence: u64,
    /// Page size
    pub limit: usize,
    /// 1-based attempt number
    pub attempt: u32,
    /// What started this recovery
    pub trigger: RecoveryTrigger,
}

/// Result of a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Gap filled. `released` is the run that became contiguous.
    Resolved {
        /// Messages released in order
        released: Vec<Message>,
    },
    /// The server does not hold the missing sequences; they were skipped and
    /// the first message after each hole carries `gap_before`.
    Skipped {
        /// Messages released in order
        released: Vec<Message>,
        /// Inclusive ranges that were skipped
        skipped: Vec<(u64, u64)>,
    },
    /// The server does not hold the missing sequences yet, and the gap is
    /// younger than the timeout. Nothing was skipped; the gap stays open.
    Deferred {
        /// Messages released in order
        released: Vec<Message>,
        /// First range still missing
        missing: (u64, u64),
    },
    /// The page was full and stopped short of the hole; fetch the next one.
    NextPage {
        /// Messages released so far
        released: Vec<Message>,
        /// Follow-up request
        request: FetchRequest,
    },
}

/// Result of a failed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Retry `request` after `delay`.
    Retry {
        /// Backoff delay
        delay: Duration,
        /// Follow-up request
        request: FetchRequest,
    },
    /// Attempts exhausted (or the error is permanent): held messages were
    /// dropped from the buffer.
    Cleared {
        /// Messages removed from the buffer
        discarded: Vec<Message>,
    },
    /// Attempts exhausted before the gap timed out. The buffer is kept and
    /// the gap timeout gets the final say.
    Deferred,
}

#[derive(Debug, Clone, Copy)]
enum Phase<I> {
    GapDetected {
        since: I,
        /// Hole start for which the timeout already fired
        timeout_fired_for: Option<u64>,
    },
    Recovering {
        attempt: u32,
        trigger: RecoveryTrigger,
    },
}

/// Per-conversation recovery state machine.
#[derive(Debug)]
pub struct RecoveryCoordinator<I> {
    config: RecoveryConfig,
    phases: Mutex<HashMap<ConversationId, Phase<I>>>,
}

impl<I> RecoveryCoordinator<I>
where
    I: Copy + Ord + Sub<Output = Duration> + std::fmt::Debug,
{
    /// Coordinator with the given tuning.
    pub fn new(config: RecoveryConfig) -> Self {
        Self { config, phases: Mutex::new(HashMap::new()) }
    }

    /// Tuning in use.
    pub fn config(&self) -> RecoveryConfig {
        self.config
    }

    /// Current state of a conversation.
    pub fn state(&self, conversation_id: ConversationId) -> RecoveryState {
        match self.lock().get(&conversation_id) {
            None => RecoveryState::Idle,
            Some(Phase::GapDetected { .. }) => RecoveryState::GapDetected,
            Some(Phase::Recovering { attempt, trigger }) => {
                RecoveryState::Recovering { attempt: *attempt, trigger: *trigger }
            },
        }
    }

    /// A message was buffered behind a gap.
    ///
    /// Moves `Idle` to `GapDetected`. With proactive recovery enabled, also
    /// starts a fetch right away.
    pub fn on_gap(
        &self,
        conversation_id: ConversationId,
        delivery: &OrderedDelivery<I>,
        now: I,
    ) -> Option<FetchRequest> {
        let mut phases = self.lock();
        if phases.contains_key(&conversation_id) {
            return None;
        }

        tracing::debug!(conversation_id, "gap detected");
        phases.insert(conversation_id, Phase::GapDetected { since: now, timeout_fired_for: None });
        if !self.config.proactive {
            return None;
        }
        drop(phases);
        self.begin(conversation_id, delivery, RecoveryTrigger::Proactive)
    }

    /// The buffer drained on its own (late arrivals filled the gap).
    pub fn on_released(&self, conversation_id: ConversationId, delivery: &OrderedDelivery<I>) {
        if delivery.missing_range(conversation_id).is_some() {
            return;
        }
        let mut phases = self.lock();
        if matches!(phases.get(&conversation_id), Some(Phase::GapDetected { .. })) {
            phases.remove(&conversation_id);
            tracing::debug!(conversation_id, "gap closed by late arrivals");
        }
    }

    /// Start a recovery for every gap that outlived the timeout.
    ///
    /// Each missing range triggers at most one timeout-driven recovery.
    pub fn poll_timeouts(&self, delivery: &OrderedDelivery<I>, now: I) -> Vec<FetchRequest> {
        let mut requests = Vec::new();
        for conversation_id in delivery.timed_out(now) {
            let Some(hole_start) = delivery.missing_range(conversation_id).map(|r| *r.start())
            else {
                continue;
            };

            {
                let mut phases = self.lock();
                match phases.get_mut(&conversation_id) {
                    Some(Phase::Recovering { .. }) => continue,
                    Some(Phase::GapDetected { timeout_fired_for, .. }) => {
                        if *timeout_fired_for == Some(hole_start) {
                            continue;
                        }
                        *timeout_fired_for = Some(hole_start);
                    },
                    None => {
                        phases.insert(
                            conversation_id,
                            Phase::GapDetected { since: now, timeout_fired_for: Some(hole_start) },
                        );
                    },
                }
            }

            tracing::info!(conversation_id, hole_start, "gap timeout, starting recovery");
            if let Some(request) = self.begin(conversation_id, delivery, RecoveryTrigger::GapTimeout)
            {
                requests.push(request);
            }
        }
        requests
    }

    /// Start a recovery on demand. `None` if there is no gap or a fetch is
    /// already running.
    pub fn request(
        &self,
        conversation_id: ConversationId,
        delivery: &OrderedDelivery<I>,
        now: I,
    ) -> Option<FetchRequest> {
        delivery.missing_range(conversation_id)?;
        self.lock()
            .entry(conversation_id)
            .or_insert(Phase::GapDetected { since: now, timeout_fired_for: None });
        self.begin(conversation_id, delivery, RecoveryTrigger::Manual)
    }

    /// Feed a fetched page into the buffer and decide what comes next.
    ///
    /// `emit` receives each released run while the conversation lock is held.
    pub fn on_fetch_success(
        &self,
        request: &FetchRequest,
        page: Vec<Message>,
        delivery: &OrderedDelivery<I>,
        now: I,
        mut emit: impl FnMut(&[Message]),
    ) -> FetchOutcome {
        let conversation_id = request.conversation_id;
        let page_len = page.len();
        let page_max = page
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .map(|m| m.sequence)
            .max();
        let progressed = page_max.is_some_and(|max| max > request.after_sequence);
        if page_len >= request.limit && !progressed {
            tracing::warn!(
                conversation_id,
                after = request.after_sequence,
                "history page did not advance past cursor, treating as complete"
            );
        }
        let page_complete = page_len < request.limit || !progressed;
        let may_give_up = self.may_give_up(request, delivery, now);

        let mut released = delivery.submit_batch_with(conversation_id, page, now, &mut emit);
        let mut skipped = Vec::new();

        while let Some(hole) = delivery.missing_range(conversation_id) {
            let covered = page_complete || page_max.is_some_and(|max| max > *hole.end());
            if !covered {
                let after_sequence = page_max.unwrap_or(request.after_sequence);
                let next = FetchRequest { after_sequence, ..*request };
                tracing::debug!(conversation_id, after_sequence, "history page full, fetching next");
                return FetchOutcome::NextPage { released, request: next };
            }

            if !may_give_up {
                let missing = (*hole.start(), *hole.end());
                self.defer(conversation_id, now);
                tracing::info!(
                    conversation_id,
                    from = missing.0,
                    to = missing.1,
                    "server does not hold missing sequences yet, waiting for gap timeout"
                );
                return FetchOutcome::Deferred { released, missing };
            }

            tracing::warn!(
                conversation_id,
                from = hole.start(),
                to = hole.end(),
                "server does not hold missing sequences, skipping gap"
            );
            skipped.push((*hole.start(), *hole.end()));
            released.extend(delivery.skip_gap_with(conversation_id, now, &mut emit));
        }

        self.lock().remove(&conversation_id);
        if skipped.is_empty() {
            tracing::info!(conversation_id, released = released.len(), "gap recovered");
            FetchOutcome::Resolved { released }
        } else {
            FetchOutcome::Skipped { released, skipped }
        }
    }

    /// A fetch failed. Retries transient failures with exponential backoff;
    /// clears the buffer once attempts are exhausted or the failure is
    /// permanent.
    pub fn on_fetch_failure(
        &self,
        request: &FetchRequest,
        transient: bool,
        delivery: &OrderedDelivery<I>,
        now: I,
    ) -> FailureOutcome {
        let conversation_id = request.conversation_id;
        if transient && request.attempt < self.config.max_attempts {
            let attempt = request.attempt + 1;
            let delay = self.backoff(request.attempt);
            self.lock()
                .insert(conversation_id, Phase::Recovering { attempt, trigger: request.trigger });
            tracing::warn!(conversation_id, attempt, ?delay, "history fetch failed, retrying");
            return FailureOutcome::Retry { delay, request: FetchRequest { attempt, ..*request } };
        }

        if !self.may_give_up(request, delivery, now) {
            self.defer(conversation_id, now);
            tracing::warn!(
                conversation_id,
                attempts = request.attempt,
                "recovery failed, keeping buffer until gap timeout"
            );
            return FailureOutcome::Deferred;
        }

        let discarded = delivery.clear_buffer(conversation_id);
        self.lock().remove(&conversation_id);
        tracing::warn!(
            conversation_id,
            attempts = request.attempt,
            discarded = discarded.len(),
            "recovery failed, buffer cleared; held messages stay on disk until next resume"
        );
        FailureOutcome::Cleared { discarded }
    }

    /// The driver stopped before the fetch finished. The gap stays open.
    pub fn on_fetch_cancelled(&self, request: &FetchRequest, now: I) {
        let mut phases = self.lock();
        if let Some(phase) = phases.get_mut(&request.conversation_id) {
            let timeout_fired_for = match request.trigger {
                RecoveryTrigger::GapTimeout => Some(request.after_sequence + 1),
                _ => None,
            };
            *phase = Phase::GapDetected { since: now, timeout_fired_for };
        }
        tracing::debug!(conversation_id = request.conversation_id, "recovery cancelled");
    }

    /// Forget a conversation's recovery state.
    pub fn reset(&self, conversation_id: ConversationId) {
        self.lock().remove(&conversation_id);
    }

    fn begin(
        &self,
        conversation_id: ConversationId,
        delivery: &OrderedDelivery<I>,
        trigger: RecoveryTrigger,
    ) -> Option<FetchRequest> {
        let hole = delivery.missing_range(conversation_id)?;
        let mut phases = self.lock();
        match phases.get(&conversation_id) {
            Some(Phase::Recovering { .. }) => return None,
            Some(Phase::GapDetected { since, .. }) => {
                tracing::trace!(conversation_id, ?since, "gap open since");
            },
            None => {},
        }
        phases.insert(conversation_id, Phase::Recovering { attempt: 1, trigger });

        Some(FetchRequest {
            conversation_id,
            after_sequence: hole.start().saturating_sub(1),
            limit: self.config.page_size,
            attempt: 1,
            trigger,
        })
    }

    /// Skipping or clearing is allowed only for timeout-driven recoveries or
    /// gaps that have already outlived the timeout.
    fn may_give_up(&self, request: &FetchRequest, delivery: &OrderedDelivery<I>, now: I) -> bool {
        request.trigger == RecoveryTrigger::GapTimeout
            || delivery.has_gap_timeout(request.conversation_id, now)
    }

    fn defer(&self, conversation_id: ConversationId, now: I) {
        self.lock()
            .insert(conversation_id, Phase::GapDetected { since: now, timeout_fired_for: None });
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.config.backoff_base.saturating_mul(1 << exponent)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConversationId, Phase<I>>> {
        self.phases.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
