//! Gap detection and recovery against a simulated history server.
//!
//! The driver below executes `FetchRequest`s the way a production driver
//! would, but synchronously, with the mock clock standing in for backoff.

use std::{collections::BTreeMap, time::Duration};

use lockstep_core::{
    Environment, FailureOutcome, FetchOutcome, FetchRequest, OrderedDelivery, RecoveryConfig,
    RecoveryCoordinator, RecoveryTrigger, SubmitOutcome,
    delivery::DEFAULT_GAP_TIMEOUT,
    env::test_utils::MockEnv,
    message::{ConversationId, Message, ProcessingState},
    recovery::RecoveryState,
};

const CONVERSATION: ConversationId = 0xC0FFEE;

fn message(sequence: u64) -> Message {
    Message {
        id: u128::from(sequence),
        conversation_id: CONVERSATION,
        sender: 2,
        epoch: 0,
        sequence,
        ciphertext: sequence.to_be_bytes().to_vec(),
        state: ProcessingState::Buffered,
        gap_before: false,
        received_at_secs: 0,
    }
}

/// Server-side history with scripted failures.
struct HistoryServer {
    messages: BTreeMap<u64, Message>,
    failures_left: u32,
    fetches: Vec<FetchRequest>,
}

impl HistoryServer {
    fn with_range(range: std::ops::RangeInclusive<u64>) -> Self {
        Self {
            messages: range.map(|s| (s, message(s))).collect(),
            failures_left: 0,
            fetches: Vec::new(),
        }
    }

    fn fetch(&mut self, request: &FetchRequest) -> Result<Vec<Message>, ()> {
        self.fetches.push(*request);
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(());
        }
        Ok(self
            .messages
            .range(request.after_sequence + 1..)
            .take(request.limit)
            .map(|(_, m)| m.clone())
            .collect())
    }
}

struct Harness {
    env: MockEnv,
    delivery: OrderedDelivery<<MockEnv as Environment>::Instant>,
    recovery: RecoveryCoordinator<<MockEnv as Environment>::Instant>,
    delivered: Vec<Message>,
}

impl Harness {
    fn new(proactive: bool) -> Self {
        Self {
            env: MockEnv::new(),
            delivery: OrderedDelivery::new(DEFAULT_GAP_TIMEOUT, 1),
            recovery: RecoveryCoordinator::new(RecoveryConfig {
                proactive,
                ..RecoveryConfig::default()
            }),
            delivered: Vec::new(),
        }
    }

    /// Deliver one live message. Returns a fetch request if one should start.
    fn receive(&mut self, sequence: u64) -> Option<FetchRequest> {
        let now = self.env.now();
        let delivered = &mut self.delivered;
        let report = self
            .delivery
            .submit_with(message(sequence), now, |run| delivered.extend_from_slice(run));
        match report.outcome {
            SubmitOutcome::Buffered { gap_opened: true, .. } => {
                self.recovery.on_gap(CONVERSATION, &self.delivery, now)
            },
            _ => {
                if !report.released.is_empty() {
                    self.recovery.on_released(CONVERSATION, &self.delivery);
                }
                None
            },
        }
    }

    /// Drive one recovery to completion.
    fn recover(&mut self, server: &mut HistoryServer, mut request: FetchRequest) -> Vec<FetchOutcome> {
        let mut outcomes = Vec::new();
        loop {
            match server.fetch(&request) {
                Ok(page) => {
                    let now = self.env.now();
                    let delivered = &mut self.delivered;
                    let outcome = self.recovery.on_fetch_success(
                        &request,
                        page,
                        &self.delivery,
                        now,
                        |run| delivered.extend_from_slice(run),
                    );
                    let next = match &outcome {
                        FetchOutcome::NextPage { request, .. } => Some(*request),
                        _ => None,
                    };
                    outcomes.push(outcome);
                    match next {
                        Some(next) => request = next,
                        None => return outcomes,
                    }
                },
                Err(()) => {
                    let now = self.env.now();
                    match self.recovery.on_fetch_failure(&request, true, &self.delivery, now) {
                        FailureOutcome::Retry { delay, request: next } => {
                            self.env.advance(delay);
                            request = next;
                        },
                        FailureOutcome::Deferred | FailureOutcome::Cleared { .. } => {
                            return outcomes;
                        },
                    }
                },
            }
        }
    }

    fn delivered_sequences(&self) -> Vec<u64> {
        self.delivered.iter().map(|m| m.sequence).collect()
    }
}

#[test]
fn late_arrivals_fill_the_gap_without_recovery() {
    let mut harness = Harness::new(false);
    for sequence in [1, 2, 5, 6] {
        assert!(harness.receive(sequence).is_none());
    }
    assert_eq!(harness.delivered_sequences(), vec![1, 2]);
    assert_eq!(harness.recovery.state(CONVERSATION), RecoveryState::GapDetected);

    harness.receive(3);
    assert_eq!(harness.delivered_sequences(), vec![1, 2, 3]);
    harness.receive(4);
    assert_eq!(harness.delivered_sequences(), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(harness.recovery.state(CONVERSATION), RecoveryState::Idle);
}

#[test]
fn gap_timeout_triggers_exactly_one_recovery() {
    let mut harness = Harness::new(false);
    for sequence in [1, 2, 5, 6] {
        harness.receive(sequence);
    }

    harness.env.advance(DEFAULT_GAP_TIMEOUT - Duration::from_secs(1));
    assert!(harness.recovery.poll_timeouts(&harness.delivery, harness.env.now()).is_empty());

    harness.env.advance(Duration::from_secs(1));
    let requests = harness.recovery.poll_timeouts(&harness.delivery, harness.env.now());
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].after_sequence, 2);
    assert_eq!(requests[0].trigger, RecoveryTrigger::GapTimeout);

    // Polling again, however late, starts nothing new for the same hole.
    for _ in 0..5 {
        harness.env.advance(DEFAULT_GAP_TIMEOUT);
        assert!(harness.recovery.poll_timeouts(&harness.delivery, harness.env.now()).is_empty());
    }

    let mut server = HistoryServer::with_range(1..=6);
    let outcomes = harness.recover(&mut server, requests[0]);
    assert!(matches!(outcomes.as_slice(), [FetchOutcome::Resolved { .. }]));
    assert_eq!(harness.delivered_sequences(), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(server.fetches.len(), 1);
}

#[test]
fn proactive_recovery_pages_through_long_gaps() {
    let mut harness = Harness::new(true);
    harness.receive(1);
    let request = harness.receive(250).expect("gap should start a fetch");
    assert_eq!(request.limit, 100);

    let mut server = HistoryServer::with_range(1..=250);
    let outcomes = harness.recover(&mut server, request);

    assert_eq!(outcomes.len(), 3);
    assert!(matches!(outcomes[0], FetchOutcome::NextPage { .. }));
    assert!(matches!(outcomes[1], FetchOutcome::NextPage { .. }));
    assert!(matches!(outcomes[2], FetchOutcome::Resolved { .. }));
    assert_eq!(harness.delivered_sequences(), (1..=250).collect::<Vec<_>>());
    assert!(harness.delivered.iter().all(|m| !m.gap_before));
}

#[test]
fn late_arrivals_after_an_empty_history_page_are_delivered() {
    let mut harness = Harness::new(true);
    harness.receive(1);
    harness.receive(2);
    let request = harness.receive(5).expect("gap should start a fetch");
    harness.receive(6);

    // History lags the live stream and has nothing past the cursor yet
    let mut server = HistoryServer::with_range(1..=2);
    let outcomes = harness.recover(&mut server, request);
    assert!(matches!(outcomes.as_slice(), [FetchOutcome::Deferred { missing: (3, 4), .. }]));
    assert_eq!(harness.recovery.state(CONVERSATION), RecoveryState::GapDetected);

    harness.env.advance(Duration::from_secs(1));
    harness.receive(3);
    harness.receive(4);
    assert_eq!(harness.delivered_sequences(), vec![1, 2, 3, 4, 5, 6]);
    assert!(harness.delivered.iter().all(|m| !m.gap_before));
    assert_eq!(harness.recovery.state(CONVERSATION), RecoveryState::Idle);
}

#[test]
fn sequences_missing_on_server_are_skipped_after_timeout() {
    let mut harness = Harness::new(true);
    harness.receive(1);
    harness.receive(2);
    let request = harness.receive(5).expect("gap should start a fetch");
    harness.receive(6);

    let mut server = HistoryServer::with_range(5..=7);
    let outcomes = harness.recover(&mut server, request);
    assert!(matches!(outcomes.as_slice(), [FetchOutcome::Deferred { .. }]));
    assert_eq!(harness.delivered_sequences(), vec![1, 2]);

    harness.env.advance(DEFAULT_GAP_TIMEOUT);
    let requests = harness.recovery.poll_timeouts(&harness.delivery, harness.env.now());
    assert_eq!(requests.len(), 1);
    let outcomes = harness.recover(&mut server, requests[0]);

    let [FetchOutcome::Skipped { skipped, .. }] = outcomes.as_slice() else {
        panic!("expected a skipped gap, got {outcomes:?}");
    };
    assert_eq!(skipped, &vec![(3, 4)]);
    assert_eq!(harness.delivered_sequences(), vec![1, 2, 5, 6, 7]);
    let five = harness.delivered.iter().find(|m| m.sequence == 5).unwrap();
    assert!(five.gap_before);
}

#[test]
fn exhausted_retries_clear_the_buffer() {
    let mut harness = Harness::new(false);
    harness.receive(1);
    harness.receive(4);
    harness.env.advance(DEFAULT_GAP_TIMEOUT);
    let requests = harness.recovery.poll_timeouts(&harness.delivery, harness.env.now());
    let request = requests[0];

    let mut server = HistoryServer::with_range(1..=4);
    server.failures_left = u32::MAX;
    let started = harness.env.elapsed();
    let outcomes = harness.recover(&mut server, request);

    assert!(outcomes.is_empty());
    assert_eq!(server.fetches.len(), 3);
    // 2s then 4s of backoff between the three attempts.
    assert_eq!(harness.env.elapsed() - started, Duration::from_secs(6));
    assert_eq!(harness.delivered_sequences(), vec![1]);
    assert!(harness.delivery.missing_range(CONVERSATION).is_none());
    assert_eq!(harness.recovery.state(CONVERSATION), RecoveryState::Idle);

    // The conversation keeps working: the next message in line is released.
    harness.receive(2);
    assert_eq!(harness.delivered_sequences(), vec![1, 2]);
}

#[test]
fn transient_failure_then_success_recovers() {
    let mut harness = Harness::new(true);
    harness.receive(1);
    let request = harness.receive(3).expect("gap should start a fetch");

    let mut server = HistoryServer::with_range(1..=3);
    server.failures_left = 1;
    let outcomes = harness.recover(&mut server, request);

    assert!(matches!(outcomes.as_slice(), [FetchOutcome::Resolved { .. }]));
    assert_eq!(server.fetches.iter().map(|r| r.attempt).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(harness.delivered_sequences(), vec![1, 2, 3]);
}
