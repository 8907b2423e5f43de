//! Async driver for the message pipeline.
//!
//! [`Pipeline`] wires the sans-IO core to the outside world: it persists
//! incoming ciphertext, feeds the ordered delivery buffers, runs gap
//! recovery against the [`HistoryApi`], and hands released messages to the
//! consumer over an unbounded channel. Released runs are sent while the
//! conversation's buffer lock is held, so the channel sees each conversation
//! in sequence order no matter how many tasks call [`Pipeline::receive`].
//!
//! Storage is synchronous and runs on Tokio's blocking pool.
//!
//! Delivery is at-least-once across a crash: a message is marked
//! `Delivered` on disk after it has been handed to the channel.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use lockstep_core::{
    BufferStatus, CleanupReport, DecryptionPipeline, DecryptionResult, DisplayableError,
    EpochCipher, FailureOutcome, FetchOutcome, FetchRequest, MessageDecryptor, OrderedDelivery,
    PlaintextView, RecoveryCoordinator, RetentionPolicyEngine, RetentionWindow, SubmitOutcome,
    env::Environment,
    message::{ConversationId, Message, ProcessingState},
    mls::{EpochKeyRecorder, MlsAction},
    recovery::RecoveryState,
    storage::{KeyStore, MessageStore, StorageError},
};
use tokio::{
    sync::{mpsc, watch},
    time::MissedTickBehavior,
};

use crate::{
    config::ClientConfig,
    error::ClientError,
    history::{Cursor, HistoryApi, MessageEvent},
    system_env::SystemEnv,
};

/// How a recovery run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryResult {
    /// Every missing message arrived
    Resolved {
        /// Messages released during the run
        released: usize,
    },
    /// The server no longer holds some sequences; they were skipped
    Skipped {
        /// Messages released during the run
        released: usize,
        /// Inclusive ranges that were skipped
        skipped: Vec<(u64, u64)>,
    },
    /// The gap is still young and could not be filled yet; it stays open
    /// for late arrivals until the gap timeout
    Deferred {
        /// Messages released during the run
        released: usize,
    },
    /// Recovery gave up and the in-memory buffer was cleared
    Cleared {
        /// Messages released before giving up
        released: usize,
        /// Held messages dropped from memory
        discarded: usize,
    },
    /// The pipeline shut down mid-recovery
    Cancelled,
}

/// Buffer and recovery state of one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationStatus {
    /// Ordering buffer snapshot
    pub buffer: BufferStatus,
    /// Recovery state machine
    pub recovery: RecoveryState,
}

/// The client-side message pipeline.
///
/// Cheap to clone; clones share all state.
pub struct Pipeline<S, H, E = SystemEnv, D = EpochCipher>
where
    S: KeyStore + MessageStore,
    H: HistoryApi,
    E: Environment,
    D: MessageDecryptor,
{
    inner: Arc<Inner<S, H, E, D>>,
}

impl<S, H, E, D> Clone for Pipeline<S, H, E, D>
where
    S: KeyStore + MessageStore,
    H: HistoryApi,
    E: Environment,
    D: MessageDecryptor,
{
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct Inner<S, H, E, D>
where
    S: KeyStore + MessageStore,
    E: Environment,
{
    config: ClientConfig,
    env: E,
    storage: S,
    history: H,
    delivery: OrderedDelivery<E::Instant>,
    recovery: RecoveryCoordinator<E::Instant>,
    retention: Arc<RetentionPolicyEngine<S, E>>,
    decryption: DecryptionPipeline<S, S, E, D>,
    recorder: EpochKeyRecorder<S, E>,
    delivered: mpsc::UnboundedSender<Message>,
    cursors: Mutex<HashMap<ConversationId, Cursor>>,
    opening: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl<S, H, E, D> Inner<S, H, E, D>
where
    S: KeyStore + MessageStore,
    E: Environment,
{
    /// Hand a released run to the consumer. Runs under the buffer lock.
    fn emit(&self, run: &[Message]) {
        for message in run {
            if self.delivered.send(message.clone()).is_err() {
                tracing::debug!(
                    conversation_id = message.conversation_id,
                    sequence = message.sequence,
                    "delivery receiver dropped"
                );
                return;
            }
        }
    }
}

impl<S, H, D> Pipeline<S, H, SystemEnv, D>
where
    S: KeyStore + MessageStore,
    H: HistoryApi,
    D: MessageDecryptor,
{
    /// Pipeline on the system clock and OS randomness.
    pub fn with_system_env(
        config: ClientConfig,
        storage: S,
        history: H,
        decryptor: D,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        Self::new(config, storage, history, SystemEnv::new(), decryptor)
    }
}

impl<S, H, E, D> Pipeline<S, H, E, D>
where
    S: KeyStore + MessageStore,
    H: HistoryApi,
    E: Environment,
    D: MessageDecryptor,
{
    /// Build a pipeline. Released messages arrive on the returned receiver,
    /// each conversation in strictly ascending sequence order.
    pub fn new(
        config: ClientConfig,
        storage: S,
        history: H,
        env: E,
        decryptor: D,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let retention = Arc::new(RetentionPolicyEngine::new(
            storage.clone(),
            env.clone(),
            config.retention,
        ));
        let decryption = DecryptionPipeline::new(
            Arc::clone(&retention),
            storage.clone(),
            decryptor,
            config.plaintext_cache,
        );
        let (delivered, receiver) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let inner = Inner {
            delivery: OrderedDelivery::new(config.gap_timeout, config.sequence_baseline),
            recovery: RecoveryCoordinator::new(config.recovery()),
            recorder: EpochKeyRecorder::new(Arc::clone(&retention)),
            retention,
            decryption,
            config,
            env,
            storage,
            history,
            delivered,
            cursors: Mutex::new(HashMap::new()),
            opening: tokio::sync::Mutex::new(()),
            shutdown,
        };
        (Self { inner: Arc::new(inner) }, receiver)
    }

    /// Configuration in use.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The retention engine shared by decryption and cleanup.
    pub fn retention(&self) -> Arc<RetentionPolicyEngine<S, E>> {
        Arc::clone(&self.inner.retention)
    }

    /// Stop background loops and in-flight recoveries. Further
    /// [`Self::receive`] calls fail with [`ClientError::Shutdown`].
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        tracing::info!("pipeline shutting down");
    }

    /// Whether [`Self::shutdown`] was called.
    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Buffer and recovery state of a conversation, if it is open.
    pub fn status(&self, conversation_id: ConversationId) -> Option<ConversationStatus> {
        let buffer = self.inner.delivery.status(conversation_id, self.inner.env.now())?;
        Some(ConversationStatus { buffer, recovery: self.inner.recovery.state(conversation_id) })
    }

    /// Last stream cursor seen for a conversation.
    pub fn resume_cursor(&self, conversation_id: ConversationId) -> Option<Cursor> {
        lock(&self.inner.cursors).get(&conversation_id).copied()
    }

    /// Open a conversation.
    ///
    /// With durable history the buffer resumes after the last processed
    /// message and re-submits anything still held on disk. Without it, the
    /// history API is paged from the beginning and the first returned
    /// sequence becomes the baseline.
    pub async fn open_conversation(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        let _opening = self.inner.opening.lock().await;
        if self.inner.delivery.contains(conversation_id) {
            return Ok(());
        }

        let has_history = self
            .blocking(move |inner| {
                Ok(!inner.storage.load_messages(conversation_id, None, 1)?.is_empty())
            })
            .await?;
        if has_history {
            self.resume_locked(conversation_id).await
        } else {
            self.initial_load(conversation_id).await
        }
    }

    /// Accept one message from the network.
    ///
    /// The ciphertext is persisted, then offered to the ordering buffer.
    /// Whatever became contiguous goes to the delivery channel. A message
    /// that opens a gap starts recovery in the background when proactive
    /// recovery is enabled.
    pub async fn receive(&self, message: Message) -> Result<SubmitOutcome, ClientError> {
        if self.is_shut_down() {
            return Err(ClientError::Shutdown);
        }
        let conversation_id = message.conversation_id;
        let sequence = message.sequence;
        self.resume(conversation_id).await?;

        let mut incoming = message;
        if incoming.received_at_secs == 0 {
            incoming.received_at_secs = self.inner.env.wall_clock_secs();
        }
        self.persist_incoming(vec![incoming.clone()]).await;

        let inner = &self.inner;
        let now = inner.env.now();
        let report = inner.delivery.submit_with(incoming, now, |run| inner.emit(run));
        self.persist_released(&report.released).await;

        match &report.outcome {
            SubmitOutcome::Buffered { missing, gap_opened: true } => {
                tracing::debug!(conversation_id, sequence, ?missing, "message opened a gap");
                if let Some(request) = inner.recovery.on_gap(conversation_id, &inner.delivery, now) {
                    self.spawn_recovery(request);
                }
            },
            SubmitOutcome::Duplicate => {
                tracing::debug!(conversation_id, sequence, "duplicate message dropped");
            },
            _ if !report.released.is_empty() => {
                inner.recovery.on_released(conversation_id, &inner.delivery);
            },
            _ => {},
        }
        Ok(report.outcome)
    }

    /// Start a recovery on demand. `None` if there is no gap or one is
    /// already being recovered.
    pub async fn request_recovery(&self, conversation_id: ConversationId) -> Option<RecoveryResult> {
        let inner = &self.inner;
        let request = inner.recovery.request(conversation_id, &inner.delivery, inner.env.now())?;
        Some(self.recover(request).await)
    }

    /// Run one recovery to completion: fetch pages, retry with backoff, and
    /// skip or clear as the coordinator decides.
    pub async fn recover(&self, mut request: FetchRequest) -> RecoveryResult {
        let inner = &self.inner;
        let conversation_id = request.conversation_id;
        let mut released_total = 0;

        loop {
            tracing::debug!(
                conversation_id,
                after = request.after_sequence,
                attempt = request.attempt,
                trigger = ?request.trigger,
                "fetching history page"
            );
            let fetch = inner.history.get_messages(
                conversation_id,
                request.limit,
                Some(Cursor(request.after_sequence)),
            );
            let result = tokio::select! {
                result = fetch => result,
                () = stopped(inner.shutdown.subscribe()) => {
                    inner.recovery.on_fetch_cancelled(&request, inner.env.now());
                    return RecoveryResult::Cancelled;
                },
            };

            match result {
                Ok(page) => {
                    self.persist_incoming(page.messages.clone()).await;
                    let outcome = inner.recovery.on_fetch_success(
                        &request,
                        page.messages,
                        &inner.delivery,
                        inner.env.now(),
                        |run| inner.emit(run),
                    );
                    match outcome {
                        FetchOutcome::Resolved { released } => {
                            self.persist_released(&released).await;
                            return RecoveryResult::Resolved {
                                released: released_total + released.len(),
                            };
                        },
                        FetchOutcome::Skipped { released, skipped } => {
                            self.persist_released(&released).await;
                            return RecoveryResult::Skipped {
                                released: released_total + released.len(),
                                skipped,
                            };
                        },
                        FetchOutcome::Deferred { released, .. } => {
                            self.persist_released(&released).await;
                            return RecoveryResult::Deferred {
                                released: released_total + released.len(),
                            };
                        },
                        FetchOutcome::NextPage { released, request: next } => {
                            self.persist_released(&released).await;
                            released_total += released.len();
                            request = next;
                        },
                    }
                },
                Err(err) => {
                    tracing::warn!(conversation_id, attempt = request.attempt, %err, "history fetch failed");
                    let outcome = inner.recovery.on_fetch_failure(
                        &request,
                        err.is_transient(),
                        &inner.delivery,
                        inner.env.now(),
                    );
                    match outcome {
                        FailureOutcome::Retry { delay, request: next } => {
                            tokio::select! {
                                () = inner.env.sleep(delay) => request = next,
                                () = stopped(inner.shutdown.subscribe()) => {
                                    inner.recovery.on_fetch_cancelled(&next, inner.env.now());
                                    return RecoveryResult::Cancelled;
                                },
                            }
                        },
                        FailureOutcome::Deferred => {
                            return RecoveryResult::Deferred { released: released_total };
                        },
                        FailureOutcome::Cleared { discarded } => {
                            return RecoveryResult::Cleared {
                                released: released_total,
                                discarded: discarded.len(),
                            };
                        },
                    }
                },
            }
        }
    }

    /// Periodically start recovery for gaps that outlived the gap timeout.
    /// Returns on shutdown.
    pub async fn run_gap_monitor(&self) {
        let inner = &self.inner;
        let mut ticker = tokio::time::interval(inner.config.gap_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let stop = stopped(inner.shutdown.subscribe());
        tokio::pin!(stop);

        loop {
            tokio::select! {
                () = &mut stop => break,
                _ = ticker.tick() => {
                    for request in inner.recovery.poll_timeouts(&inner.delivery, inner.env.now()) {
                        self.spawn_recovery(request);
                    }
                },
            }
        }
        tracing::debug!("gap monitor stopped");
    }

    /// Feed a real-time stream into the pipeline until it closes or the
    /// pipeline shuts down. Remembers the newest cursor per conversation.
    pub async fn run_stream(&self, mut events: mpsc::Receiver<MessageEvent>) {
        let stop = stopped(self.inner.shutdown.subscribe());
        tokio::pin!(stop);

        loop {
            let event = tokio::select! {
                () = &mut stop => break,
                event = events.recv() => event,
            };
            let Some(MessageEvent { cursor, message }) = event else { break };

            let conversation_id = message.conversation_id;
            match self.receive(message).await {
                Ok(_) => {
                    let mut cursors = lock(&self.inner.cursors);
                    let entry = cursors.entry(conversation_id).or_insert(cursor);
                    *entry = (*entry).max(cursor);
                },
                Err(ClientError::Shutdown) => break,
                Err(err) => {
                    tracing::warn!(conversation_id, %err, "failed to ingest streamed message");
                },
            }
        }
        tracing::debug!("message stream ended");
    }

    /// Decrypt one delivered message for display.
    pub async fn decrypt_message(
        &self,
        message: Message,
        conversation_id: ConversationId,
    ) -> Result<PlaintextView, DisplayableError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.decryption.decrypt_message(&message, conversation_id))
            .await
            .unwrap_or_else(|err| {
                Err(DisplayableError::DecryptionFailed { reason: err.to_string(), retryable: true })
            })
    }

    /// Decrypt a batch. Results are in ascending sequence order and each
    /// message succeeds or fails on its own.
    pub async fn decrypt_messages(
        &self,
        messages: Vec<Message>,
        conversation_id: ConversationId,
    ) -> Vec<DecryptionResult> {
        let inner = Arc::clone(&self.inner);
        let fallback: Vec<_> = messages.iter().map(|m| (m.id, m.sequence)).collect();
        match tokio::task::spawn_blocking(move || {
            inner.decryption.decrypt_messages(&messages, conversation_id)
        })
        .await
        {
            Ok(results) => results,
            Err(err) => {
                let mut fallback = fallback;
                fallback.sort_by_key(|(_, sequence)| *sequence);
                fallback
                    .into_iter()
                    .map(|(message_id, sequence)| DecryptionResult {
                        message_id,
                        sequence,
                        result: Err(DisplayableError::DecryptionFailed {
                            reason: err.to_string(),
                            retryable: true,
                        }),
                    })
                    .collect()
            },
        }
    }

    /// Whether messages of `epoch` can still be decrypted.
    pub async fn can_decrypt_message(&self, conversation_id: ConversationId, epoch: u64) -> bool {
        self.blocking(move |inner| Ok(inner.decryption.can_decrypt_message(conversation_id, epoch)))
            .await
            .unwrap_or(false)
    }

    /// Remember the plaintext of a message this device sent.
    pub fn remember_sent(&self, message: &Message, plaintext: &[u8]) {
        self.inner.decryption.remember_sent(message, plaintext);
    }

    /// Change the retention window and apply it right away.
    ///
    /// Takes effect for decryption immediately; the cleanup pass that
    /// follows deletes keys that fell outside the new window.
    pub async fn set_retention_policy(
        &self,
        window: RetentionWindow,
    ) -> Result<CleanupReport, ClientError> {
        self.inner.retention.update_policy(window);
        self.blocking(|inner| inner.retention.perform_cleanup()).await
    }

    /// Store the epoch secrets carried by MLS actions. Returns the actions
    /// the caller still has to execute.
    pub async fn record_epoch_keys(
        &self,
        actions: Vec<MlsAction>,
    ) -> Result<Vec<MlsAction>, ClientError> {
        self.blocking(move |inner| Ok(inner.recorder.apply(actions))).await
    }

    fn spawn_recovery(&self, request: FetchRequest) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let conversation_id = request.conversation_id;
            let result = pipeline.recover(request).await;
            tracing::debug!(conversation_id, ?result, "recovery finished");
        });
    }

    async fn resume(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        if self.inner.delivery.contains(conversation_id) {
            return Ok(());
        }
        let _opening = self.inner.opening.lock().await;
        if self.inner.delivery.contains(conversation_id) {
            return Ok(());
        }
        self.resume_locked(conversation_id).await
    }

    /// Rebuild a buffer from durable storage. Caller holds `opening`.
    async fn resume_locked(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        let page_size = self.inner.config.page_size.max(1);
        let (last, held) = self
            .blocking(move |inner| {
                let last = inner.storage.last_processed(conversation_id)?;
                let mut after = last.as_ref().map(|m| m.sequence);
                let mut held = Vec::new();
                loop {
                    let batch = inner.storage.load_messages(conversation_id, after, page_size)?;
                    let done = batch.len() < page_size;
                    after = batch.last().map(|m| m.sequence).or(after);
                    held.extend(batch.into_iter().filter(|m| !m.state.is_processed()));
                    if done {
                        break;
                    }
                }
                Ok((last, held))
            })
            .await?;

        let next_expected = last.map_or(self.inner.config.sequence_baseline, |m| m.sequence + 1);
        self.inner.delivery.open(conversation_id, next_expected);
        tracing::info!(conversation_id, next_expected, held = held.len(), "conversation resumed");

        if !held.is_empty() {
            self.submit_batch(conversation_id, held).await;
        }
        Ok(())
    }

    /// First open of a conversation this device has no history for.
    async fn initial_load(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        let inner = &self.inner;
        let limit = inner.config.page_size.max(1);
        let mut since = None;
        let mut loaded = 0;

        loop {
            let page = inner.history.get_messages(conversation_id, limit, since).await?;
            if since.is_none() && !inner.delivery.contains(conversation_id) {
                let baseline = page
                    .messages
                    .iter()
                    .filter(|m| m.conversation_id == conversation_id)
                    .map(|m| m.sequence)
                    .min()
                    .unwrap_or(inner.config.sequence_baseline);
                inner.delivery.open(conversation_id, baseline);
            }

            let count = page.messages.len();
            loaded += count;
            self.persist_incoming(page.messages.clone()).await;
            self.submit_batch(conversation_id, page.messages).await;

            match page.cursor {
                Some(cursor) if count >= limit => since = Some(cursor),
                _ => break,
            }
        }
        tracing::info!(conversation_id, loaded, "initial history loaded");
        Ok(())
    }

    async fn submit_batch(&self, conversation_id: ConversationId, messages: Vec<Message>) {
        let inner = &self.inner;
        let now = inner.env.now();
        let released =
            inner.delivery.submit_batch_with(conversation_id, messages, now, |run| inner.emit(run));
        self.persist_released(&released).await;

        if inner.delivery.missing_range(conversation_id).is_some() {
            if let Some(request) = inner.recovery.on_gap(conversation_id, &inner.delivery, now) {
                self.spawn_recovery(request);
            }
        } else if !released.is_empty() {
            inner.recovery.on_released(conversation_id, &inner.delivery);
        }
    }

    /// Store ciphertext as `Buffered`. Failures are logged; the message still
    /// flows through memory.
    async fn persist_incoming(&self, mut messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let now_secs = self.inner.env.wall_clock_secs();
        for message in &mut messages {
            message.state = ProcessingState::Buffered;
            message.gap_before = false;
            if message.received_at_secs == 0 {
                message.received_at_secs = now_secs;
            }
        }
        let result = self
            .blocking(move |inner| {
                for message in &messages {
                    inner.storage.store_message(message)?;
                }
                Ok(())
            })
            .await;
        if let Err(err) = result {
            tracing::warn!(%err, "failed to persist incoming messages");
        }
    }

    /// Record released messages as processed.
    async fn persist_released(&self, released: &[Message]) {
        if released.is_empty() {
            return;
        }
        let updates: Vec<_> = released
            .iter()
            .map(|m| (m.conversation_id, m.sequence, m.state, m.gap_before))
            .collect();
        let result = self
            .blocking(move |inner| {
                let mut first_err = None;
                for (conversation_id, sequence, state, gap_before) in updates {
                    if let Err(err) =
                        inner.storage.update_state(conversation_id, sequence, state, gap_before)
                    {
                        tracing::warn!(conversation_id, sequence, %err, "failed to persist state");
                        first_err.get_or_insert(err);
                    }
                }
                first_err.map_or(Ok(()), Err)
            })
            .await;
        if let Err(err) = result {
            tracing::debug!(%err, "some released messages were not marked delivered");
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, ClientError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner<S, H, E, D>) -> Result<T, StorageError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        Ok(tokio::task::spawn_blocking(move || f(&*inner)).await??)
    }
}

/// Resolves once `shutdown` reads true.
async fn stopped(mut shutdown: watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
