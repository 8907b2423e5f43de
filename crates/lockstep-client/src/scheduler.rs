//! Background retention cleanup.
//!
//! Runs [`RetentionPolicyEngine::perform_cleanup`] once right away and then
//! on a fixed interval. A failed pass is logged and retried on the next
//! tick; the loop ends when the handle is shut down or dropped.

use std::{sync::Arc, time::Duration};

use lockstep_core::{CleanupReport, RetentionPolicyEngine, env::Environment, storage::KeyStore};
use tokio::{
    sync::{Notify, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};

/// Handle to the cleanup task. Dropping it also stops the loop.
#[derive(Debug)]
pub struct CleanupScheduler {
    trigger: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    reports: watch::Receiver<Option<CleanupReport>>,
    task: JoinHandle<()>,
}

impl CleanupScheduler {
    /// Spawn the cleanup loop on the current Tokio runtime.
    pub fn spawn<K, E>(retention: Arc<RetentionPolicyEngine<K, E>>, interval: Duration) -> Self
    where
        K: KeyStore,
        E: Environment,
    {
        let trigger = Arc::new(Notify::new());
        let (shutdown, mut stop) = watch::channel(false);
        let (report_tx, reports) = watch::channel(None);

        let notified = Arc::clone(&trigger);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(?interval, "retention cleanup scheduled");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {},
                    () = notified.notified() => {},
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                        continue;
                    },
                }

                let engine = Arc::clone(&retention);
                match tokio::task::spawn_blocking(move || engine.perform_cleanup()).await {
                    Ok(Ok(report)) => {
                        report_tx.send_replace(Some(report));
                    },
                    Ok(Err(err)) => tracing::warn!(%err, "retention cleanup failed"),
                    Err(err) => tracing::error!(%err, "retention cleanup task panicked"),
                }
            }
            tracing::debug!("retention cleanup stopped");
        });

        Self { trigger, shutdown, reports, task }
    }

    /// Run a pass now instead of waiting for the next tick.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Most recent successful pass.
    pub fn last_report(&self) -> Option<CleanupReport> {
        *self.reports.borrow()
    }

    /// Wait for the next successful pass.
    pub async fn next_report(&mut self) -> Option<CleanupReport> {
        self.reports.changed().await.ok()?;
        *self.reports.borrow_and_update()
    }

    /// Stop the loop and wait for an in-flight pass to finish.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(err) = self.task.await {
            tracing::error!(%err, "retention cleanup task failed");
        }
    }
}
