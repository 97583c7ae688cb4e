//! Expiry sweeper.
//!
//! Global backstop that deletes every unverified record past its deadline,
//! including records whose poller gave up or never started. Deletion is
//! conditional in the store, so a record verified between read and write
//! survives.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::engine::Collaborators;
use crate::notify::{deliver_best_effort, Notice};
use crate::poller::wait_for_tick;
use crate::registry::TaskRegistry;
use crate::store::RecordStore;
use crate::types::VerificationRecord;

/// Periodic expiry sweeper.
pub struct ExpirySweeper<S> {
    services: Collaborators<S>,
    registry: Arc<TaskRegistry>,
    interval: Duration,
}

impl<S: RecordStore + 'static> ExpirySweeper<S> {
    /// Create a sweeper.
    pub fn new(services: Collaborators<S>, registry: Arc<TaskRegistry>, interval: Duration) -> Self {
        Self {
            services,
            registry,
            interval,
        }
    }

    /// Delete expired records once; returns what was deleted.
    pub async fn sweep_once(&self) -> Result<Vec<VerificationRecord>, S::Error> {
        let now = self.services.clock.now();
        let expired = self.services.store.sweep_expired(now).await?;

        for record in &expired {
            self.registry.cancel(&record.identity_id);
            deliver_best_effort(
                self.services.notifier.as_ref(),
                Notice::Expired {
                    identity_id: record.identity_id.clone(),
                },
            )
            .await;
        }

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Swept expired verification records");
        }
        Ok(expired)
    }

    /// Sweep every interval until cancelled. The first sweep runs immediately
    /// so records orphaned by a restart are reclaimed promptly.
    pub async fn run(self, mut cancel: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while wait_for_tick(&mut ticker, &mut cancel).await {
            if let Err(e) = self.sweep_once().await {
                tracing::warn!(error = %e, "Expiry sweep failed, retrying next interval");
            }
        }
        tracing::info!("Expiry sweeper stopped");
    }
}
