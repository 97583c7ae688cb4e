//! Companion reminder task.
//!
//! Nudges the requester periodically while their record is pending. Runs on
//! its own budget and is stopped through the registry when the poller
//! concludes.

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::TaskSchedule;
use crate::engine::Collaborators;
use crate::notify::{deliver_best_effort, Notice};
use crate::poller::wait_for_tick;
use crate::store::RecordStore;
use crate::types::IdentityId;

/// Reminder task for one identity.
pub struct ReminderTask<S> {
    identity_id: IdentityId,
    services: Collaborators<S>,
    schedule: TaskSchedule,
}

impl<S: RecordStore + 'static> ReminderTask<S> {
    /// Create a reminder for `identity_id`.
    pub fn new(identity_id: IdentityId, services: Collaborators<S>, schedule: TaskSchedule) -> Self {
        Self {
            identity_id,
            services,
            schedule,
        }
    }

    /// Send one reminder if the record is still pending. Returns `false` when
    /// there is nothing left to remind about.
    pub async fn tick(&self) -> bool {
        let record = match self.services.store.get(&self.identity_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(identity_id = %self.identity_id, error = %e, "Store error in reminder");
                return true;
            }
        };
        if record.verified || record.is_expired(self.services.clock.now()) {
            return false;
        }

        deliver_best_effort(
            self.services.notifier.as_ref(),
            Notice::Reminder {
                identity_id: record.identity_id,
                code: record.code,
                expires_at: record.expires_at,
            },
        )
        .await;
        true
    }

    /// Run until the budget is spent, the record closes, or cancellation.
    /// Returns the number of ticks executed.
    pub async fn run(self, mut cancel: watch::Receiver<bool>) -> u32 {
        let period = self.schedule.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut ticks = 0;
        while ticks < self.schedule.max_ticks {
            if !wait_for_tick(&mut ticker, &mut cancel).await {
                break;
            }
            ticks += 1;
            if !self.tick().await {
                break;
            }
        }
        tracing::debug!(identity_id = %self.identity_id, ticks, "Reminder finished");
        ticks
    }
}
