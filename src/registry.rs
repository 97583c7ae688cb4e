//! Background task registry keyed by identity.
//!
//! At most one poller (and its companion reminder) runs per identity. Tasks
//! hold a [`TaskLease`] carrying `watch` cancel receivers; commands cancel by
//! identity instead of reaching into task state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::types::IdentityId;

struct TaskEntry {
    generation: u64,
    poller_cancel: watch::Sender<bool>,
    reminder_cancel: watch::Sender<bool>,
}

impl TaskEntry {
    fn signal(&self) {
        let _ = self.poller_cancel.send(true);
        let _ = self.reminder_cancel.send(true);
    }

    /// Both tasks dropped their receivers without releasing (e.g. panicked).
    fn is_stale(&self) -> bool {
        self.poller_cancel.is_closed() && self.reminder_cancel.is_closed()
    }
}

/// Handle given to the tasks of one registration.
#[derive(Debug)]
pub struct TaskLease {
    /// Identity the tasks work for.
    pub identity_id: IdentityId,
    /// Registration generation, used to release only our own entry.
    pub generation: u64,
    /// Cancel signal for the poller.
    pub poller_cancel: watch::Receiver<bool>,
    /// Cancel signal for the reminder.
    pub reminder_cancel: watch::Receiver<bool>,
}

/// Registry of running per-identity tasks.
#[derive(Default)]
pub struct TaskRegistry {
    entries: Mutex<HashMap<IdentityId, TaskEntry>>,
    next_generation: AtomicU64,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register tasks for `identity_id` unless some are already running.
    pub fn try_register(&self, identity_id: &IdentityId) -> Option<TaskLease> {
        let mut entries = self.entries.lock();
        if entries.get(identity_id).is_some_and(|e| !e.is_stale()) {
            return None;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (poller_tx, poller_rx) = watch::channel(false);
        let (reminder_tx, reminder_rx) = watch::channel(false);
        entries.insert(
            identity_id.clone(),
            TaskEntry {
                generation,
                poller_cancel: poller_tx,
                reminder_cancel: reminder_tx,
            },
        );

        Some(TaskLease {
            identity_id: identity_id.clone(),
            generation,
            poller_cancel: poller_rx,
            reminder_cancel: reminder_rx,
        })
    }

    /// Stop the reminder for `identity_id`, leaving the poller running.
    pub fn stop_reminder(&self, identity_id: &IdentityId) {
        if let Some(entry) = self.entries.lock().get(identity_id) {
            let _ = entry.reminder_cancel.send(true);
        }
    }

    /// Cancel both tasks for `identity_id`. Returns whether anything was running.
    pub fn cancel(&self, identity_id: &IdentityId) -> bool {
        match self.entries.lock().remove(identity_id) {
            Some(entry) => {
                entry.signal();
                tracing::debug!(identity_id = %identity_id, generation = entry.generation, "Cancelled tasks");
                true
            }
            None => false,
        }
    }

    /// Called by a finishing poller: stop its reminder and drop the entry if it
    /// still belongs to `generation`.
    pub fn release(&self, identity_id: &IdentityId, generation: u64) {
        let mut entries = self.entries.lock();
        if entries.get(identity_id).is_some_and(|e| e.generation == generation) {
            if let Some(entry) = entries.remove(identity_id) {
                entry.signal();
            }
        }
    }

    /// Whether tasks are registered for `identity_id`.
    pub fn is_active(&self, identity_id: &IdentityId) -> bool {
        self.entries
            .lock()
            .get(identity_id)
            .is_some_and(|e| !e.is_stale())
    }

    /// Number of registered identities.
    pub fn active_count(&self) -> usize {
        self.entries.lock().values().filter(|e| !e.is_stale()).count()
    }

    /// Cancel everything (shutdown).
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        for (_, entry) in &drained {
            entry.signal();
        }
        tracing::info!(count = drained.len(), "Cancelled all background tasks");
    }
}
