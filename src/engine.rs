//! Verification engine: the command surface and task orchestration.
//!
//! The engine owns no state of its own beyond the task registry. Everything
//! durable lives in the [`RecordStore`]; everything external is reached
//! through the injected [`Collaborators`].

use std::sync::Arc;

use chrono::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::VerificationConfig;
use crate::error::{ConfigError, VerificationError};
use crate::grant::GrantApplier;
use crate::ledger::LedgerClient;
use crate::notify::{deliver_best_effort, Notice, Notifier};
use crate::poller::ReconciliationPoller;
use crate::registry::{TaskLease, TaskRegistry};
use crate::reminder::ReminderTask;
use crate::store::{CreateOutcome, DeletePredicate, RecordStore};
use crate::sweeper::ExpirySweeper;
use crate::types::{
    CodeGenerator, IdentityId, Requester, StatusReport, Transition, VerificationRecord,
    VerificationState,
};

/// How many fresh codes `request` tries before giving up on collisions.
pub const MAX_CODE_ATTEMPTS: usize = 5;

/// Capabilities shared by the engine and its background tasks.
pub struct Collaborators<S> {
    /// Record store.
    pub store: Arc<S>,
    /// Ledger client.
    pub ledger: Arc<dyn LedgerClient>,
    /// Grant applier.
    pub grants: Arc<dyn GrantApplier>,
    /// Notice sink.
    pub notifier: Arc<dyn Notifier>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

impl<S> Clone for Collaborators<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            ledger: Arc::clone(&self.ledger),
            grants: Arc::clone(&self.grants),
            notifier: Arc::clone(&self.notifier),
            clock: Arc::clone(&self.clock),
        }
    }
}

/// Result of a request command.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// A new code was issued and polling started.
    Issued(VerificationRecord),
    /// A code is already pending; it was re-delivered.
    Pending {
        /// The existing record.
        record: VerificationRecord,
        /// Time left on it.
        remaining: Duration,
    },
    /// The identity is already verified.
    AlreadyVerified(VerificationRecord),
}

impl RequestOutcome {
    /// The record the outcome refers to.
    pub fn record(&self) -> &VerificationRecord {
        match self {
            Self::Issued(record) | Self::AlreadyVerified(record) => record,
            Self::Pending { record, .. } => record,
        }
    }

    /// The error a strict caller would report for a non-issuing outcome.
    pub fn as_error(&self) -> Option<VerificationError> {
        match self {
            Self::Issued(_) => None,
            Self::Pending { record, .. } => Some(VerificationError::DuplicateRequest {
                code: record.code.clone(),
                expires_at: record.expires_at,
            }),
            Self::AlreadyVerified(record) => {
                Some(VerificationError::AlreadyVerified(record.identity_id.clone()))
            }
        }
    }
}

/// The verification engine.
pub struct VerificationEngine<S> {
    services: Collaborators<S>,
    config: Arc<VerificationConfig>,
    registry: Arc<TaskRegistry>,
    generator: CodeGenerator,
}

impl<S> Clone for VerificationEngine<S> {
    fn clone(&self) -> Self {
        Self {
            services: self.services.clone(),
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            generator: self.generator,
        }
    }
}

impl<S: RecordStore + 'static> VerificationEngine<S> {
    /// Build an engine on the wall clock. Fails on invalid configuration.
    pub fn new(
        store: Arc<S>,
        ledger: Arc<dyn LedgerClient>,
        grants: Arc<dyn GrantApplier>,
        notifier: Arc<dyn Notifier>,
        config: VerificationConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            generator: CodeGenerator::new(config.code_length),
            services: Collaborators {
                store,
                ledger,
                grants,
                notifier,
                clock: Arc::new(SystemClock),
            },
            config: Arc::new(config),
            registry: Arc::new(TaskRegistry::new()),
        })
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.services.clock = clock;
        self
    }

    /// Shared capabilities.
    pub fn services(&self) -> &Collaborators<S> {
        &self.services
    }

    /// Record store.
    pub fn store(&self) -> &Arc<S> {
        &self.services.store
    }

    /// Active configuration.
    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    /// Task registry.
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Start (or continue) a verification cycle for `requester`.
    pub async fn request(&self, requester: Requester) -> Result<RequestOutcome, VerificationError> {
        let now = self.services.clock.now();

        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let record = VerificationRecord::new(
                &requester,
                self.generator.generate(),
                now,
                self.config.ttl(),
                self.config.poll.max_ticks,
            );

            match self
                .services
                .store
                .create(record, now)
                .await
                .map_err(VerificationError::store)?
            {
                CreateOutcome::Created(record) => {
                    VerificationState::None.apply(Transition::Request, &record.identity_id)?;
                    self.issue(&record).await;
                    return Ok(RequestOutcome::Issued(record));
                }
                CreateOutcome::Existing(record) if record.verified => {
                    tracing::debug!(identity_id = %record.identity_id, "Request from verified identity");
                    return Ok(RequestOutcome::AlreadyVerified(record));
                }
                CreateOutcome::Existing(record) => {
                    let remaining = record.remaining(now);
                    self.redeliver(&record, remaining).await?;
                    return Ok(RequestOutcome::Pending { record, remaining });
                }
                CreateOutcome::CodeCollision => {
                    tracing::warn!(identity_id = %requester.id, attempt, "Generated code collided, regenerating");
                }
            }
        }

        Err(VerificationError::CodeSpaceExhausted(MAX_CODE_ATTEMPTS))
    }

    async fn issue(&self, record: &VerificationRecord) {
        tracing::info!(
            identity_id = %record.identity_id,
            code = %record.code,
            expires_at = %record.expires_at,
            "Verification code issued"
        );

        // A previous (expired) record may still have tasks winding down.
        self.registry.cancel(&record.identity_id);

        if self.config.writeback.record_issuance {
            let row = vec![
                record.code.to_string(),
                String::new(),
                record.expires_at.to_rfc3339(),
                record.identity_id.to_string(),
                "0".to_string(),
            ];
            if let Err(e) = self.services.ledger.append_row(row).await {
                tracing::warn!(identity_id = %record.identity_id, error = %e, "Could not record issuance in ledger");
            }
        }

        deliver_best_effort(
            self.services.notifier.as_ref(),
            Notice::CodeIssued {
                identity_id: record.identity_id.clone(),
                code: record.code.clone(),
                expires_at: record.expires_at,
                identity_text: record.identity_text.clone(),
                form_link: self.config.form_link.clone(),
            },
        )
        .await;

        if let Some(lease) = self.registry.try_register(&record.identity_id) {
            self.spawn_tasks(lease);
        }
    }

    async fn redeliver(&self, record: &VerificationRecord, remaining: Duration) -> Result<(), VerificationError> {
        tracing::info!(
            identity_id = %record.identity_id,
            code = %record.code,
            remaining_secs = remaining.num_seconds(),
            "Re-delivering pending code"
        );

        deliver_best_effort(
            self.services.notifier.as_ref(),
            Notice::CodeRedelivered {
                identity_id: record.identity_id.clone(),
                code: record.code.clone(),
                minutes_remaining: remaining.num_minutes(),
                form_link: self.config.form_link.clone(),
            },
        )
        .await;

        // The previous poller may have spent its budget; restart with a fresh one.
        if !self.registry.is_active(&record.identity_id) {
            self.services
                .store
                .reset_poll_budget(&record.identity_id, self.config.poll.max_ticks)
                .await
                .map_err(VerificationError::store)?;
            if let Some(lease) = self.registry.try_register(&record.identity_id) {
                tracing::info!(identity_id = %record.identity_id, "Restarting poller for pending record");
                self.spawn_tasks(lease);
            }
        }
        Ok(())
    }

    /// Spawn the poller (and reminder, if configured) for a lease.
    fn spawn_tasks(&self, lease: TaskLease) {
        let TaskLease {
            identity_id,
            generation,
            poller_cancel,
            reminder_cancel,
        } = lease;

        if let Some(schedule) = self.config.reminder {
            let reminder = ReminderTask::new(identity_id.clone(), self.services.clone(), schedule);
            tokio::spawn(reminder.run(reminder_cancel));
        }

        let poller = ReconciliationPoller::new(identity_id.clone(), self.services.clone(), Arc::clone(&self.config));
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let outcome = poller.run(poller_cancel).await;
            tracing::info!(identity_id = %identity_id, outcome = ?outcome, "Poller finished");
            registry.release(&identity_id, generation);
        });
    }

    /// Requester withdraws their own pending request.
    pub async fn retry(&self, identity_id: &IdentityId) -> Result<VerificationRecord, VerificationError> {
        let deleted = self
            .services
            .store
            .delete(identity_id, DeletePredicate::Unverified)
            .await
            .map_err(VerificationError::store)?;

        match deleted {
            Some(record) => {
                self.registry.cancel(identity_id);
                tracing::info!(identity_id = %identity_id, code = %record.code, "Pending verification cancelled");
                Ok(record)
            }
            None => {
                let now = self.services.clock.now();
                let existing = self
                    .services
                    .store
                    .get(identity_id)
                    .await
                    .map_err(VerificationError::store)?;
                let state = VerificationState::of(existing.as_ref(), now);
                Err(state
                    .apply(Transition::Cancel, identity_id)
                    .err()
                    .unwrap_or_else(|| VerificationError::NotFound(identity_id.clone())))
            }
        }
    }

    /// Status of `identity_id`.
    pub async fn status(&self, identity_id: &IdentityId) -> Result<StatusReport, VerificationError> {
        let record = self
            .services
            .store
            .get(identity_id)
            .await
            .map_err(VerificationError::store)?;
        Ok(StatusReport::from_record(identity_id.clone(), record.as_ref()))
    }

    /// Admin view of an arbitrary identity. Permission checks happen upstream.
    pub async fn inspect(&self, identity_id: &IdentityId) -> Result<StatusReport, VerificationError> {
        tracing::info!(identity_id = %identity_id, "Admin inspect");
        self.status(identity_id).await
    }

    /// Admin reset: delete the record whatever its state and stop its tasks.
    pub async fn reset(&self, identity_id: &IdentityId) -> Result<VerificationRecord, VerificationError> {
        let deleted = self
            .services
            .store
            .delete(identity_id, DeletePredicate::Always)
            .await
            .map_err(VerificationError::store)?;
        self.registry.cancel(identity_id);

        let record = deleted.ok_or_else(|| VerificationError::NotFound(identity_id.clone()))?;
        tracing::info!(identity_id = %identity_id, verified = record.verified, "Record reset");
        Ok(record)
    }

    /// All pending records, oldest first.
    pub async fn list_unverified(&self) -> Result<Vec<VerificationRecord>, VerificationError> {
        self.services
            .store
            .list_unverified()
            .await
            .map_err(VerificationError::store)
    }

    /// Restart pollers for every unexpired pending record with a fresh budget.
    /// Returns how many were started.
    pub async fn resume_pending(&self) -> Result<usize, VerificationError> {
        let now = self.services.clock.now();
        let mut resumed = 0;

        for record in self.list_unverified().await? {
            if record.is_expired(now) {
                continue;
            }
            self.services
                .store
                .reset_poll_budget(&record.identity_id, self.config.poll.max_ticks)
                .await
                .map_err(VerificationError::store)?;
            if let Some(lease) = self.registry.try_register(&record.identity_id) {
                self.spawn_tasks(lease);
                resumed += 1;
            }
        }

        tracing::info!(resumed, "Resumed pending verifications");
        Ok(resumed)
    }

    /// Start the global expiry sweeper.
    pub fn spawn_sweeper(&self, cancel: watch::Receiver<bool>) -> JoinHandle<()> {
        let sweeper = ExpirySweeper::new(
            self.services.clone(),
            Arc::clone(&self.registry),
            self.config.sweep_interval,
        );
        tokio::spawn(sweeper.run(cancel))
    }

    /// Stop every per-identity task.
    pub fn shutdown(&self) {
        self.registry.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::grant::InMemoryGrantApplier;
    use crate::ledger::InMemoryLedger;
    use crate::notify::RecordingNotifier;
    use crate::store::InMemoryRecordStore;
    use crate::types::{StatusKind, VerificationCode};
    use chrono::Utc;

    struct Harness {
        engine: VerificationEngine<InMemoryRecordStore>,
        ledger: Arc<InMemoryLedger>,
        notifier: Arc<RecordingNotifier>,
        clock: Arc<ManualClock>,
    }

    fn harness(config: VerificationConfig) -> Harness {
        let ledger = Arc::new(InMemoryLedger::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = VerificationEngine::new(
            Arc::new(InMemoryRecordStore::new()),
            ledger.clone(),
            Arc::new(InMemoryGrantApplier::new()),
            notifier.clone(),
            config,
        )
        .unwrap()
        .with_clock(clock.clone());
        Harness { engine, ledger, notifier, clock }
    }

    #[tokio::test]
    async fn test_request_twice_redelivers() {
        let h = harness(VerificationConfig::default());
        let first = h.engine.request(Requester::new("1", "john_doe")).await.unwrap();
        let RequestOutcome::Issued(issued) = first else {
            panic!("expected a fresh code");
        };

        h.clock.advance(Duration::minutes(2));
        let second = h.engine.request(Requester::new("1", "john_doe")).await.unwrap();
        match second {
            RequestOutcome::Pending { record, remaining } => {
                assert_eq!(record.code, issued.code);
                assert_eq!(remaining, Duration::minutes(3));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(h.notifier.kinds(), vec!["code_issued", "code_redelivered"]);
        assert!(h.engine.registry().is_active(&IdentityId::new("1")));
        h.engine.shutdown();
    }

    #[tokio::test]
    async fn test_verified_identity_cannot_request() {
        let h = harness(VerificationConfig::default());
        let issued = h.engine.request(Requester::new("1", "john_doe")).await.unwrap();
        let id = IdentityId::new("1");
        h.engine.store().mark_verified(&id, &issued.record().code, h.clock.now()).await.unwrap();

        let outcome = h.engine.request(Requester::new("1", "john_doe")).await.unwrap();
        assert!(matches!(outcome, RequestOutcome::AlreadyVerified(_)));
        assert_eq!(outcome.as_error(), Some(VerificationError::AlreadyVerified(id.clone())));
        assert_eq!(h.engine.retry(&id).await, Err(VerificationError::AlreadyVerified(id)));
        h.engine.shutdown();
    }

    #[tokio::test]
    async fn test_retry_without_record() {
        let h = harness(VerificationConfig::default());
        let id = IdentityId::new("nobody");
        assert_eq!(h.engine.retry(&id).await, Err(VerificationError::NotFound(id.clone())));
        assert_eq!(h.engine.reset(&id).await, Err(VerificationError::NotFound(id)));
    }

    #[tokio::test]
    async fn test_issuance_appends_ledger_row() {
        let config = VerificationConfig {
            writeback: crate::config::LedgerWriteback { record_issuance: true, verified_column: None },
            reminder: None,
            ..VerificationConfig::default()
        };
        let h = harness(config);
        let outcome = h.engine.request(Requester::new("5", "jane")).await.unwrap();
        let rows = h.ledger.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], outcome.record().code.as_str());
        assert_eq!(rows[0][3], "5");
        assert_eq!(rows[0][4], "0");
        h.engine.shutdown();
    }

    #[tokio::test]
    async fn test_status_reports_configured_code_length() {
        let config = VerificationConfig { code_length: 4, ..VerificationConfig::default() };
        let h = harness(config);
        let outcome = h.engine.request(Requester::new("1", "a")).await.unwrap();
        let report = h.engine.status(&IdentityId::new("1")).await.unwrap();
        assert_eq!(report.status, StatusKind::Pending);
        assert_eq!(report.code.as_ref(), Some(&outcome.record().code));
        assert_eq!(outcome.record().code.as_str().len(), 4);
        h.engine.shutdown();
    }

    /// Store whose `create` always reports a code collision.
    struct CollidingStore(InMemoryRecordStore);

    #[async_trait::async_trait]
    impl RecordStore for CollidingStore {
        type Error = std::convert::Infallible;

        async fn create(&self, _: VerificationRecord, _: chrono::DateTime<Utc>) -> Result<CreateOutcome, Self::Error> {
            Ok(CreateOutcome::CodeCollision)
        }
        async fn get(&self, id: &IdentityId) -> Result<Option<VerificationRecord>, Self::Error> {
            self.0.get(id).await
        }
        async fn claim_poll_attempt(&self, id: &IdentityId) -> Result<crate::store::PollClaim, Self::Error> {
            self.0.claim_poll_attempt(id).await
        }
        async fn reset_poll_budget(&self, id: &IdentityId, attempts: u32) -> Result<bool, Self::Error> {
            self.0.reset_poll_budget(id, attempts).await
        }
        async fn mark_verified(
            &self,
            id: &IdentityId,
            code: &VerificationCode,
            now: chrono::DateTime<Utc>,
        ) -> Result<bool, Self::Error> {
            self.0.mark_verified(id, code, now).await
        }
        async fn delete(&self, id: &IdentityId, predicate: DeletePredicate) -> Result<Option<VerificationRecord>, Self::Error> {
            self.0.delete(id, predicate).await
        }
        async fn list_unverified(&self) -> Result<Vec<VerificationRecord>, Self::Error> {
            self.0.list_unverified().await
        }
        async fn sweep_expired(&self, now: chrono::DateTime<Utc>) -> Result<Vec<VerificationRecord>, Self::Error> {
            self.0.sweep_expired(now).await
        }
    }

    #[tokio::test]
    async fn test_collisions_regenerate_then_give_up() {
        let engine = VerificationEngine::new(
            Arc::new(CollidingStore(InMemoryRecordStore::new())),
            Arc::new(InMemoryLedger::new()),
            Arc::new(InMemoryGrantApplier::new()),
            Arc::new(RecordingNotifier::new()),
            VerificationConfig::default(),
        )
        .unwrap();
        assert_eq!(
            engine.request(Requester::new("1", "a")).await,
            Err(VerificationError::CodeSpaceExhausted(MAX_CODE_ATTEMPTS))
        );
        assert_eq!(engine.registry().active_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let result = VerificationEngine::new(
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(InMemoryLedger::new()),
            Arc::new(InMemoryGrantApplier::new()),
            Arc::new(RecordingNotifier::new()),
            VerificationConfig { code_length: 0, ..VerificationConfig::default() },
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_reset_removes_verified_record() {
        let h = harness(VerificationConfig::default());
        let id = IdentityId::new("1");
        h.engine.store().put(VerificationRecord {
            verified: true,
            ..VerificationRecord::new(
                &Requester::new("1", "john_doe"),
                VerificationCode::parse("AB12CD34").unwrap(),
                h.clock.now(),
                Duration::minutes(5),
                0,
            )
        });
        let record = h.engine.reset(&id).await.unwrap();
        assert!(record.verified);
        assert_eq!(h.engine.status(&id).await.unwrap().status, StatusKind::None);
    }

    #[tokio::test]
    async fn test_resume_pending_skips_expired() {
        let h = harness(VerificationConfig { reminder: None, ..VerificationConfig::default() });
        let now = h.clock.now();
        let record = |id: &str, code: &str, created| {
            VerificationRecord::new(
                &Requester::new(id, "someone"),
                VerificationCode::parse(code).unwrap(),
                created,
                Duration::minutes(5),
                0,
            )
        };
        h.engine.store().put(record("live", "AAAA1111", now));
        h.engine.store().put(record("stale", "BBBB2222", now - Duration::minutes(10)));

        assert_eq!(h.engine.resume_pending().await.unwrap(), 1);
        assert!(h.engine.registry().is_active(&IdentityId::new("live")));
        assert!(!h.engine.registry().is_active(&IdentityId::new("stale")));

        let live = h.engine.store().get(&IdentityId::new("live")).await.unwrap().unwrap();
        assert_eq!(live.poll_attempts_remaining, h.engine.config().poll.max_ticks);
        h.engine.shutdown();
    }
}
