//! Reconciliation poller.
//!
//! One poller runs per pending record. Each tick re-reads the record from the
//! store (never trusting state from a previous tick), fetches the ledger, and
//! looks for the first row whose code equals the record's code and whose
//! identity text fuzzy-matches the requester's. A match is granted before the
//! record is marked verified, so a crash in between is repaired on the next
//! tick by the applier answering `AlreadyGranted`.
//!
//! Tick order:
//!
//! 1. claim a tick from the record's budget; missing record or spent budget ends the poller
//! 2. verified record ends the poller
//! 3. expired record is deleted (conditionally) and the requester notified
//! 4. ledger fetch; transient errors skip the tick, authorization errors end the poller
//! 5. scan rows in ledger order, skipping malformed ones
//! 6. domain policy, grant, mark verified

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::Instrument;

use crate::config::VerificationConfig;
use crate::engine::Collaborators;
use crate::error::VerificationError;
use crate::grant::{GrantError, GrantOutcome};
use crate::ledger::LedgerError;
use crate::matcher::IdentityMatcher;
use crate::notify::{deliver_best_effort, Notice};
use crate::store::{DeletePredicate, PollClaim, RecordStore};
use crate::types::{IdentityId, LedgerRow, Submission, Transition, VerificationCode, VerificationRecord};

/// Result of one tick (or of a whole run, for the terminal variants).
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// No qualifying row yet.
    NoMatch,
    /// Transient failure; try again next tick.
    Retry(VerificationError),
    /// Granted and marked verified.
    Verified {
        /// Matched code.
        code: VerificationCode,
        /// Index of the matched ledger row.
        row_index: usize,
        /// What the applier reported.
        grant: GrantOutcome,
    },
    /// Granted, but the record was deleted or replaced before it could be
    /// marked verified.
    Superseded,
    /// The record expired and was removed.
    Expired,
    /// The record no longer exists (retry, reset or sweep).
    Gone,
    /// The record was already verified.
    AlreadyVerified,
    /// Tick budget spent.
    Exhausted,
    /// Terminal failure; the requester and audit channel were notified.
    Failed(VerificationError),
    /// Cancelled through the registry.
    Cancelled,
}

impl TickOutcome {
    /// Whether the poller stops after this outcome.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::NoMatch | Self::Retry(_))
    }
}

/// Wait for the next tick. Returns `false` if cancelled first.
pub(crate) async fn wait_for_tick(
    ticker: &mut tokio::time::Interval,
    cancel: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        if *cancel.borrow() {
            return false;
        }
        tokio::select! {
            _ = ticker.tick() => return true,
            changed = cancel.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

/// Reconciliation poller for one identity.
pub struct ReconciliationPoller<S> {
    identity_id: IdentityId,
    services: Collaborators<S>,
    config: Arc<VerificationConfig>,
    matcher: IdentityMatcher,
}

impl<S: RecordStore + 'static> ReconciliationPoller<S> {
    /// Create a poller for `identity_id`.
    pub fn new(
        identity_id: IdentityId,
        services: Collaborators<S>,
        config: Arc<VerificationConfig>,
    ) -> Self {
        let matcher = IdentityMatcher::new(config.match_threshold);
        Self {
            identity_id,
            services,
            config,
            matcher,
        }
    }

    /// Identity this poller works for.
    pub fn identity_id(&self) -> &IdentityId {
        &self.identity_id
    }

    /// Run until a terminal outcome, the local tick bound, or cancellation.
    ///
    /// The first tick fires one interval after start.
    pub async fn run(self, mut cancel: watch::Receiver<bool>) -> TickOutcome {
        let span = tracing::info_span!(
            "poller",
            identity_id = %self.identity_id,
            run_id = %uuid::Uuid::new_v4()
        );

        async move {
            let period = self.config.poll.interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            for tick in 1..=self.config.poll.max_ticks {
                if !wait_for_tick(&mut ticker, &mut cancel).await {
                    tracing::debug!("Poller cancelled");
                    return TickOutcome::Cancelled;
                }

                let outcome = self.tick().await;
                tracing::debug!(tick, outcome = ?outcome, "Poll tick");
                if outcome.is_terminal() {
                    return outcome;
                }
            }

            tracing::info!("Poll budget exhausted without a match");
            TickOutcome::Exhausted
        }
        .instrument(span)
        .await
    }

    /// Execute one tick.
    pub async fn tick(&self) -> TickOutcome {
        let id = &self.identity_id;
        let now = self.services.clock.now();

        let record = match self.services.store.claim_poll_attempt(id).await {
            Ok(PollClaim::Missing) => return TickOutcome::Gone,
            Ok(PollClaim::Exhausted(_)) => return TickOutcome::Exhausted,
            Ok(PollClaim::Claimed(record)) => record,
            Err(e) => {
                tracing::warn!(identity_id = %id, error = %e, "Store error claiming poll tick");
                return TickOutcome::Retry(VerificationError::store(e));
            }
        };

        if record.verified {
            return TickOutcome::AlreadyVerified;
        }

        if record.is_expired(now) {
            return self.expire(now).await;
        }

        let rows = match self.services.ledger.fetch_rows().await {
            Ok(rows) => rows,
            Err(LedgerError::Unavailable(msg)) => {
                tracing::warn!(identity_id = %id, error = %msg, "Ledger fetch failed, retrying next tick");
                return TickOutcome::Retry(VerificationError::LedgerUnavailable(msg));
            }
            Err(e) => {
                tracing::error!(identity_id = %id, error = %e, "Ledger access denied, stopping poller");
                deliver_best_effort(
                    self.services.notifier.as_ref(),
                    Notice::LedgerError {
                        identity_id: id.clone(),
                        error: e.to_string(),
                        fatal: true,
                    },
                )
                .await;
                return TickOutcome::Failed(VerificationError::PermissionDenied(e.to_string()));
            }
        };

        let Some(submission) = self.find_match(&record, &rows) else {
            return TickOutcome::NoMatch;
        };

        tracing::info!(
            identity_id = %id,
            code = %record.code,
            row_index = submission.index,
            "Ledger row matched"
        );

        if let Some(policy) = &self.config.domain_policy {
            let email = submission.email.clone().unwrap_or_default();
            if !policy.allows(&email) {
                tracing::warn!(identity_id = %id, email = %email, "Submission email domain not allowed");
                deliver_best_effort(
                    self.services.notifier.as_ref(),
                    Notice::DomainRejected {
                        identity_id: id.clone(),
                        email: email.clone(),
                    },
                )
                .await;
                return TickOutcome::Failed(VerificationError::DomainNotAllowed(email));
            }
        }

        if let Err(e) = record.state(now).apply(Transition::MatchFound, id) {
            return TickOutcome::Failed(e);
        }

        self.grant_and_commit(&record, &submission).await
    }

    /// First submission (in ledger order) whose code and identity both match.
    fn find_match(&self, record: &VerificationRecord, rows: &[Vec<String>]) -> Option<Submission> {
        rows.iter().enumerate().find_map(|(index, cells)| {
            match self.config.row_layout.parse(index, cells) {
                LedgerRow::Malformed { index, reason } => {
                    tracing::debug!(row_index = index, reason = %reason, "Skipping malformed ledger row");
                    None
                }
                LedgerRow::Submission(s) => (record.code.matches_submission(&s.code)
                    && self.matcher.matches(&s.identity_text, &record.identity_text))
                .then_some(s),
            }
        })
    }

    async fn expire(&self, now: chrono::DateTime<chrono::Utc>) -> TickOutcome {
        let id = &self.identity_id;
        match self
            .services
            .store
            .delete(id, DeletePredicate::ExpiredAt(now))
            .await
        {
            Ok(Some(_)) => {
                tracing::info!(identity_id = %id, "Verification code expired");
                deliver_best_effort(
                    self.services.notifier.as_ref(),
                    Notice::Expired {
                        identity_id: id.clone(),
                    },
                )
                .await;
                TickOutcome::Expired
            }
            // The sweeper or a reset got there first and sent its own notice.
            Ok(None) => TickOutcome::Gone,
            Err(e) => {
                tracing::warn!(identity_id = %id, error = %e, "Store error deleting expired record");
                TickOutcome::Retry(VerificationError::store(e))
            }
        }
    }

    async fn grant_and_commit(&self, record: &VerificationRecord, submission: &Submission) -> TickOutcome {
        let id = &self.identity_id;

        // The ledger fetch may have taken a while; do not grant on behalf of a
        // record that was cancelled or ran out of time meanwhile.
        let now = self.services.clock.now();
        match self.services.store.get(id).await {
            Ok(Some(current)) if current.verified => return TickOutcome::AlreadyVerified,
            Ok(Some(current)) if current.code != record.code => return TickOutcome::Gone,
            Ok(Some(current)) if current.is_expired(now) => return self.expire(now).await,
            Ok(Some(_)) => {}
            Ok(None) => return TickOutcome::Gone,
            Err(e) => return TickOutcome::Retry(VerificationError::store(e)),
        }

        let grant = match self.services.grants.grant(id).await {
            Ok(grant) => grant,
            Err(GrantError::Unavailable(msg)) => {
                tracing::warn!(identity_id = %id, error = %msg, "Grant backend unavailable, retrying next tick");
                return TickOutcome::Retry(VerificationError::GrantUnavailable(msg));
            }
            Err(e) => {
                let error = match e {
                    GrantError::NotFound => VerificationError::IdentityUnresolvable(id.clone()),
                    GrantError::PermissionDenied(msg) => VerificationError::PermissionDenied(msg),
                    GrantError::Unavailable(msg) => VerificationError::GrantUnavailable(msg),
                };
                tracing::error!(identity_id = %id, error = %error, "Grant failed, stopping poller");
                deliver_best_effort(
                    self.services.notifier.as_ref(),
                    Notice::GrantFailed {
                        identity_id: id.clone(),
                        reason: error.code().to_string(),
                    },
                )
                .await;
                return TickOutcome::Failed(error);
            }
        };

        if let Err(e) = self.services.grants.revoke_prior_marker(id).await {
            tracing::warn!(identity_id = %id, error = %e, "Could not remove unverified marker");
        }

        let now = self.services.clock.now();
        match self.services.store.mark_verified(id, &record.code, now).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(identity_id = %id, code = %record.code, "Record replaced or expired after grant");
                return TickOutcome::Superseded;
            }
            Err(e) => {
                // Next tick re-grants, gets AlreadyGranted, and retries the commit.
                tracing::error!(identity_id = %id, error = %e, "Store error marking record verified");
                return TickOutcome::Retry(VerificationError::store(e));
            }
        }

        tracing::info!(identity_id = %id, code = %record.code, grant = ?grant, "Identity verified");

        if let Some(column) = self.config.writeback.verified_column {
            if let Err(e) = self
                .services
                .ledger
                .update_cell(submission.index, column, "1".to_string())
                .await
            {
                tracing::warn!(identity_id = %id, row_index = submission.index, error = %e, "Ledger writeback failed");
            }
        }

        deliver_best_effort(
            self.services.notifier.as_ref(),
            Notice::Verified {
                identity_id: id.clone(),
                code: record.code.clone(),
            },
        )
        .await;

        TickOutcome::Verified {
            code: record.code.clone(),
            row_index: submission.index,
            grant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::{DomainPolicy, TaskSchedule};
    use crate::grant::{GrantApplier, InMemoryGrantApplier};
    use crate::ledger::{InMemoryLedger, LedgerClient};
    use crate::notify::RecordingNotifier;
    use crate::store::InMemoryRecordStore;
    use crate::types::{Requester, RowLayout};
    use chrono::{Duration, Utc};

    struct Fixture {
        store: Arc<InMemoryRecordStore>,
        ledger: Arc<InMemoryLedger>,
        grants: Arc<InMemoryGrantApplier>,
        notifier: Arc<RecordingNotifier>,
        clock: Arc<ManualClock>,
        services: Collaborators<InMemoryRecordStore>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryRecordStore::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let grants = Arc::new(InMemoryGrantApplier::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let services = Collaborators {
            store: store.clone(),
            ledger: ledger.clone(),
            grants: grants.clone(),
            notifier: notifier.clone(),
            clock: clock.clone(),
        };
        Fixture { store, ledger, grants, notifier, clock, services }
    }

    fn seed(f: &Fixture, ticks: u32) -> VerificationRecord {
        let record = VerificationRecord::new(
            &Requester::new("42", "john_doe"),
            VerificationCode::parse("AB12CD34").unwrap(),
            f.clock.now(),
            Duration::minutes(5),
            ticks,
        );
        f.store.put(record.clone());
        record
    }

    fn poller(f: &Fixture, config: VerificationConfig) -> ReconciliationPoller<InMemoryRecordStore> {
        ReconciliationPoller::new(IdentityId::new("42"), f.services.clone(), Arc::new(config))
    }

    #[tokio::test]
    async fn test_match_grants_once_and_verifies() {
        let f = fixture();
        seed(&f, 30);
        f.ledger.push_row(&["ZZZZ0000", "someone"]);
        f.ledger.push_row(&["ab12cd34", "John_Doe"]);
        let poller = poller(&f, VerificationConfig::default());

        let outcome = poller.tick().await;
        assert!(matches!(outcome, TickOutcome::Verified { row_index: 1, grant: GrantOutcome::Granted, .. }));
        assert_eq!(poller.tick().await, TickOutcome::AlreadyVerified);

        let id = IdentityId::new("42");
        assert_eq!(f.grants.grant_calls(&id), 1);
        assert!(f.store.get(&id).await.unwrap().unwrap().verified);
        assert_eq!(f.notifier.count("verified"), 1);
    }

    #[tokio::test]
    async fn test_code_match_with_wrong_identity_keeps_scanning() {
        let f = fixture();
        seed(&f, 30);
        f.ledger.push_row(&["AB12CD34", "completely_different_name"]);
        f.ledger.push_row(&["AB12CD34"]);
        let poller = poller(&f, VerificationConfig::default());
        assert_eq!(poller.tick().await, TickOutcome::NoMatch);

        f.ledger.push_row(&["AB12CD34", "john_doe"]);
        assert!(matches!(poller.tick().await, TickOutcome::Verified { row_index: 2, .. }));
    }

    #[tokio::test]
    async fn test_expired_record_deleted_even_with_late_row() {
        let f = fixture();
        seed(&f, 30);
        f.clock.advance(Duration::minutes(6));
        f.ledger.push_row(&["AB12CD34", "john_doe"]);
        let poller = poller(&f, VerificationConfig::default());

        assert_eq!(poller.tick().await, TickOutcome::Expired);
        assert_eq!(poller.tick().await, TickOutcome::Gone);
        assert_eq!(f.grants.grant_calls(&IdentityId::new("42")), 0);
        assert_eq!(f.notifier.count("expired"), 1);
        assert_eq!(f.ledger.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_ledger_error_retries() {
        let f = fixture();
        seed(&f, 30);
        f.ledger.fail_next_fetch(LedgerError::Unavailable("timeout".into()));
        f.ledger.push_row(&["AB12CD34", "john_doe"]);
        let poller = poller(&f, VerificationConfig::default());

        assert!(matches!(poller.tick().await, TickOutcome::Retry(VerificationError::LedgerUnavailable(_))));
        assert!(matches!(poller.tick().await, TickOutcome::Verified { .. }));
    }

    #[tokio::test]
    async fn test_unauthorized_ledger_stops_and_notifies_audit() {
        let f = fixture();
        seed(&f, 30);
        f.ledger.fail_next_fetch(LedgerError::Unauthorized("revoked".into()));
        let outcome = poller(&f, VerificationConfig::default()).tick().await;
        assert!(outcome.is_terminal());
        assert_eq!(f.notifier.count("ledger_error"), 1);
    }

    #[tokio::test]
    async fn test_unresolvable_identity_is_terminal() {
        let f = fixture();
        seed(&f, 30);
        f.grants.mark_absent("42");
        f.ledger.push_row(&["AB12CD34", "john_doe"]);

        let outcome = poller(&f, VerificationConfig::default()).tick().await;
        assert_eq!(
            outcome,
            TickOutcome::Failed(VerificationError::IdentityUnresolvable(IdentityId::new("42")))
        );
        assert!(!f.store.get(&IdentityId::new("42")).await.unwrap().unwrap().verified);
        assert_eq!(f.notifier.count("grant_failed"), 1);
    }

    #[tokio::test]
    async fn test_restart_reconciles_already_granted() {
        let f = fixture();
        seed(&f, 30);
        f.grants.pre_grant("42");
        f.ledger.push_row(&["AB12CD34", "john_doe"]);

        let outcome = poller(&f, VerificationConfig::default()).tick().await;
        assert!(matches!(outcome, TickOutcome::Verified { grant: GrantOutcome::AlreadyGranted, .. }));
        assert!(f.store.get(&IdentityId::new("42")).await.unwrap().unwrap().verified);
    }

    #[tokio::test]
    async fn test_domain_policy_rejects_and_leaves_pending() {
        let f = fixture();
        seed(&f, 30);
        f.ledger.push_row(&["AB12CD34", "john_doe", "john@elsewhere.org"]);
        let config = VerificationConfig {
            domain_policy: DomainPolicy::parse_list("example.com"),
            row_layout: RowLayout { email_column: Some(2), ..RowLayout::default() },
            ..VerificationConfig::default()
        };

        let outcome = poller(&f, config).tick().await;
        assert!(matches!(outcome, TickOutcome::Failed(VerificationError::DomainNotAllowed(_))));
        assert_eq!(f.grants.grant_calls(&IdentityId::new("42")), 0);
        assert!(!f.store.get(&IdentityId::new("42")).await.unwrap().unwrap().verified);
    }

    #[tokio::test]
    async fn test_verified_column_writeback() {
        let f = fixture();
        seed(&f, 30);
        f.ledger.push_row(&["AB12CD34", "john_doe", "", "42", "0"]);
        let config = VerificationConfig {
            writeback: crate::config::LedgerWriteback { record_issuance: false, verified_column: Some(4) },
            ..VerificationConfig::default()
        };
        assert!(matches!(poller(&f, config).tick().await, TickOutcome::Verified { .. }));
        assert_eq!(f.ledger.rows()[0][4], "1");
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_silent() {
        let f = fixture();
        seed(&f, 2);
        let poller = poller(&f, VerificationConfig::default());
        assert_eq!(poller.tick().await, TickOutcome::NoMatch);
        assert_eq!(poller.tick().await, TickOutcome::NoMatch);
        assert_eq!(poller.tick().await, TickOutcome::Exhausted);
        assert!(f.notifier.notices().is_empty());
        assert!(f.store.get(&IdentityId::new("42")).await.unwrap().is_some());
    }

    /// Ledger whose fetch takes `lag` of record-clock time.
    struct LaggingLedger {
        rows: Vec<Vec<String>>,
        clock: Arc<ManualClock>,
        lag: Duration,
    }

    #[async_trait::async_trait]
    impl LedgerClient for LaggingLedger {
        async fn fetch_rows(&self) -> Result<Vec<Vec<String>>, LedgerError> {
            self.clock.advance(self.lag);
            Ok(self.rows.clone())
        }
    }

    #[tokio::test]
    async fn test_expiry_during_ledger_fetch_blocks_grant() {
        let f = fixture();
        let record = seed(&f, 30);
        f.clock.advance(Duration::minutes(4));

        let services = Collaborators {
            ledger: Arc::new(LaggingLedger {
                rows: vec![vec!["AB12CD34".to_string(), "john_doe".to_string()]],
                clock: f.clock.clone(),
                lag: Duration::minutes(2),
            }),
            ..f.services.clone()
        };
        let poller = ReconciliationPoller::new(
            IdentityId::new("42"),
            services,
            Arc::new(VerificationConfig::default()),
        );

        assert_eq!(poller.tick().await, TickOutcome::Expired);
        assert!(f.clock.now() > record.expires_at);
        assert_eq!(f.grants.grant_calls(&record.identity_id), 0);
        assert!(f.store.get(&record.identity_id).await.unwrap().is_none());
        assert_eq!(f.notifier.count("expired"), 1);
    }

    /// Grant applier whose call takes `lag` of record-clock time.
    struct SlowGrants {
        inner: Arc<InMemoryGrantApplier>,
        clock: Arc<ManualClock>,
        lag: Duration,
    }

    #[async_trait::async_trait]
    impl GrantApplier for SlowGrants {
        async fn grant(&self, identity: &IdentityId) -> Result<GrantOutcome, GrantError> {
            self.clock.advance(self.lag);
            self.inner.grant(identity).await
        }
    }

    #[tokio::test]
    async fn test_expiry_during_grant_blocks_commit() {
        let f = fixture();
        let record = seed(&f, 30);
        f.clock.advance(Duration::minutes(4));
        f.ledger.push_row(&["AB12CD34", "john_doe"]);

        let services = Collaborators {
            grants: Arc::new(SlowGrants {
                inner: f.grants.clone(),
                clock: f.clock.clone(),
                lag: Duration::minutes(2),
            }),
            ..f.services.clone()
        };
        let poller = ReconciliationPoller::new(
            IdentityId::new("42"),
            services,
            Arc::new(VerificationConfig::default()),
        );

        assert_eq!(poller.tick().await, TickOutcome::Superseded);
        let stored = f.store.get(&record.identity_id).await.unwrap().unwrap();
        assert!(!stored.verified);
        assert_eq!(f.notifier.count("verified"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let f = fixture();
        seed(&f, 30);
        let config = VerificationConfig {
            poll: TaskSchedule::new(std::time::Duration::from_secs(10), 30),
            ..VerificationConfig::default()
        };
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(poller(&f, config).run(rx));

        tokio::time::sleep(std::time::Duration::from_secs(25)).await;
        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), TickOutcome::Cancelled);
        assert_eq!(f.ledger.fetch_count(), 2);
    }
}
