//! Verification record storage backends.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{IdentityId, VerificationCode, VerificationRecord};

/// Result of an atomic check-and-insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The record was stored (replacing an expired, unverified one if present).
    Created(VerificationRecord),
    /// A live record already exists for this identity; nothing was written.
    Existing(VerificationRecord),
    /// Another live record holds the same code; nothing was written.
    CodeCollision,
}

/// Result of claiming one poller tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollClaim {
    /// No record for the identity.
    Missing,
    /// A tick was claimed; the record is returned as it is after the claim.
    /// Verified records are returned without consuming budget.
    Claimed(VerificationRecord),
    /// The record's tick budget is spent.
    Exhausted(VerificationRecord),
}

/// Condition a deletion must satisfy, checked atomically with the delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePredicate {
    /// Delete unconditionally (admin reset).
    Always,
    /// Delete only if not verified (requester retry).
    Unverified,
    /// Delete only if not verified and `expires_at < now` (expiry).
    ExpiredAt(DateTime<Utc>),
}

impl DeletePredicate {
    /// Evaluate the predicate against a record.
    pub fn holds(&self, record: &VerificationRecord) -> bool {
        match self {
            Self::Always => true,
            Self::Unverified => !record.verified,
            Self::ExpiredAt(now) => !record.verified && record.expires_at < *now,
        }
    }
}

/// Trait for record storage backends.
///
/// Every method is atomic with respect to concurrent callers acting on the
/// same identity. Check-then-act sequences (`create`, `claim_poll_attempt`,
/// `mark_verified`, `delete`) must be implemented as a single step in the
/// backend, never as a read followed by a write from the caller.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Error type for store operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Insert `record` unless a live record exists for its identity.
    ///
    /// An existing record that is unverified and expired at `now` is replaced.
    async fn create(
        &self,
        record: VerificationRecord,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome, Self::Error>;

    /// Fetch the record for an identity.
    async fn get(&self, id: &IdentityId) -> Result<Option<VerificationRecord>, Self::Error>;

    /// Re-read the record and consume one tick of its poll budget.
    async fn claim_poll_attempt(&self, id: &IdentityId) -> Result<PollClaim, Self::Error>;

    /// Reset the poll budget of an unverified record. Returns `false` if there
    /// is no such record.
    async fn reset_poll_budget(&self, id: &IdentityId, attempts: u32) -> Result<bool, Self::Error>;

    /// Mark the record verified if it still carries `code` and has not
    /// expired at `now`.
    ///
    /// Idempotent: returns `true` if the record is verified afterwards,
    /// `false` if it was deleted, replaced or expired in the meantime.
    async fn mark_verified(
        &self,
        id: &IdentityId,
        code: &VerificationCode,
        now: DateTime<Utc>,
    ) -> Result<bool, Self::Error>;

    /// Delete the record if `predicate` holds; returns the deleted record.
    async fn delete(
        &self,
        id: &IdentityId,
        predicate: DeletePredicate,
    ) -> Result<Option<VerificationRecord>, Self::Error>;

    /// All unverified records, oldest first.
    async fn list_unverified(&self) -> Result<Vec<VerificationRecord>, Self::Error>;

    /// Delete every unverified record with `expires_at < now`.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<VerificationRecord>, Self::Error>;
}

pub use memory::InMemoryRecordStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresRecordStore;
