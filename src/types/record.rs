//! The stored state of one identity's verification attempt.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::code::VerificationCode;
use super::identity::{IdentityId, Requester};
use super::state::VerificationState;

/// Verification record, one per requester identity.
///
/// `code`, `created_at` and `expires_at` are fixed at creation. `verified`
/// only ever moves from `false` to `true`; a verified record is changed by
/// nothing except deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    /// Requester identity (primary key).
    pub identity_id: IdentityId,
    /// Identity text submissions are matched against.
    pub identity_text: String,
    /// One-time code issued to the requester.
    pub code: VerificationCode,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// `created_at + TTL`.
    pub expires_at: DateTime<Utc>,
    /// Whether a ledger match has been granted.
    pub verified: bool,
    /// Ticks left in the current poller's budget.
    pub poll_attempts_remaining: u32,
}

impl VerificationRecord {
    /// Create a fresh, unverified record.
    pub fn new(
        requester: &Requester,
        code: VerificationCode,
        now: DateTime<Utc>,
        ttl: Duration,
        poll_attempts: u32,
    ) -> Self {
        Self {
            identity_id: requester.id.clone(),
            identity_text: requester.display_name.clone(),
            code,
            created_at: now,
            expires_at: now + ttl,
            verified: false,
            poll_attempts_remaining: poll_attempts,
        }
    }

    /// Unverified and past its deadline.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.verified && now > self.expires_at
    }

    /// Verified, or still inside its TTL.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now)
    }

    /// Lifecycle state as observed at `now`.
    pub fn state(&self, now: DateTime<Utc>) -> VerificationState {
        if self.verified {
            VerificationState::Verified
        } else if self.is_expired(now) {
            VerificationState::Expired
        } else {
            VerificationState::Pending
        }
    }

    /// Time left before expiry, floored at zero.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }
}

/// Coarse status reported to requesters and admins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    /// Awaiting a ledger match.
    Pending,
    /// Granted.
    Verified,
    /// No record.
    None,
}

/// Answer to a status / inspect query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Identity the report is about.
    pub identity_id: IdentityId,
    /// Coarse status.
    pub status: StatusKind,
    /// Issued code, if a record exists.
    pub code: Option<VerificationCode>,
    /// Expiry, if a record exists.
    pub expires_at: Option<DateTime<Utc>>,
}

impl StatusReport {
    /// Build a report from an optional record.
    ///
    /// A stored record that has expired but not been swept yet still reports
    /// `pending`; the sweeper owns its removal.
    pub fn from_record(identity_id: IdentityId, record: Option<&VerificationRecord>) -> Self {
        match record {
            Some(r) => Self {
                identity_id,
                status: if r.verified { StatusKind::Verified } else { StatusKind::Pending },
                code: Some(r.code.clone()),
                expires_at: Some(r.expires_at),
            },
            None => Self {
                identity_id,
                status: StatusKind::None,
                code: None,
                expires_at: None,
            },
        }
    }
}
