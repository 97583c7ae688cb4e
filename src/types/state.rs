//! Verification lifecycle state machine.
//!
//! ```text
//!            request              match_found
//!   NONE ───────────────▶ PENDING ────────────▶ VERIFIED
//!     ▲                     │  │
//!     │          ttl_exceeded  cancel
//!     │                     ▼  ▼
//!     └──── delete ──── EXPIRED / CANCELLED
//! ```
//!
//! `VERIFIED`, `EXPIRED` and `CANCELLED` are absorbing; only deletion (reset or
//! sweep) leaves them, returning to `NONE`. Expired and cancelled records are
//! deleted immediately, so those two states are observed transiently and never
//! stored.

use serde::{Deserialize, Serialize};

use crate::error::VerificationError;
use super::identity::IdentityId;
use super::record::VerificationRecord;
use chrono::{DateTime, Utc};

/// Lifecycle state of one identity's verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    /// No record.
    None,
    /// Code issued, awaiting a ledger match.
    Pending,
    /// Ledger match found and grant applied.
    Verified,
    /// TTL passed without a match.
    Expired,
    /// Requester withdrew the request.
    Cancelled,
}

/// Events that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Requester asks for a code.
    Request,
    /// Poller found a qualifying ledger row and the grant succeeded.
    MatchFound,
    /// The record outlived its TTL.
    TtlExceeded,
    /// Requester asked to retry.
    Cancel,
    /// Record removed by reset or sweep.
    Delete,
}

impl VerificationState {
    /// State of an identity given its (possibly absent) record.
    pub fn of(record: Option<&VerificationRecord>, now: DateTime<Utc>) -> Self {
        record.map_or(Self::None, |r| r.state(now))
    }

    /// Whether no further transitions (other than deletion) are possible.
    pub fn is_absorbing(&self) -> bool {
        matches!(self, Self::Verified | Self::Expired | Self::Cancelled)
    }

    /// Apply a transition on behalf of `identity_id`.
    ///
    /// Errors carry the reason a command should report back instead of
    /// mutating anything.
    pub fn apply(
        self,
        transition: Transition,
        identity_id: &IdentityId,
    ) -> Result<Self, VerificationError> {
        use Transition as T;
        use VerificationState as S;

        match (self, transition) {
            (_, T::Delete) => Ok(S::None),

            (S::None | S::Expired | S::Cancelled, T::Request) => Ok(S::Pending),
            (S::Verified, T::Request) => Err(VerificationError::AlreadyVerified(identity_id.clone())),

            (S::Pending, T::MatchFound) => Ok(S::Verified),
            (S::Pending, T::TtlExceeded) => Ok(S::Expired),
            (S::Pending, T::Cancel) => Ok(S::Cancelled),

            (S::Verified, T::Cancel) => Err(VerificationError::AlreadyVerified(identity_id.clone())),
            (S::None, T::Cancel) => Err(VerificationError::NotFound(identity_id.clone())),
            (S::Expired, T::MatchFound) => Err(VerificationError::Expired(identity_id.clone())),

            (from, transition) => Err(VerificationError::InvalidTransition { from, transition }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> IdentityId {
        IdentityId::new("42")
    }

    #[test]
    fn test_happy_path() {
        let s = VerificationState::None.apply(Transition::Request, &id()).unwrap();
        assert_eq!(s, VerificationState::Pending);
        let s = s.apply(Transition::MatchFound, &id()).unwrap();
        assert_eq!(s, VerificationState::Verified);
    }

    #[test]
    fn test_pending_request_is_not_a_new_transition() {
        let err = VerificationState::Pending
            .apply(Transition::Request, &id())
            .unwrap_err();
        assert!(matches!(err, VerificationError::InvalidTransition { .. }));
    }

    #[test]
    fn test_verified_is_absorbing() {
        let s = VerificationState::Verified;
        assert!(s.is_absorbing());
        for t in [Transition::Request, Transition::MatchFound, Transition::TtlExceeded, Transition::Cancel] {
            assert!(s.apply(t, &id()).is_err(), "{t:?} must not leave VERIFIED");
        }
        assert_eq!(s.apply(Transition::Delete, &id()).unwrap(), VerificationState::None);
    }

    #[test]
    fn test_expired_cannot_be_verified() {
        let err = VerificationState::Expired
            .apply(Transition::MatchFound, &id())
            .unwrap_err();
        assert_eq!(err, VerificationError::Expired(id()));
    }

    #[test]
    fn test_cancel_without_record() {
        let err = VerificationState::None.apply(Transition::Cancel, &id()).unwrap_err();
        assert_eq!(err, VerificationError::NotFound(id()));
    }
}
