//! Error taxonomy for the verification kernel.

use chrono::{DateTime, Utc};

use crate::types::{IdentityId, VerificationCode, VerificationState, Transition};

/// Failures surfaced by commands, the state machine, and background tasks.
///
/// Commands translate these into status responses; background tasks log and
/// notify them. None of them crash the process.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VerificationError {
    /// A live record already exists for this identity.
    #[error("verification already pending for this identity (code {code}, expires {expires_at})")]
    DuplicateRequest {
        /// Code of the existing record.
        code: VerificationCode,
        /// When the existing record expires.
        expires_at: DateTime<Utc>,
    },

    /// The identity is already verified.
    #[error("identity {0} is already verified")]
    AlreadyVerified(IdentityId),

    /// No record exists for the identity.
    #[error("no verification record for {0}")]
    NotFound(IdentityId),

    /// The record's TTL has passed.
    #[error("verification code for {0} has expired")]
    Expired(IdentityId),

    /// Transient failure reading the ledger.
    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// The grant applier could not locate the identity.
    #[error("identity {0} could not be resolved by the grant applier")]
    IdentityUnresolvable(IdentityId),

    /// The grant call was rejected.
    #[error("grant rejected: {0}")]
    PermissionDenied(String),

    /// Transient failure reaching the privilege system.
    #[error("grant backend unavailable: {0}")]
    GrantUnavailable(String),

    /// A ledger row could not be interpreted. Skipped, never shown to users.
    #[error("malformed ledger row {index}: {reason}")]
    MalformedRow {
        /// Zero-based row index in the fetched range.
        index: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// A submission matched but its email domain is not allowed.
    #[error("email domain not allowed: {0}")]
    DomainNotAllowed(String),

    /// The state machine does not permit this transition.
    #[error("transition {transition:?} not allowed from state {from:?}")]
    InvalidTransition {
        /// State the record was in.
        from: VerificationState,
        /// Attempted transition.
        transition: Transition,
    },

    /// Could not mint a code that is not already held by a live record.
    #[error("could not allocate a unique verification code after {0} attempts")]
    CodeSpaceExhausted(usize),

    /// Record store failure.
    #[error("record store error: {0}")]
    Store(String),
}

impl VerificationError {
    /// Wrap a store backend error.
    pub fn store(err: impl std::error::Error) -> Self {
        Self::Store(err.to_string())
    }

    /// Whether a background task should retry on its next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LedgerUnavailable(_) | Self::GrantUnavailable(_) | Self::Store(_)
        )
    }

    /// Machine-readable code for service responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateRequest { .. } => "DUPLICATE_REQUEST",
            Self::AlreadyVerified(_) => "ALREADY_VERIFIED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Expired(_) => "EXPIRED",
            Self::LedgerUnavailable(_) => "LEDGER_UNAVAILABLE",
            Self::IdentityUnresolvable(_) => "IDENTITY_UNRESOLVABLE",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::GrantUnavailable(_) => "GRANT_UNAVAILABLE",
            Self::MalformedRow { .. } => "MALFORMED_ROW",
            Self::DomainNotAllowed(_) => "DOMAIN_NOT_ALLOWED",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::CodeSpaceExhausted(_) => "CODE_SPACE_EXHAUSTED",
            Self::Store(_) => "STORE_ERROR",
        }
    }
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// A value is outside its allowed range.
    #[error("{name} out of range: {reason}")]
    OutOfRange {
        /// Variable or field name.
        name: &'static str,
        /// Why it was rejected.
        reason: String,
    },
    /// A required variable is missing.
    #[error("missing required setting {0}")]
    Missing(&'static str),
}
