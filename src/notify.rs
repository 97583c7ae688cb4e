//! Out-of-band notices to requesters and the audit channel.
//!
//! The kernel emits typed [`Notice`]s; rendering them as chat messages, DMs or
//! emails is the transport's business.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use async_trait::async_trait;

use crate::types::{IdentityId, VerificationCode};

/// Who a notice is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    /// Only the requester.
    Requester,
    /// Only the audit channel.
    Audit,
    /// Both.
    Both,
}

/// Something worth telling someone about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    /// A fresh code was issued.
    CodeIssued {
        /// Requester.
        identity_id: IdentityId,
        /// Issued code.
        code: VerificationCode,
        /// Expiry.
        expires_at: DateTime<Utc>,
        /// Identity text the requester must submit.
        identity_text: String,
        /// Where to submit it.
        form_link: Option<String>,
    },
    /// The requester asked again while a code was pending.
    CodeRedelivered {
        /// Requester.
        identity_id: IdentityId,
        /// Existing code.
        code: VerificationCode,
        /// Whole minutes left.
        minutes_remaining: i64,
        /// Where to submit it.
        form_link: Option<String>,
    },
    /// Periodic nudge while pending.
    Reminder {
        /// Requester.
        identity_id: IdentityId,
        /// Pending code.
        code: VerificationCode,
        /// Expiry.
        expires_at: DateTime<Utc>,
    },
    /// Ledger match granted.
    Verified {
        /// Requester.
        identity_id: IdentityId,
        /// Matched code.
        code: VerificationCode,
    },
    /// Code expired without a match.
    Expired {
        /// Requester.
        identity_id: IdentityId,
    },
    /// Matching submission used an email domain outside the allow-list.
    DomainRejected {
        /// Requester.
        identity_id: IdentityId,
        /// Submitted email.
        email: String,
    },
    /// The grant could not be applied; the poller gave up.
    GrantFailed {
        /// Requester.
        identity_id: IdentityId,
        /// Machine-readable reason.
        reason: String,
    },
    /// The poller hit a ledger error.
    LedgerError {
        /// Requester whose poller hit it.
        identity_id: IdentityId,
        /// Error text.
        error: String,
        /// Whether the poller gave up.
        fatal: bool,
    },
}

impl Notice {
    /// Identity the notice concerns.
    pub fn identity_id(&self) -> &IdentityId {
        match self {
            Self::CodeIssued { identity_id, .. }
            | Self::CodeRedelivered { identity_id, .. }
            | Self::Reminder { identity_id, .. }
            | Self::Verified { identity_id, .. }
            | Self::Expired { identity_id }
            | Self::DomainRejected { identity_id, .. }
            | Self::GrantFailed { identity_id, .. }
            | Self::LedgerError { identity_id, .. } => identity_id,
        }
    }

    /// Who should receive it.
    pub fn audience(&self) -> Audience {
        match self {
            Self::CodeIssued { .. } | Self::CodeRedelivered { .. } | Self::Reminder { .. } => {
                Audience::Requester
            }
            Self::Verified { .. }
            | Self::Expired { .. }
            | Self::DomainRejected { .. }
            | Self::GrantFailed { .. } => Audience::Both,
            Self::LedgerError { .. } => Audience::Audit,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CodeIssued { .. } => "code_issued",
            Self::CodeRedelivered { .. } => "code_redelivered",
            Self::Reminder { .. } => "reminder",
            Self::Verified { .. } => "verified",
            Self::Expired { .. } => "expired",
            Self::DomainRejected { .. } => "domain_rejected",
            Self::GrantFailed { .. } => "grant_failed",
            Self::LedgerError { .. } => "ledger_error",
        }
    }
}

/// Delivery failure. Notices are best-effort; callers log and move on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("notice delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Notice sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a notice.
    async fn deliver(&self, notice: Notice) -> Result<(), DeliveryError>;
}

/// Deliver and log on failure. Delivery problems never affect state transitions.
pub async fn deliver_best_effort(notifier: &dyn Notifier, notice: Notice) {
    let kind = notice.kind();
    let identity_id = notice.identity_id().clone();
    if let Err(e) = notifier.deliver(notice).await {
        tracing::warn!(identity_id = %identity_id, kind, error = %e, "Notice delivery failed");
    }
}

/// Notifier that writes notices to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn deliver(&self, notice: Notice) -> Result<(), DeliveryError> {
        tracing::info!(
            target: "verification_kernel::notice",
            identity_id = %notice.identity_id(),
            kind = notice.kind(),
            audience = ?notice.audience(),
            "notice"
        );
        Ok(())
    }
}

/// Notifier that keeps every notice (testing).
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All notices so far.
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().clone()
    }

    /// Kinds of all notices so far, in order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.notices.lock().iter().map(Notice::kind).collect()
    }

    /// Number of notices of `kind`.
    pub fn count(&self, kind: &str) -> usize {
        self.notices.lock().iter().filter(|n| n.kind() == kind).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, notice: Notice) -> Result<(), DeliveryError> {
        self.notices.lock().push(notice);
        Ok(())
    }
}
