//! # verification-kernel
//!
//! One-time verification codes reconciled against an external ledger.
//!
//! A requester asks for a code, submits it (together with their identity
//! text) through a third-party form that appends rows to a shared ledger, and
//! a background poller grants the privilege once a matching row shows up.
//!
//! ## Core Contract
//!
//! 1. At most one live record (pending or verified) per identity
//! 2. `verified` is monotonic; only deletion removes a verified record
//! 3. A match invokes the grant applier exactly once and commits `verified`
//!    only after it succeeds
//! 4. An expired record is deleted and never verified afterwards
//!
//! ## Architecture
//!
//! ```text
//! request ─▶ VerificationEngine ─▶ RecordStore (Postgres or Memory)
//!                  │
//!                  ├─▶ ReconciliationPoller ─▶ LedgerClient ─▶ IdentityMatcher ─▶ GrantApplier
//!                  ├─▶ ReminderTask ─▶ Notifier
//!                  └─▶ ExpirySweeper
//! ```
//!
//! Per-identity tasks are tracked in a [`TaskRegistry`] so commands can cancel
//! them by identity.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod error;
pub mod config;
pub mod clock;
pub mod matcher;
pub mod store;
pub mod ledger;
pub mod grant;
pub mod notify;
pub mod registry;
pub mod poller;
pub mod reminder;
pub mod sweeper;
pub mod engine;

#[cfg(feature = "service")]
pub mod service;

// Re-exports
pub use types::{
    CodeGenerator, IdentityId, LedgerRow, Requester, RowLayout, StatusKind, StatusReport,
    Submission, Transition, VerificationCode, VerificationRecord, VerificationState,
};
pub use error::{ConfigError, VerificationError};
pub use config::{DomainPolicy, LedgerWriteback, TaskSchedule, VerificationConfig};
pub use clock::{Clock, ManualClock, SystemClock};
pub use matcher::{similarity, IdentityMatcher, DEFAULT_MATCH_THRESHOLD};
pub use store::{CreateOutcome, DeletePredicate, InMemoryRecordStore, PollClaim, RecordStore};
#[cfg(feature = "postgres")]
pub use store::PostgresRecordStore;
pub use ledger::{InMemoryLedger, LedgerClient, LedgerError};
pub use grant::{GrantApplier, GrantError, GrantOutcome, InMemoryGrantApplier};
pub use notify::{Audience, Notice, Notifier, RecordingNotifier, TracingNotifier};
pub use registry::{TaskLease, TaskRegistry};
pub use poller::{ReconciliationPoller, TickOutcome};
pub use reminder::ReminderTask;
pub use sweeper::ExpirySweeper;
pub use engine::{Collaborators, RequestOutcome, VerificationEngine, MAX_CODE_ATTEMPTS};
