//! Core types for the verification kernel.

pub mod identity;
pub mod code;
pub mod record;
pub mod state;
pub mod row;

pub use identity::{IdentityId, Requester};
pub use code::{CodeGenerator, InvalidCode, VerificationCode, CODE_ALPHABET, DEFAULT_CODE_LENGTH};
pub use record::{StatusKind, StatusReport, VerificationRecord};
pub use state::{Transition, VerificationState};
pub use row::{LedgerRow, RowLayout, Submission};
