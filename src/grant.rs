//! Privilege grant boundary.
//!
//! The actual privilege system (roles in a community, groups in a directory)
//! lives outside the kernel. The kernel only guarantees *how* it is called:
//! at most one successful `grant` per matched record, with the record marked
//! verified only after the grant succeeds.
//!
//! Implementations must resolve the target identity before mutating anything
//! and report [`GrantError::NotFound`] when it cannot be resolved.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::types::IdentityId;

/// Successful grant result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    /// The privilege was applied by this call.
    Granted,
    /// The identity already held the privilege (e.g. a grant that landed
    /// before a crash). The record is reconciled to verified without a second
    /// grant.
    AlreadyGranted,
}

/// Grant failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GrantError {
    /// Identity cannot be resolved (left the group, deleted account).
    #[error("identity not found")]
    NotFound,
    /// The privilege system refused the change.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Transient failure reaching the privilege system.
    #[error("grant backend unavailable: {0}")]
    Unavailable(String),
}

/// External privilege-assignment boundary.
#[async_trait]
pub trait GrantApplier: Send + Sync {
    /// Grant the privilege to `identity`.
    async fn grant(&self, identity: &IdentityId) -> Result<GrantOutcome, GrantError>;

    /// Remove the opposing "unverified" marker, if the privilege model has one.
    /// Best-effort: failures are logged, never retried.
    async fn revoke_prior_marker(&self, _identity: &IdentityId) -> Result<(), GrantError> {
        Ok(())
    }
}

/// In-memory grant applier for testing.
///
/// Every identity is resolvable unless marked absent. Counts calls so tests can
/// assert the exactly-once contract.
#[derive(Debug, Default)]
pub struct InMemoryGrantApplier {
    state: Mutex<GrantState>,
}

#[derive(Debug, Default)]
struct GrantState {
    granted: BTreeSet<IdentityId>,
    marked_unverified: BTreeSet<IdentityId>,
    absent: BTreeSet<IdentityId>,
    denied: BTreeSet<IdentityId>,
    unavailable_calls: usize,
    calls: BTreeMap<IdentityId, usize>,
}

impl InMemoryGrantApplier {
    /// Create an applier where everyone is resolvable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `identity` unresolvable.
    pub fn mark_absent(&self, identity: impl Into<IdentityId>) {
        self.state.lock().absent.insert(identity.into());
    }

    /// Make grants to `identity` fail with `PermissionDenied`.
    pub fn deny(&self, identity: impl Into<IdentityId>) {
        self.state.lock().denied.insert(identity.into());
    }

    /// Give `identity` the "unverified" marker.
    pub fn mark_unverified(&self, identity: impl Into<IdentityId>) {
        self.state.lock().marked_unverified.insert(identity.into());
    }

    /// Pre-grant `identity`, as if a previous process granted before crashing.
    pub fn pre_grant(&self, identity: impl Into<IdentityId>) {
        self.state.lock().granted.insert(identity.into());
    }

    /// Fail the next `n` grant calls with `Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.state.lock().unavailable_calls = n;
    }

    /// Whether `identity` holds the privilege.
    pub fn is_granted(&self, identity: &IdentityId) -> bool {
        self.state.lock().granted.contains(identity)
    }

    /// Whether `identity` still carries the "unverified" marker.
    pub fn has_unverified_marker(&self, identity: &IdentityId) -> bool {
        self.state.lock().marked_unverified.contains(identity)
    }

    /// Number of `grant` calls made for `identity`.
    pub fn grant_calls(&self, identity: &IdentityId) -> usize {
        self.state.lock().calls.get(identity).copied().unwrap_or(0)
    }
}

#[async_trait]
impl GrantApplier for InMemoryGrantApplier {
    async fn grant(&self, identity: &IdentityId) -> Result<GrantOutcome, GrantError> {
        let mut state = self.state.lock();
        *state.calls.entry(identity.clone()).or_default() += 1;

        if state.unavailable_calls > 0 {
            state.unavailable_calls -= 1;
            return Err(GrantError::Unavailable("simulated outage".to_string()));
        }
        if state.absent.contains(identity) {
            return Err(GrantError::NotFound);
        }
        if state.denied.contains(identity) {
            return Err(GrantError::PermissionDenied("role above caller".to_string()));
        }

        Ok(if state.granted.insert(identity.clone()) {
            GrantOutcome::Granted
        } else {
            GrantOutcome::AlreadyGranted
        })
    }

    async fn revoke_prior_marker(&self, identity: &IdentityId) -> Result<(), GrantError> {
        let mut state = self.state.lock();
        if state.absent.contains(identity) {
            return Err(GrantError::NotFound);
        }
        state.marked_unverified.remove(identity);
        Ok(())
    }
}
