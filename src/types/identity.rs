//! Requester identity types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable external identifier of a requester.
///
/// Opaque to the kernel; the messaging platform decides its shape (a numeric
/// snowflake, an account handle, ...). Ordered so listings are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    /// Create an identity id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for IdentityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for IdentityId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// The party asking to be verified.
///
/// `display_name` is the identity text the requester is told to submit to the
/// ledger form; ledger submissions are fuzzy-matched against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    /// Stable identifier (record primary key).
    pub id: IdentityId,
    /// Human-readable identity text, as the platform renders it.
    pub display_name: String,
}

impl Requester {
    /// Create a requester.
    pub fn new(id: impl Into<IdentityId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}
