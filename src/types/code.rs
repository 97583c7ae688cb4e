//! One-time verification codes.
//!
//! ## Uniqueness
//!
//! Codes are drawn uniformly from `{A-Z,0-9}^length` with a CSPRNG. The
//! generator itself does not guarantee uniqueness: at the default length the
//! space is 36^8 (~2.8e12) and codes live for minutes, so collisions are
//! improbable but possible. The record store reports a collision with a live
//! record's code at insertion time and the engine regenerates.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Alphabet codes are drawn from.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Default code length.
pub const DEFAULT_CODE_LENGTH: usize = 8;

/// A verification code.
///
/// Always stored in canonical form: trimmed, uppercase, alphabet-only.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VerificationCode(String);

/// Error returned when a string is not a valid code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid verification code: {0:?}")]
pub struct InvalidCode(pub String);

impl VerificationCode {
    /// Parse a code, normalizing case and surrounding whitespace.
    pub fn parse(raw: &str) -> Result<Self, InvalidCode> {
        let canonical = normalize(raw);
        if canonical.is_empty() || !canonical.bytes().all(|b| CODE_ALPHABET.contains(&b)) {
            return Err(InvalidCode(raw.to_string()));
        }
        Ok(Self(canonical))
    }

    /// Get the canonical code string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a raw ledger cell carries this code (case-normalized).
    pub fn matches_submission(&self, submitted: &str) -> bool {
        normalize(submitted) == self.0
    }
}

fn normalize(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

impl fmt::Display for VerificationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for VerificationCode {
    type Error = InvalidCode;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<VerificationCode> for String {
    fn from(code: VerificationCode) -> Self {
        code.0
    }
}

/// Produces random codes of a fixed length.
#[derive(Debug, Clone, Copy)]
pub struct CodeGenerator {
    length: usize,
}

impl CodeGenerator {
    /// Create a generator for codes of `length` characters (minimum 1).
    pub fn new(length: usize) -> Self {
        Self {
            length: length.max(1),
        }
    }

    /// Code length this generator produces.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Generate a fresh code.
    pub fn generate(&self) -> VerificationCode {
        let mut rng = rand::thread_rng();
        let code: String = (0..self.length)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        VerificationCode(code)
    }
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_CODE_LENGTH)
    }
}
