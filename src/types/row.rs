//! Ledger row interpretation.
//!
//! The ledger hands back untyped rows of cells. Every row is classified once,
//! up front, into [`LedgerRow::Submission`] or [`LedgerRow::Malformed`]; the
//! reconciliation loop only ever looks at submissions.

use serde::{Deserialize, Serialize};

/// Column positions of the fields the kernel reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowLayout {
    /// Column holding the submitted code.
    pub code_column: usize,
    /// Column holding the submitted identity text.
    pub identity_column: usize,
    /// Column holding the submitted email, when a domain policy applies.
    pub email_column: Option<usize>,
}

impl Default for RowLayout {
    fn default() -> Self {
        Self {
            code_column: 0,
            identity_column: 1,
            email_column: None,
        }
    }
}

impl RowLayout {
    /// Minimum number of cells a row needs to be usable.
    pub fn required_columns(&self) -> usize {
        let max = self
            .code_column
            .max(self.identity_column)
            .max(self.email_column.unwrap_or(0));
        max + 1
    }

    /// Classify a raw row.
    pub fn parse(&self, index: usize, cells: &[String]) -> LedgerRow {
        let required = self.required_columns();
        if cells.len() < required {
            return LedgerRow::Malformed {
                index,
                reason: format!("expected at least {required} columns, got {}", cells.len()),
            };
        }

        let code = cells[self.code_column].trim();
        if code.is_empty() {
            return LedgerRow::Malformed {
                index,
                reason: "empty code cell".to_string(),
            };
        }

        LedgerRow::Submission(Submission {
            index,
            code: code.to_string(),
            identity_text: cells[self.identity_column].trim().to_string(),
            email: self
                .email_column
                .map(|col| cells[col].trim().to_ascii_lowercase()),
        })
    }
}

/// A ledger row, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerRow {
    /// A usable form submission.
    Submission(Submission),
    /// Too few columns or an empty code; skipped.
    Malformed {
        /// Row index within the fetched range.
        index: usize,
        /// What was wrong.
        reason: String,
    },
}

/// A usable form submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Row index within the fetched range.
    pub index: usize,
    /// Raw submitted code (trimmed, case preserved).
    pub code: String,
    /// Submitted identity text (trimmed).
    pub identity_text: String,
    /// Submitted email (trimmed, lowercased), when the layout has one.
    pub email: Option<String>,
}
