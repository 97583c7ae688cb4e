//! External ledger access.
//!
//! The ledger is a shared spreadsheet-like table that a third-party form
//! appends to. It is eventually consistent and may hold unrelated or malformed
//! rows. The kernel reads it; some deployments also write back to it.

#[cfg(feature = "sheets")]
pub mod sheets;

use async_trait::async_trait;
use parking_lot::Mutex;

/// Errors from a ledger client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Transient I/O failure; retry on the next tick.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    /// Credentials rejected; retrying will not help.
    #[error("ledger access denied: {0}")]
    Unauthorized(String),
    /// The client does not implement this operation.
    #[error("ledger operation not supported: {0}")]
    Unsupported(&'static str),
}

/// Read (and optionally write) access to ledger rows.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Fetch every row of the configured range, in ledger order.
    async fn fetch_rows(&self) -> Result<Vec<Vec<String>>, LedgerError>;

    /// Append a row after the last one.
    async fn append_row(&self, _row: Vec<String>) -> Result<(), LedgerError> {
        Err(LedgerError::Unsupported("append_row"))
    }

    /// Overwrite one cell; `row` is an index into [`fetch_rows`](Self::fetch_rows)'s result.
    async fn update_cell(&self, _row: usize, _column: usize, _value: String) -> Result<(), LedgerError> {
        Err(LedgerError::Unsupported("update_cell"))
    }
}

/// In-memory ledger for testing.
///
/// Rows can be pushed at any time to simulate form submissions arriving, and
/// failures can be queued to simulate an unreliable backend.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    rows: Mutex<Vec<Vec<String>>>,
    queued_failures: Mutex<Vec<LedgerError>>,
    fetches: Mutex<usize>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row built from string slices.
    pub fn push_row(&self, cells: &[&str]) {
        self.rows
            .lock()
            .push(cells.iter().map(|c| c.to_string()).collect());
    }

    /// Make the next fetch fail with `error`. Failures are consumed in order.
    pub fn fail_next_fetch(&self, error: LedgerError) {
        self.queued_failures.lock().push(error);
    }

    /// Snapshot of all rows.
    pub fn rows(&self) -> Vec<Vec<String>> {
        self.rows.lock().clone()
    }

    /// Number of fetch calls made so far (including failed ones).
    pub fn fetch_count(&self) -> usize {
        *self.fetches.lock()
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn fetch_rows(&self) -> Result<Vec<Vec<String>>, LedgerError> {
        *self.fetches.lock() += 1;
        {
            let mut failures = self.queued_failures.lock();
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }
        Ok(self.rows.lock().clone())
    }

    async fn append_row(&self, row: Vec<String>) -> Result<(), LedgerError> {
        self.rows.lock().push(row);
        Ok(())
    }

    async fn update_cell(&self, row: usize, column: usize, value: String) -> Result<(), LedgerError> {
        let mut rows = self.rows.lock();
        let cells = rows
            .get_mut(row)
            .ok_or_else(|| LedgerError::Unavailable(format!("row {row} out of range")))?;
        if cells.len() <= column {
            cells.resize(column + 1, String::new());
        }
        cells[column] = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queued_failure_consumed_once() {
        let ledger = InMemoryLedger::new();
        ledger.push_row(&["AB12CD34", "john_doe"]);
        ledger.fail_next_fetch(LedgerError::Unavailable("timeout".into()));

        assert!(ledger.fetch_rows().await.is_err());
        assert_eq!(ledger.fetch_rows().await.unwrap().len(), 1);
        assert_eq!(ledger.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_update_cell_pads_short_rows() {
        let ledger = InMemoryLedger::new();
        ledger.push_row(&["AB12CD34", "john_doe"]);
        ledger.update_cell(0, 4, "1".into()).await.unwrap();
        assert_eq!(ledger.rows()[0], vec!["AB12CD34", "john_doe", "", "", "1"]);
    }
}
