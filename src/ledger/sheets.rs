//! Spreadsheet-backed ledger client.
//!
//! Talks to a spreadsheet values API (Google Sheets v4 wire format):
//!
//! - `GET  {base}/v4/spreadsheets/{id}/values/{range}`
//! - `POST {base}/v4/spreadsheets/{id}/values/{range}:append?valueInputOption=RAW`
//! - `PUT  {base}/v4/spreadsheets/{id}/values/{cell}?valueInputOption=RAW`
//!
//! ## Configuration
//!
//! - `LEDGER_SHEET_ID`: spreadsheet id (required)
//! - `LEDGER_SHEET_NAME`: tab name (default: "Bot Records")
//! - `LEDGER_FIRST_ROW`: first data row, 1-based (default: 2)
//! - `LEDGER_LAST_COLUMN`: last column letter of the range (default: "E")
//! - `LEDGER_ACCESS_TOKEN`: OAuth bearer token (required)
//! - `LEDGER_API_BASE`: API base URL (default: `https://sheets.googleapis.com`)
//! - `LEDGER_TIMEOUT_SECS`: per-request timeout (default: 10)
//!
//! Obtaining and refreshing the bearer token is left to the deployment.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::config::env_or;
use crate::error::ConfigError;
use super::{LedgerClient, LedgerError};

/// Connection settings for [`SheetsLedgerClient`].
#[derive(Debug, Clone)]
pub struct SheetsConfig {
    /// Spreadsheet id.
    pub sheet_id: String,
    /// Tab name.
    pub sheet_name: String,
    /// First data row (1-based, below the header).
    pub first_row: usize,
    /// Last column letter of the range.
    pub last_column: String,
    /// Bearer token.
    pub access_token: String,
    /// API base URL.
    pub api_base: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl SheetsConfig {
    /// Load from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let sheet_id = std::env::var("LEDGER_SHEET_ID")
            .map_err(|_| ConfigError::Missing("LEDGER_SHEET_ID"))?;
        let access_token = std::env::var("LEDGER_ACCESS_TOKEN")
            .map_err(|_| ConfigError::Missing("LEDGER_ACCESS_TOKEN"))?;

        Ok(Self {
            sheet_id,
            sheet_name: std::env::var("LEDGER_SHEET_NAME").unwrap_or_else(|_| "Bot Records".to_string()),
            first_row: env_or("LEDGER_FIRST_ROW", 2usize).max(1),
            last_column: std::env::var("LEDGER_LAST_COLUMN").unwrap_or_else(|_| "E".to_string()),
            access_token,
            api_base: std::env::var("LEDGER_API_BASE")
                .unwrap_or_else(|_| "https://sheets.googleapis.com".to_string()),
            timeout: Duration::from_secs(env_or("LEDGER_TIMEOUT_SECS", 10)),
        })
    }

    /// A1 range covering all data rows, e.g. `'Bot Records'!A2:E`.
    pub fn data_range(&self) -> String {
        format!("'{}'!A{}:{}", self.sheet_name, self.first_row, self.last_column)
    }

    /// A1 reference of one cell addressed by data-row index and column index.
    pub fn cell_ref(&self, row: usize, column: usize) -> String {
        format!("'{}'!{}{}", self.sheet_name, column_letter(column), self.first_row + row)
    }
}

/// Spreadsheet column letters for a zero-based index (0 → A, 26 → AA).
pub fn column_letter(mut index: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push((b'A' + (index % 26) as u8) as char);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    letters.iter().rev().collect()
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Serialize)]
struct ValueBody {
    values: Vec<Vec<String>>,
}

/// Ledger client backed by a spreadsheet values API.
pub struct SheetsLedgerClient {
    http: reqwest::Client,
    config: SheetsConfig,
}

impl SheetsLedgerClient {
    /// Build a client.
    pub fn new(config: SheetsConfig) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        Ok(Self { http, config })
    }

    fn values_url(&self, range: &str) -> String {
        format!(
            "{}/v4/spreadsheets/{}/values/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.sheet_id,
            range
        )
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, LedgerError> {
        let response = request
            .bearer_auth(&self.config.access_token)
            .send()
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        match response.status() {
            s if s.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(LedgerError::Unauthorized(format!("status {}", response.status())))
            }
            s => Err(LedgerError::Unavailable(format!("status {s}"))),
        }
    }
}

/// Render a JSON cell as the string the sheet displays.
fn cell_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl LedgerClient for SheetsLedgerClient {
    async fn fetch_rows(&self) -> Result<Vec<Vec<String>>, LedgerError> {
        let url = self.values_url(&self.config.data_range());
        let body: ValueRange = self
            .send(self.http.get(url))
            .await?
            .json()
            .await
            .map_err(|e| LedgerError::Unavailable(format!("undecodable response: {e}")))?;

        Ok(body
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_text).collect())
            .collect())
    }

    async fn append_row(&self, row: Vec<String>) -> Result<(), LedgerError> {
        let url = format!("{}:append", self.values_url(&self.config.data_range()));
        self.send(
            self.http
                .post(url)
                .query(&[("valueInputOption", "RAW")])
                .json(&ValueBody { values: vec![row] }),
        )
        .await?;
        Ok(())
    }

    async fn update_cell(&self, row: usize, column: usize, value: String) -> Result<(), LedgerError> {
        let url = self.values_url(&self.config.cell_ref(row, column));
        self.send(
            self.http
                .put(url)
                .query(&[("valueInputOption", "RAW")])
                .json(&ValueBody { values: vec![vec![value]] }),
        )
        .await?;
        Ok(())
    }
}
