//! Engine configuration.
//!
//! ## Environment variables
//!
//! | Variable                 | Default | Meaning                                   |
//! |--------------------------|---------|-------------------------------------------|
//! | `CODE_TTL_SECS`          | 300     | Lifetime of an issued code                |
//! | `CODE_LENGTH`            | 8       | Characters per code                       |
//! | `MATCH_THRESHOLD`        | 0.85    | Inclusive identity similarity threshold   |
//! | `POLL_INTERVAL_SECS`     | 10      | Reconciliation poller period              |
//! | `POLL_MAX_TICKS`         | 30      | Poller tick budget                        |
//! | `REMINDER_INTERVAL_SECS` | 60      | Reminder period                           |
//! | `REMINDER_MAX_TICKS`     | 4       | Reminder budget (0 disables reminders)    |
//! | `SWEEP_INTERVAL_SECS`    | 60      | Expiry sweeper period                     |
//! | `ALLOWED_DOMAINS`        | (empty) | Comma list; non-empty enables domain policy |
//! | `LEDGER_CODE_COLUMN`     | 0       | Column of the submitted code              |
//! | `LEDGER_IDENTITY_COLUMN` | 1       | Column of the submitted identity text     |
//! | `LEDGER_EMAIL_COLUMN`    | (none)  | Column of the submitted email             |
//! | `LEDGER_VERIFIED_COLUMN` | (none)  | Column set to "1" on the matched row      |
//! | `LEDGER_RECORD_ISSUANCE` | false   | Append a row to the ledger for each code  |
//! | `FORM_LINK`              | (none)  | Link included in issuance notices         |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::matcher::DEFAULT_MATCH_THRESHOLD;
use crate::types::{RowLayout, DEFAULT_CODE_LENGTH};

/// Read and parse an environment variable, falling back to `default` when it
/// is unset or unparseable.
pub fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_opt<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Period and budget of a bounded repeating task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSchedule {
    /// Time between ticks.
    pub interval: Duration,
    /// Maximum number of ticks.
    pub max_ticks: u32,
}

impl TaskSchedule {
    /// Create a schedule.
    pub fn new(interval: Duration, max_ticks: u32) -> Self {
        Self { interval, max_ticks }
    }
}

/// Email-domain allow-list applied to matched submissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainPolicy {
    allowed: Vec<String>,
}

impl DomainPolicy {
    /// Build from domain names; blanks are dropped, case is folded.
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: domains
                .into_iter()
                .map(|d| d.as_ref().trim().trim_start_matches('@').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    /// Parse a comma-separated list. Returns `None` when no domain remains.
    pub fn parse_list(list: &str) -> Option<Self> {
        let policy = Self::new(list.split(','));
        (!policy.allowed.is_empty()).then_some(policy)
    }

    /// Allowed domains.
    pub fn domains(&self) -> &[String] {
        &self.allowed
    }

    /// Whether `email` ends in `@<allowed domain>`.
    pub fn allows(&self, email: &str) -> bool {
        let email = email.trim().to_ascii_lowercase();
        self.allowed
            .iter()
            .any(|domain| email.ends_with(&format!("@{domain}")))
    }
}

/// Optional writes back into the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerWriteback {
    /// Append `(code, "", expires_at, identity_id, "0")` when a code is issued.
    pub record_issuance: bool,
    /// Column set to `"1"` on the matched row after a grant.
    pub verified_column: Option<usize>,
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Lifetime of an issued code.
    pub code_ttl: Duration,
    /// Characters per code.
    pub code_length: usize,
    /// Inclusive identity similarity threshold.
    pub match_threshold: f64,
    /// Reconciliation poller schedule.
    pub poll: TaskSchedule,
    /// Reminder schedule; `None` disables reminders.
    pub reminder: Option<TaskSchedule>,
    /// Expiry sweeper period.
    pub sweep_interval: Duration,
    /// Domain allow-list; `None` disables the check.
    pub domain_policy: Option<DomainPolicy>,
    /// Where fields live in a ledger row.
    pub row_layout: RowLayout,
    /// Ledger writeback settings.
    pub writeback: LedgerWriteback,
    /// Form link included in issuance notices.
    pub form_link: Option<String>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            code_ttl: Duration::from_secs(300),
            code_length: DEFAULT_CODE_LENGTH,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            poll: TaskSchedule::new(Duration::from_secs(10), 30),
            reminder: Some(TaskSchedule::new(Duration::from_secs(60), 4)),
            sweep_interval: Duration::from_secs(60),
            domain_policy: None,
            row_layout: RowLayout::default(),
            writeback: LedgerWriteback::default(),
            form_link: None,
        }
    }
}

impl VerificationConfig {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let reminder_ticks: u32 = env_or("REMINDER_MAX_TICKS", 4);
        let reminder = (reminder_ticks > 0).then(|| {
            TaskSchedule::new(
                Duration::from_secs(env_or("REMINDER_INTERVAL_SECS", 60)),
                reminder_ticks,
            )
        });

        let domain_policy = std::env::var("ALLOWED_DOMAINS")
            .ok()
            .and_then(|list| DomainPolicy::parse_list(&list));

        Self {
            code_ttl: Duration::from_secs(env_or("CODE_TTL_SECS", 300)),
            code_length: env_or("CODE_LENGTH", defaults.code_length),
            match_threshold: env_or("MATCH_THRESHOLD", defaults.match_threshold),
            poll: TaskSchedule::new(
                Duration::from_secs(env_or("POLL_INTERVAL_SECS", 10)),
                env_or("POLL_MAX_TICKS", 30),
            ),
            reminder,
            sweep_interval: Duration::from_secs(env_or("SWEEP_INTERVAL_SECS", 60)),
            domain_policy,
            row_layout: RowLayout {
                code_column: env_or("LEDGER_CODE_COLUMN", 0),
                identity_column: env_or("LEDGER_IDENTITY_COLUMN", 1),
                email_column: env_opt("LEDGER_EMAIL_COLUMN"),
            },
            writeback: LedgerWriteback {
                record_issuance: env_or("LEDGER_RECORD_ISSUANCE", false),
                verified_column: env_opt("LEDGER_VERIFIED_COLUMN"),
            },
            form_link: std::env::var("FORM_LINK").ok().filter(|s| !s.trim().is_empty()),
        }
    }

    /// Reject settings that would break lifecycle invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.code_ttl.is_zero() || chrono::Duration::from_std(self.code_ttl).is_err() {
            return Err(ConfigError::OutOfRange {
                name: "CODE_TTL_SECS",
                reason: format!("{:?} is not a usable TTL", self.code_ttl),
            });
        }
        if !(4..=64).contains(&self.code_length) {
            return Err(ConfigError::OutOfRange {
                name: "CODE_LENGTH",
                reason: format!("{} not in 4..=64", self.code_length),
            });
        }
        if !(0.0..=1.0).contains(&self.match_threshold) {
            return Err(ConfigError::OutOfRange {
                name: "MATCH_THRESHOLD",
                reason: format!("{} not in 0.0..=1.0", self.match_threshold),
            });
        }
        if self.poll.interval.is_zero() || self.poll.max_ticks == 0 {
            return Err(ConfigError::OutOfRange {
                name: "POLL_INTERVAL_SECS/POLL_MAX_TICKS",
                reason: "poller needs a positive interval and at least one tick".to_string(),
            });
        }
        if self.reminder.is_some_and(|r| r.interval.is_zero()) {
            return Err(ConfigError::OutOfRange {
                name: "REMINDER_INTERVAL_SECS",
                reason: "must be positive".to_string(),
            });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::OutOfRange {
                name: "SWEEP_INTERVAL_SECS",
                reason: "must be positive".to_string(),
            });
        }
        if self.domain_policy.is_some() && self.row_layout.email_column.is_none() {
            return Err(ConfigError::Missing("LEDGER_EMAIL_COLUMN"));
        }
        Ok(())
    }

    /// Code TTL as a chrono duration for timestamp arithmetic.
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.code_ttl).unwrap_or_else(|_| chrono::Duration::seconds(300))
    }
}
