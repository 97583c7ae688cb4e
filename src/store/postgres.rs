//! PostgreSQL record store for production use.
//!
//! Records survive process restarts, which is what lets pending verifications
//! resume after a redeploy.
//!
//! ## Configuration
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `DATABASE_URL` | local `verification` db | connection string |
//! | `DB_MAX_CONNECTIONS` | 10 | pool ceiling |
//! | `DB_MIN_CONNECTIONS` | 1 | connections kept warm |
//! | `DB_CONNECT_TIMEOUT_SECS` | 10 | wait for a pooled connection |
//! | `DB_IDLE_TIMEOUT_SECS` | 300 | idle connection reaping |
//! | `DB_MAX_LIFETIME_SECS` | 1800 | connection recycling |
//!
//! ## Atomicity
//!
//! Every check-and-act is one SQL statement: conditional `INSERT .. ON CONFLICT
//! .. WHERE`, `UPDATE .. WHERE .. RETURNING`, `DELETE .. WHERE .. RETURNING`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;

use crate::config::env_or;
use crate::types::{IdentityId, VerificationCode, VerificationRecord};
use super::{CreateOutcome, DeletePredicate, PollClaim, RecordStore};

/// Table definition. Applied by [`PostgresRecordStore::ensure_schema`].
pub const RECORD_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS verification_records (
    identity_id             TEXT PRIMARY KEY,
    identity_text           TEXT NOT NULL,
    code                    TEXT NOT NULL,
    created_at              TIMESTAMPTZ NOT NULL,
    expires_at              TIMESTAMPTZ NOT NULL,
    verified                BOOLEAN NOT NULL DEFAULT FALSE,
    poll_attempts_remaining INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS verification_records_code_idx
    ON verification_records (code);
CREATE INDEX IF NOT EXISTS verification_records_pending_idx
    ON verification_records (expires_at) WHERE verified = FALSE;
"#;

const RECORD_COLUMNS: &str = "identity_id, identity_text, code, created_at, expires_at, \
                              verified, poll_attempts_remaining";

/// SQLSTATE for unique_violation.
const UNIQUE_VIOLATION: &str = "23505";

/// Pool settings for the record store.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Connection string.
    pub database_url: String,
    /// Pool ceiling.
    pub max_connections: u32,
    /// Connections kept open while idle.
    pub min_connections: u32,
    /// How long `acquire` waits for a free connection.
    pub acquire_timeout: Duration,
    /// Idle connections older than this are closed.
    pub idle_timeout: Duration,
    /// Connections are recycled after this long regardless of use.
    pub max_lifetime: Duration,
}

impl PostgresConfig {
    /// Read the `DATABASE_URL` and `DB_*` variables listed in the module docs.
    pub fn from_env() -> Self {
        let secs = |name: &str, default: u64| Duration::from_secs(env_or(name, default));
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/verification".to_string()),
            max_connections: env_or("DB_MAX_CONNECTIONS", 10),
            min_connections: env_or("DB_MIN_CONNECTIONS", 1),
            acquire_timeout: secs("DB_CONNECT_TIMEOUT_SECS", 10),
            idle_timeout: secs("DB_IDLE_TIMEOUT_SECS", 300),
            max_lifetime: secs("DB_MAX_LIFETIME_SECS", 1800),
        }
    }

    fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections.min(self.max_connections))
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(self.idle_timeout)
            .max_lifetime(self.max_lifetime)
            .test_before_acquire(true)
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Error type for PostgreSQL store.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A stored row does not decode into a record.
    #[error("Corrupt record row: {0}")]
    CorruptRow(String),
}

/// PostgreSQL record store.
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    /// Open a pool with `config`.
    pub async fn new(config: PostgresConfig) -> Result<Self, sqlx::Error> {
        tracing::info!(
            max_connections = config.max_connections,
            acquire_timeout_secs = config.acquire_timeout.as_secs(),
            "Opening record store pool"
        );
        let pool = config.pool_options().connect(&config.database_url).await?;
        Ok(Self { pool })
    }

    /// Open a pool configured from the environment.
    pub async fn from_env() -> Result<Self, sqlx::Error> {
        Self::new(PostgresConfig::from_env()).await
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the record table and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        // Multi-statement DDL goes through the simple query protocol.
        sqlx::Executor::execute(&self.pool, RECORD_TABLE_SCHEMA).await?;
        Ok(())
    }

    /// Check if the database is reachable.
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }

    /// Get pool statistics for monitoring.
    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            max: self.pool.options().get_max_connections(),
        }
    }

    /// Parse a record from a database row.
    fn parse_record_row(row: &PgRow) -> Result<VerificationRecord, PostgresError> {
        let identity_id: String = row.try_get("identity_id")?;
        let code: String = row.try_get("code")?;
        let attempts: i32 = row.try_get("poll_attempts_remaining")?;

        Ok(VerificationRecord {
            identity_id: IdentityId::new(identity_id),
            identity_text: row.try_get("identity_text")?,
            code: VerificationCode::parse(&code)
                .map_err(|e| PostgresError::CorruptRow(e.to_string()))?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
            verified: row.try_get("verified")?,
            poll_attempts_remaining: attempts.max(0) as u32,
        })
    }

    async fn fetch(&self, id: &IdentityId) -> Result<Option<VerificationRecord>, PostgresError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM verification_records WHERE identity_id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::parse_record_row).transpose()
    }
}

/// Pool statistics for monitoring.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    /// Current pool size.
    pub size: u32,
    /// Number of idle connections.
    pub idle: usize,
    /// Maximum pool size.
    pub max: u32,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    type Error = PostgresError;

    async fn create(
        &self,
        record: VerificationRecord,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome, Self::Error> {
        // Replaces the existing row only when it is unverified and expired.
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO verification_records ({RECORD_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, FALSE, $6)
            ON CONFLICT (identity_id) DO UPDATE SET
                identity_text = EXCLUDED.identity_text,
                code = EXCLUDED.code,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at,
                verified = FALSE,
                poll_attempts_remaining = EXCLUDED.poll_attempts_remaining
            WHERE verification_records.verified = FALSE
              AND verification_records.expires_at < $7
            RETURNING identity_id
            "#
        ))
        .bind(record.identity_id.as_str())
        .bind(&record.identity_text)
        .bind(record.code.as_str())
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(record.poll_attempts_remaining.min(i32::MAX as u32) as i32)
        .bind(now)
        .fetch_optional(&self.pool)
        .await;

        match inserted {
            Ok(Some(_)) => Ok(CreateOutcome::Created(record)),
            Ok(None) => match self.fetch(&record.identity_id).await? {
                Some(existing) => Ok(CreateOutcome::Existing(existing)),
                // Deleted between the conflict and the read; let the caller retry.
                None => Ok(CreateOutcome::CodeCollision),
            },
            Err(e) if is_unique_violation(&e) => {
                // The identity conflict is handled by ON CONFLICT, so this is the code index.
                // Expired holders of the code are purged so the retry can succeed.
                sqlx::query(
                    "DELETE FROM verification_records \
                     WHERE code = $1 AND verified = FALSE AND expires_at < $2",
                )
                .bind(record.code.as_str())
                .bind(now)
                .execute(&self.pool)
                .await?;
                Ok(CreateOutcome::CodeCollision)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &IdentityId) -> Result<Option<VerificationRecord>, Self::Error> {
        self.fetch(id).await
    }

    async fn claim_poll_attempt(&self, id: &IdentityId) -> Result<PollClaim, Self::Error> {
        let claimed = sqlx::query(&format!(
            r#"
            UPDATE verification_records
            SET poll_attempts_remaining = poll_attempts_remaining - 1
            WHERE identity_id = $1 AND verified = FALSE AND poll_attempts_remaining > 0
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = claimed {
            return Ok(PollClaim::Claimed(Self::parse_record_row(&row)?));
        }

        Ok(match self.fetch(id).await? {
            None => PollClaim::Missing,
            Some(record) if record.verified => PollClaim::Claimed(record),
            Some(record) => PollClaim::Exhausted(record),
        })
    }

    async fn reset_poll_budget(&self, id: &IdentityId, attempts: u32) -> Result<bool, Self::Error> {
        let result = sqlx::query(
            "UPDATE verification_records SET poll_attempts_remaining = $2 \
             WHERE identity_id = $1 AND verified = FALSE",
        )
        .bind(id.as_str())
        .bind(attempts.min(i32::MAX as u32) as i32)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_verified(
        &self,
        id: &IdentityId,
        code: &VerificationCode,
        now: DateTime<Utc>,
    ) -> Result<bool, Self::Error> {
        let result = sqlx::query(
            "UPDATE verification_records SET verified = TRUE \
             WHERE identity_id = $1 AND code = $2 AND (verified OR expires_at >= $3)",
        )
        .bind(id.as_str())
        .bind(code.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(
        &self,
        id: &IdentityId,
        predicate: DeletePredicate,
    ) -> Result<Option<VerificationRecord>, Self::Error> {
        let (condition, expired_before) = match predicate {
            DeletePredicate::Always => ("TRUE", None),
            DeletePredicate::Unverified => ("verified = FALSE", None),
            DeletePredicate::ExpiredAt(now) => ("verified = FALSE AND expires_at < $2", Some(now)),
        };

        let sql = format!(
            "DELETE FROM verification_records WHERE identity_id = $1 AND {condition} \
             RETURNING {RECORD_COLUMNS}"
        );
        let mut query = sqlx::query(&sql).bind(id.as_str());
        if let Some(now) = expired_before {
            query = query.bind(now);
        }

        let row = query.fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::parse_record_row).transpose()
    }

    async fn list_unverified(&self) -> Result<Vec<VerificationRecord>, Self::Error> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM verification_records \
             WHERE verified = FALSE ORDER BY created_at, identity_id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::parse_record_row).collect()
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<VerificationRecord>, Self::Error> {
        let rows = sqlx::query(&format!(
            "DELETE FROM verification_records \
             WHERE verified = FALSE AND expires_at < $1 \
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut swept = rows
            .iter()
            .map(Self::parse_record_row)
            .collect::<Result<Vec<_>, _>>()?;
        swept.sort_by(|a, b| a.identity_id.cmp(&b.identity_id));
        Ok(swept)
    }
}
