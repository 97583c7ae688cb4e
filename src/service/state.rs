//! Service state management.

use async_trait::async_trait;

use crate::engine::VerificationEngine;
use crate::store::postgres::PoolStats;
use crate::store::{InMemoryRecordStore, PostgresRecordStore, RecordStore};

/// Store-level health reporting used by the probes.
#[async_trait]
pub trait StoreHealth: Send + Sync {
    /// Whether the backend answers.
    async fn is_healthy(&self) -> bool;

    /// Pool statistics, for pooled backends.
    fn pool_stats(&self) -> Option<PoolStats> {
        None
    }
}

#[async_trait]
impl StoreHealth for PostgresRecordStore {
    async fn is_healthy(&self) -> bool {
        PostgresRecordStore::is_healthy(self).await
    }

    fn pool_stats(&self) -> Option<PoolStats> {
        Some(PostgresRecordStore::pool_stats(self))
    }
}

#[async_trait]
impl StoreHealth for InMemoryRecordStore {
    async fn is_healthy(&self) -> bool {
        true
    }
}

/// Shared service state.
pub struct ServiceState<S: RecordStore + 'static> {
    /// The verification engine.
    pub engine: VerificationEngine<S>,
    /// Token required in `X-Admin-Token` for admin routes; `None` disables them.
    admin_token: Option<String>,
}

impl<S: RecordStore + 'static> ServiceState<S> {
    /// Create state with an explicit admin token.
    pub fn new(engine: VerificationEngine<S>, admin_token: Option<String>) -> Self {
        Self {
            engine,
            admin_token: admin_token.filter(|t| !t.is_empty()),
        }
    }

    /// Create state reading `ADMIN_TOKEN` from the environment.
    pub fn from_env(engine: VerificationEngine<S>) -> Self {
        let admin_token = std::env::var("ADMIN_TOKEN").ok();
        if admin_token.as_deref().map_or(true, str::is_empty) {
            tracing::warn!("ADMIN_TOKEN not set, admin routes are disabled");
        }
        Self::new(engine, admin_token)
    }

    /// Whether `presented` grants admin access.
    pub(crate) fn admin_allowed(&self, presented: Option<&str>) -> bool {
        match (&self.admin_token, presented) {
            (Some(expected), Some(presented)) => constant_time_eq(expected.as_bytes(), presented.as_bytes()),
            _ => false,
        }
    }
}

impl<S: RecordStore + 'static> Clone for ServiceState<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            admin_token: self.admin_token.clone(),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
