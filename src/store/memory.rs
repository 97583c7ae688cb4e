//! In-memory record store.
//!
//! Not durable; used by tests and single-process deployments that accept
//! losing pending records on restart.

use std::collections::BTreeMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::types::{IdentityId, VerificationCode, VerificationRecord};
use super::{CreateOutcome, DeletePredicate, PollClaim, RecordStore};

/// Error type for the in-memory store. Operations cannot fail.
pub type InMemoryError = std::convert::Infallible;

/// In-memory record store.
///
/// A single lock guards the map so every check-and-act runs under one write
/// guard. BTreeMap keeps listings in a stable order.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: RwLock<BTreeMap<IdentityId, VerificationRecord>>,
}

impl InMemoryRecordStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a record without any checks (test setup).
    pub fn put(&self, record: VerificationRecord) {
        self.records.write().insert(record.identity_id.clone(), record);
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    type Error = InMemoryError;

    async fn create(
        &self,
        record: VerificationRecord,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome, Self::Error> {
        let mut records = self.records.write();

        if let Some(existing) = records.get(&record.identity_id) {
            if existing.is_live(now) {
                return Ok(CreateOutcome::Existing(existing.clone()));
            }
        }

        let collides = records.values().any(|r| {
            r.identity_id != record.identity_id && r.code == record.code && r.is_live(now)
        });
        if collides {
            return Ok(CreateOutcome::CodeCollision);
        }

        records.insert(record.identity_id.clone(), record.clone());
        Ok(CreateOutcome::Created(record))
    }

    async fn get(&self, id: &IdentityId) -> Result<Option<VerificationRecord>, Self::Error> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn claim_poll_attempt(&self, id: &IdentityId) -> Result<PollClaim, Self::Error> {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(id) else {
            return Ok(PollClaim::Missing);
        };

        if record.verified {
            return Ok(PollClaim::Claimed(record.clone()));
        }
        if record.poll_attempts_remaining == 0 {
            return Ok(PollClaim::Exhausted(record.clone()));
        }

        record.poll_attempts_remaining -= 1;
        Ok(PollClaim::Claimed(record.clone()))
    }

    async fn reset_poll_budget(&self, id: &IdentityId, attempts: u32) -> Result<bool, Self::Error> {
        let mut records = self.records.write();
        match records.get_mut(id) {
            Some(record) if !record.verified => {
                record.poll_attempts_remaining = attempts;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_verified(
        &self,
        id: &IdentityId,
        code: &VerificationCode,
        now: DateTime<Utc>,
    ) -> Result<bool, Self::Error> {
        let mut records = self.records.write();
        match records.get_mut(id) {
            Some(record) if &record.code == code && !record.is_expired(now) => {
                record.verified = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(
        &self,
        id: &IdentityId,
        predicate: DeletePredicate,
    ) -> Result<Option<VerificationRecord>, Self::Error> {
        let mut records = self.records.write();
        let holds = records.get(id).is_some_and(|r| predicate.holds(r));
        Ok(if holds { records.remove(id) } else { None })
    }

    async fn list_unverified(&self) -> Result<Vec<VerificationRecord>, Self::Error> {
        let mut pending: Vec<_> = self
            .records
            .read()
            .values()
            .filter(|r| !r.verified)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.identity_id.cmp(&b.identity_id))
        });
        Ok(pending)
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<VerificationRecord>, Self::Error> {
        let predicate = DeletePredicate::ExpiredAt(now);
        let mut records = self.records.write();
        let expired: Vec<IdentityId> = records
            .values()
            .filter(|r| predicate.holds(r))
            .map(|r| r.identity_id.clone())
            .collect();

        Ok(expired
            .iter()
            .filter_map(|id| records.remove(id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Requester;
    use chrono::Duration;

    fn make_record(id: &str, code: &str, now: DateTime<Utc>) -> VerificationRecord {
        VerificationRecord::new(
            &Requester::new(id, format!("user_{id}")),
            VerificationCode::parse(code).unwrap(),
            now,
            Duration::minutes(5),
            3,
        )
    }

    #[tokio::test]
    async fn test_create_rejects_live_duplicate() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();

        let first = make_record("1", "AAAA1111", now);
        assert_eq!(
            store.create(first.clone(), now).await.unwrap(),
            CreateOutcome::Created(first.clone())
        );

        let second = make_record("1", "BBBB2222", now);
        assert_eq!(
            store.create(second, now).await.unwrap(),
            CreateOutcome::Existing(first)
        );
    }

    #[tokio::test]
    async fn test_create_replaces_expired_record() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();
        store.create(make_record("1", "AAAA1111", now), now).await.unwrap();

        let later = now + Duration::minutes(6);
        let fresh = make_record("1", "BBBB2222", later);
        assert_eq!(
            store.create(fresh.clone(), later).await.unwrap(),
            CreateOutcome::Created(fresh)
        );
    }

    #[tokio::test]
    async fn test_create_never_replaces_verified_record() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();
        let record = make_record("1", "AAAA1111", now);
        store.create(record.clone(), now).await.unwrap();
        store.mark_verified(&record.identity_id, &record.code, now).await.unwrap();

        let much_later = now + Duration::days(1);
        let outcome = store
            .create(make_record("1", "BBBB2222", much_later), much_later)
            .await
            .unwrap();
        assert!(matches!(outcome, CreateOutcome::Existing(r) if r.verified));
    }

    #[tokio::test]
    async fn test_code_collision_detected() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();
        store.create(make_record("1", "AAAA1111", now), now).await.unwrap();
        assert_eq!(
            store.create(make_record("2", "AAAA1111", now), now).await.unwrap(),
            CreateOutcome::CodeCollision
        );
    }

    #[tokio::test]
    async fn test_claim_consumes_budget() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();
        let record = make_record("1", "AAAA1111", now);
        let id = record.identity_id.clone();
        store.put(record);

        for expected in [2, 1, 0] {
            match store.claim_poll_attempt(&id).await.unwrap() {
                PollClaim::Claimed(r) => assert_eq!(r.poll_attempts_remaining, expected),
                other => panic!("expected claim, got {other:?}"),
            }
        }
        assert!(matches!(
            store.claim_poll_attempt(&id).await.unwrap(),
            PollClaim::Exhausted(_)
        ));

        assert!(store.reset_poll_budget(&id, 5).await.unwrap());
        assert!(matches!(
            store.claim_poll_attempt(&id).await.unwrap(),
            PollClaim::Claimed(r) if r.poll_attempts_remaining == 4
        ));
    }

    #[tokio::test]
    async fn test_claim_missing_record() {
        let store = InMemoryRecordStore::new();
        assert_eq!(
            store.claim_poll_attempt(&IdentityId::new("nobody")).await.unwrap(),
            PollClaim::Missing
        );
    }

    #[tokio::test]
    async fn test_mark_verified_requires_same_code() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();
        let record = make_record("1", "AAAA1111", now);
        let id = record.identity_id.clone();
        store.put(record.clone());

        let stale = VerificationCode::parse("ZZZZ9999").unwrap();
        assert!(!store.mark_verified(&id, &stale, now).await.unwrap());
        assert!(store.mark_verified(&id, &record.code, now).await.unwrap());
        // Idempotent, even once the TTL has passed.
        let later = now + Duration::minutes(10);
        assert!(store.mark_verified(&id, &record.code, later).await.unwrap());
        assert!(store.get(&id).await.unwrap().unwrap().verified);
    }

    #[tokio::test]
    async fn test_mark_verified_refuses_expired_record() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();
        let record = make_record("1", "AAAA1111", now);
        let id = record.identity_id.clone();
        store.put(record.clone());

        assert!(store.mark_verified(&id, &record.code, record.expires_at).await.unwrap());
        store.put(record.clone());

        let past_deadline = record.expires_at + Duration::seconds(1);
        assert!(!store.mark_verified(&id, &record.code, past_deadline).await.unwrap());
        assert!(!store.get(&id).await.unwrap().unwrap().verified);
    }

    #[tokio::test]
    async fn test_conditional_delete_spares_verified() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();
        let record = make_record("1", "AAAA1111", now);
        let id = record.identity_id.clone();
        store.put(record.clone());
        store.mark_verified(&id, &record.code, now).await.unwrap();

        assert!(store.delete(&id, DeletePredicate::Unverified).await.unwrap().is_none());
        let after_ttl = now + Duration::minutes(10);
        assert!(store.delete(&id, DeletePredicate::ExpiredAt(after_ttl)).await.unwrap().is_none());
        assert!(store.delete(&id, DeletePredicate::Always).await.unwrap().is_some());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_only_removes_expired_unverified() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();

        let stale = make_record("1", "AAAA1111", now - Duration::minutes(10));
        let fresh = make_record("2", "BBBB2222", now);
        let verified = VerificationRecord {
            verified: true,
            ..make_record("3", "CCCC3333", now - Duration::minutes(10))
        };
        store.put(stale.clone());
        store.put(fresh);
        store.put(verified);

        let swept = store.sweep_expired(now).await.unwrap();
        assert_eq!(swept, vec![stale]);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_list_unverified_ordered_by_creation() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();
        store.put(make_record("b", "BBBB2222", now));
        store.put(make_record("a", "AAAA1111", now + Duration::seconds(1)));

        let listed: Vec<_> = store
            .list_unverified()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.identity_id.to_string())
            .collect();
        assert_eq!(listed, vec!["b", "a"]);
    }
}
