//! Concurrency guarantees under a multi-threaded runtime.
//!
//! Pollers use the default 10s interval and never tick within these tests;
//! only the racing commands and store operations run.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use verification_kernel::{
    DeletePredicate, ExpirySweeper, IdentityId, InMemoryGrantApplier, InMemoryLedger,
    InMemoryRecordStore, RecordStore, RecordingNotifier, RequestOutcome, Requester,
    VerificationCode, VerificationConfig, VerificationEngine, VerificationRecord,
};

// ─────────────────────────────────────────────────────────────────────────────
// Test Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn engine() -> (VerificationEngine<InMemoryRecordStore>, Arc<InMemoryRecordStore>, Arc<RecordingNotifier>) {
    let store = Arc::new(InMemoryRecordStore::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let config = VerificationConfig {
        reminder: None,
        ..VerificationConfig::default()
    };
    let engine = VerificationEngine::new(
        store.clone(),
        Arc::new(InMemoryLedger::new()),
        Arc::new(InMemoryGrantApplier::new()),
        notifier.clone(),
        config,
    )
    .expect("valid config");
    (engine, store, notifier)
}

fn pending(id: &str, code: &str) -> VerificationRecord {
    VerificationRecord::new(
        &Requester::new(id, "someone"),
        VerificationCode::parse(code).unwrap(),
        Utc::now(),
        chrono::Duration::minutes(5),
        30,
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Request Races
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_issue_one_code() {
    let (engine, store, notifier) = engine();

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.request(Requester::new("42", "john_doe")).await })
        })
        .collect();

    let mut issued = 0;
    let mut codes = HashSet::new();
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        if matches!(outcome, RequestOutcome::Issued(_)) {
            issued += 1;
        }
        codes.insert(outcome.record().code.clone());
    }

    assert_eq!(issued, 1);
    assert_eq!(codes.len(), 1, "every caller sees the same code");
    assert_eq!(store.len(), 1);
    assert_eq!(engine.registry().active_count(), 1);
    assert_eq!(notifier.count("code_issued"), 1);

    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_identities_do_not_contend() {
    let (engine, store, _) = engine();

    let handles: Vec<_> = (0..50u64)
        .map(|n| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.request(Requester::new(n, format!("user{n}"))).await })
        })
        .collect();

    let mut codes = HashSet::new();
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            RequestOutcome::Issued(record) => {
                codes.insert(record.code);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(codes.len(), 50);
    assert_eq!(store.len(), 50);
    assert_eq!(engine.registry().active_count(), 50);

    engine.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.registry().active_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_and_retry_race_leaves_consistent_state() {
    let (engine, store, _) = engine();
    let id = IdentityId::new("42");

    for _ in 0..20 {
        let requester = engine.clone();
        let retrier = engine.clone();
        let retry_id = id.clone();

        let (requested, retried) = tokio::join!(
            tokio::spawn(async move { requester.request(Requester::new("42", "john_doe")).await }),
            tokio::spawn(async move { retrier.retry(&retry_id).await }),
        );
        requested.unwrap().unwrap();
        let retried = retried.unwrap();

        // Either the retry won (no record) or the request landed after it.
        let record = store.get(&id).await.unwrap();
        match retried {
            Ok(_) => assert!(record.is_none() || !record.as_ref().unwrap().verified),
            Err(_) => assert!(record.is_some()),
        }
        assert!(store.len() <= 1);

        engine.reset(&id).await.ok();
    }

    engine.shutdown();
}

// ─────────────────────────────────────────────────────────────────────────────
// Store Races
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_verified_is_never_deleted_by_unverified_delete() {
    let store = Arc::new(InMemoryRecordStore::new());

    for n in 0..200u64 {
        let id = IdentityId::from(n);
        let record = pending(id.as_str(), "AB12CD34");
        let code = record.code.clone();
        store.put(record);

        let verifier = Arc::clone(&store);
        let deleter = Arc::clone(&store);
        let (vid, did) = (id.clone(), id.clone());

        let (verified, deleted) = tokio::join!(
            tokio::spawn(async move { verifier.mark_verified(&vid, &code, Utc::now()).await }),
            tokio::spawn(async move { deleter.delete(&did, DeletePredicate::Unverified).await }),
        );
        let verified = verified.unwrap().unwrap();
        let deleted = deleted.unwrap().unwrap();

        // Exactly one side wins.
        assert_ne!(verified, deleted.is_some(), "identity {n}");
        let stored = store.get(&id).await.unwrap();
        if verified {
            assert!(stored.unwrap().verified);
        } else {
            assert!(stored.is_none());
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sweeper_spares_verified_records() {
    let (engine, store, notifier) = engine();

    let mut stale_verified = pending("1", "AB12CD34");
    stale_verified.expires_at = Utc::now() - chrono::Duration::minutes(10);
    stale_verified.verified = true;
    store.put(stale_verified);

    let mut stale_pending = pending("2", "ZZ99YY88");
    stale_pending.expires_at = Utc::now() - chrono::Duration::minutes(10);
    store.put(stale_pending);

    store.put(pending("3", "QQ11WW22"));

    let sweeper = ExpirySweeper::new(
        engine.services().clone(),
        Arc::clone(engine.registry()),
        Duration::from_secs(60),
    );

    // Two sweeps racing each other delete the stale record once.
    let (a, b) = tokio::join!(sweeper.sweep_once(), sweeper.sweep_once());
    let swept: Vec<_> = a.unwrap().into_iter().chain(b.unwrap()).collect();

    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].identity_id, IdentityId::new("2"));
    assert_eq!(notifier.count("expired"), 1);

    assert!(store.get(&IdentityId::new("1")).await.unwrap().unwrap().verified);
    assert!(store.get(&IdentityId::new("3")).await.unwrap().is_some());
}
