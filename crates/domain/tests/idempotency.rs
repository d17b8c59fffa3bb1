use std::sync::Arc;
use std::time::Duration;

use catalog_domain::idempotency::{
    BeginOutcome, IdempotencyConfig, IdempotencyService, InMemoryIdempotencyStore,
};
use catalog_domain::plan::OpType;
use catalog_domain::ports::idempotency::{IdempotencyKey, IdempotencyState};

fn key(seed: &str) -> IdempotencyKey {
    IdempotencyKey::for_operation(seed, 0, OpType::PatchFields, &["r-1".to_string()])
}

#[tokio::test]
async fn completed_key_is_reported_with_change_id() {
    let store = InMemoryIdempotencyStore::new("test");
    let service = IdempotencyService::new(
        Arc::new(store),
        IdempotencyConfig {
            in_progress_ttl: Duration::from_secs(60),
            completed_ttl: Duration::from_secs(60),
        },
    );

    let key = key("job-1");
    let BeginOutcome::Started(claimed) = service.begin(&key, "job-1", 0).await.unwrap() else {
        panic!("first begin must start");
    };
    service.complete(claimed, "change-1").await.unwrap();

    match service.begin(&key, "job-1", 0).await.unwrap() {
        BeginOutcome::Completed(record) => {
            assert_eq!(record.state, IdempotencyState::Completed);
            assert_eq!(record.change_id.as_deref(), Some("change-1"));
            assert_eq!(record.job_id, "job-1");
        }
        other => panic!("expected completed, got {other:?}"),
    }
}

#[tokio::test]
async fn in_progress_conflict_is_visible() {
    let store = InMemoryIdempotencyStore::new("test");
    let service = IdempotencyService::new(Arc::new(store), IdempotencyConfig::default());

    let key = key("job-2");
    let outcome = service.begin(&key, "job-2", 0).await.unwrap();
    assert!(matches!(outcome, BeginOutcome::Started(_)));

    let outcome = service.begin(&key, "job-2", 0).await.unwrap();
    assert_eq!(outcome, BeginOutcome::InProgress);
}

#[tokio::test]
async fn in_progress_expiry_allows_new_start() {
    let store = InMemoryIdempotencyStore::new("test");
    let service = IdempotencyService::new(
        Arc::new(store),
        IdempotencyConfig {
            in_progress_ttl: Duration::from_millis(10),
            completed_ttl: Duration::ZERO,
        },
    );

    let key = key("job-3");
    let outcome = service.begin(&key, "job-3", 0).await.unwrap();
    assert!(matches!(outcome, BeginOutcome::Started(_)));

    tokio::time::sleep(Duration::from_millis(20)).await;

    let outcome = service.begin(&key, "job-3", 0).await.unwrap();
    assert!(matches!(outcome, BeginOutcome::Started(_)));
}

#[tokio::test]
async fn abandoned_claim_can_be_retried() {
    let store = Arc::new(InMemoryIdempotencyStore::new("test"));
    let service = IdempotencyService::new(store.clone(), IdempotencyConfig::default());

    let key = key("job-4");
    assert!(matches!(
        service.begin(&key, "job-4", 0).await.unwrap(),
        BeginOutcome::Started(_)
    ));
    service.abandon(&key).await.unwrap();
    assert!(store.is_empty());
    assert!(service.lookup(&key).await.unwrap().is_none());

    assert!(matches!(
        service.begin(&key, "job-4", 0).await.unwrap(),
        BeginOutcome::Started(_)
    ));
}
