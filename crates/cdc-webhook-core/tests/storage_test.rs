//! Repository tests against a real PostgreSQL database.
//!
//! Each test creates its own database on the server named by `DATABASE_URL`
//! and returns early when the variable is unset.

use std::collections::HashSet;

use cdc_webhook_core::{
    error::CoreError, Backoff, CredentialRecord, DeliveryOutcome, EventQueueRecord, QueueStatus,
    RetryPolicy, TargetSource, TriggerKey, WebhookHeaders,
};
use cdc_webhook_testing::{employees, fixed_time, BindingBuilder, ChangeEventBuilder, TestDatabase};
use chrono::{DateTime, Duration, Utc};

fn key(name: &str) -> TriggerKey {
    TriggerKey::new(employees(), name)
}

fn record(name: &str, policy: RetryPolicy, due: DateTime<Utc>) -> EventQueueRecord {
    let event = ChangeEventBuilder::insert().trigger(name, None).created_at(due).build();
    let headers: WebhookHeaders = [("X-Source", "hr"), ("Authorization", "token")].into_iter().collect();
    EventQueueRecord::new(
        key(name),
        TargetSource::Inline { url: "http://sink.example/hook".to_string(), headers },
        event,
        5,
        policy,
        due,
    )
}

#[tokio::test]
async fn schema_install_is_idempotent_and_healthy() {
    let Some(db) = TestDatabase::create().await.unwrap() else { return };

    db.storage().install_schema().await.unwrap();
    db.storage().health_check().await.unwrap();

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn claim_takes_due_records_oldest_first() {
    let Some(db) = TestDatabase::create().await.unwrap() else { return };
    let queue = &db.storage().event_queue;
    let now = fixed_time();

    let later = queue.enqueue(&record("later", RetryPolicy::no_retries(), now - Duration::seconds(1))).await.unwrap();
    let earlier = queue.enqueue(&record("earlier", RetryPolicy::no_retries(), now - Duration::seconds(5))).await.unwrap();
    let future = queue.enqueue(&record("future", RetryPolicy::no_retries(), now + Duration::seconds(30))).await.unwrap();

    let claimed = queue.claim_due(now, 10).await.unwrap();

    assert_eq!(claimed.iter().map(|r| r.id).collect::<Vec<_>>(), vec![earlier, later]);
    assert!(claimed.iter().all(|r| r.status == QueueStatus::InProgress && r.updated_at == now));
    assert_eq!(claimed[0].trigger, key("earlier"));
    match &claimed[0].source {
        TargetSource::Inline { headers, .. } => assert_eq!(headers.names(), vec!["X-Source", "Authorization"]),
        TargetSource::Stored => panic!("expected inline source"),
    }

    assert!(queue.claim_due(now, 10).await.unwrap().is_empty());
    assert_eq!(queue.find_by_id(future).await.unwrap().unwrap().status, QueueStatus::Pending);
    assert_eq!(queue.count_by_status(QueueStatus::InProgress).await.unwrap(), 2);

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn concurrent_claims_never_share_a_record() {
    let Some(db) = TestDatabase::create().await.unwrap() else { return };
    let queue = &db.storage().event_queue;
    let now = fixed_time();

    for i in 0..10 {
        let due = now - Duration::seconds(i);
        queue.enqueue(&record(&format!("trigger_{i}"), RetryPolicy::no_retries(), due)).await.unwrap();
    }

    let (first, second) = tokio::join!(queue.claim_due(now, 6), queue.claim_due(now, 6));
    let ids: Vec<_> = first.unwrap().into_iter().chain(second.unwrap()).map(|r| r.id).collect();
    let unique: HashSet<_> = ids.iter().copied().collect();

    assert_eq!(ids.len(), unique.len());
    assert_eq!(queue.count_by_status(QueueStatus::InProgress).await.unwrap(), ids.len() as i64);

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn outcomes_build_history_until_failed() {
    let Some(db) = TestDatabase::create().await.unwrap() else { return };
    let queue = &db.storage().event_queue;
    let now = fixed_time();
    let policy = RetryPolicy::new(1, 10, Backoff::Linear).unwrap();
    let id = queue.enqueue(&record("employee_async", policy, now)).await.unwrap();

    queue.claim_due(now, 1).await.unwrap();
    let first = queue
        .record_outcome(id, &DeliveryOutcome::from_status(503, Some("busy".to_string())), now)
        .await
        .unwrap();
    assert_eq!(first.status, QueueStatus::Pending);
    assert_eq!(first.next_attempt, Some(now + Duration::seconds(10)));

    let retry_at = now + Duration::seconds(10);
    assert_eq!(queue.claim_due(retry_at, 1).await.unwrap().len(), 1);
    queue.record_outcome(id, &DeliveryOutcome::transport("connection refused"), retry_at).await.unwrap();

    let stored = queue.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, QueueStatus::Failed);
    assert_eq!(stored.attempt_count, 2);
    assert_eq!(stored.attempt_times, vec![now, retry_at]);
    assert_eq!(stored.attempt_statuses, vec![Some(503), None]);
    assert_eq!(
        stored.attempt_responses,
        vec![Some("busy".to_string()), Some("connection refused".to_string())]
    );
    assert!(stored.next_attempt.is_none());
    assert_eq!(stored.retry_policy, policy);

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn outcome_for_unclaimed_record_is_rejected() {
    let Some(db) = TestDatabase::create().await.unwrap() else { return };
    let queue = &db.storage().event_queue;
    let now = fixed_time();
    let id = queue.enqueue(&record("employee_async", RetryPolicy::no_retries(), now)).await.unwrap();

    let err = queue.record_outcome(id, &DeliveryOutcome::from_status(200, None), now).await.unwrap_err();

    assert!(matches!(err, CoreError::InvalidTransition { from: QueueStatus::Pending, .. }));
    let stored = queue.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, QueueStatus::Pending);
    assert_eq!(stored.attempt_count, 0);

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn stale_claims_return_to_pending_with_history_intact() {
    let Some(db) = TestDatabase::create().await.unwrap() else { return };
    let queue = &db.storage().event_queue;
    let now = fixed_time();
    let id = queue.enqueue(&record("employee_async", RetryPolicy::no_retries(), now)).await.unwrap();
    queue.claim_due(now, 1).await.unwrap();

    let soon = now + Duration::seconds(60);
    assert_eq!(queue.reclaim_stale(soon, soon - Duration::seconds(300)).await.unwrap(), 0);

    let later = now + Duration::seconds(600);
    assert_eq!(queue.reclaim_stale(later, later - Duration::seconds(300)).await.unwrap(), 1);

    let stored = queue.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, QueueStatus::Pending);
    assert_eq!(stored.next_attempt, Some(later));
    assert_eq!(stored.attempt_count, 0);

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn only_fresh_records_can_be_enqueued() {
    let Some(db) = TestDatabase::create().await.unwrap() else { return };
    let now = fixed_time();
    let mut claimed = record("employee_async", RetryPolicy::no_retries(), now);
    claimed.claim(now).unwrap();

    let err = db.storage().event_queue.enqueue(&claimed).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)));

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn schema_rejects_inconsistent_queue_rows() {
    let Some(db) = TestDatabase::create().await.unwrap() else { return };
    let now = fixed_time();
    let id = db
        .storage()
        .event_queue
        .enqueue(&record("employee_async", RetryPolicy::no_retries(), now))
        .await
        .unwrap();

    let unknown_status = sqlx::query("UPDATE cdc_webhook.event_queue SET status = 'LOST' WHERE id = $1")
        .bind(id)
        .execute(db.pool())
        .await;
    assert!(unknown_status.is_err());

    let count_without_history =
        sqlx::query("UPDATE cdc_webhook.event_queue SET attempt_count = 1 WHERE id = $1")
            .bind(id)
            .execute(db.pool())
            .await;
    assert!(count_without_history.is_err());

    let terminal_with_due_time =
        sqlx::query("UPDATE cdc_webhook.event_queue SET status = 'DELIVERED' WHERE id = $1")
            .bind(id)
            .execute(db.pool())
            .await;
    assert!(terminal_with_due_time.is_err());

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn credential_upsert_keeps_a_single_record() {
    let Some(db) = TestDatabase::create().await.unwrap() else { return };
    let credentials = &db.storage().credentials;
    let now = fixed_time();
    let write = |url: &str, token: &str, at| CredentialRecord {
        key: key("employee_private"),
        url: url.to_string(),
        headers: [("Authorization", token), ("X-Tenant", "acme")].into_iter().collect(),
        updated_at: at,
    };

    credentials.upsert(&write("http://sink.example/one", "one", now)).await.unwrap();
    credentials.upsert(&write("http://sink.example/two", "two", now + Duration::seconds(1))).await.unwrap();

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cdc_webhook.credentials")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(rows, 1);

    let found = credentials.find(&key("employee_private")).await.unwrap().unwrap();
    assert_eq!(found.url, "http://sink.example/two");
    assert_eq!(found.headers.get("Authorization"), Some("two"));
    assert_eq!(found.headers.names(), vec!["Authorization", "X-Tenant"]);
    assert_eq!(found.updated_at, now + Duration::seconds(1));

    assert!(credentials.delete(&key("employee_private")).await.unwrap());
    assert!(credentials.find(&key("employee_private")).await.unwrap().is_none());

    db.cleanup().await.unwrap();
}

#[tokio::test]
async fn bindings_round_trip_and_reject_queued_cancel() {
    let Some(db) = TestDatabase::create().await.unwrap() else { return };
    let bindings = &db.storage().bindings;
    let binding = BindingBuilder::new("salary_changes", "http://sink.example/hook")
        .update_columns(&["salary"])
        .header("X-Source", "hr")
        .retries(3, 2, Backoff::Exponential)
        .build();

    bindings.upsert(&binding).await.unwrap();
    bindings.upsert(&binding).await.unwrap();

    assert_eq!(bindings.list_for_table(&employees()).await.unwrap(), vec![binding.clone()]);

    let mut queued_cancel = binding.clone();
    queued_cancel.key = key("queued_cancel");
    queued_cancel.cancel_on_failure = true;
    queued_cancel.dispatch = cdc_webhook_core::DispatchMode::Async;
    assert!(bindings.upsert(&queued_cancel).await.is_err());

    assert!(bindings.delete(&binding.key).await.unwrap());
    assert!(bindings.list_all().await.unwrap().is_empty());

    db.cleanup().await.unwrap();
}
