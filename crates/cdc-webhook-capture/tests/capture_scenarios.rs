//! Row changes flowing from configured bindings to a mock sink.

use std::{sync::Arc, time::Duration};

use cdc_webhook_capture::{
    storage::{mock::MockBindingStorage, BindingStorage},
    BindingRegistry, CaptureError, EventCapture, RowChange, TriggerConfig,
};
use cdc_webhook_core::{Backoff, Operation, QueueStatus, TestClock, TriggerTiming, WebhookHeaders};
use cdc_webhook_delivery::{
    storage::mock::{MockCredentialStorage, MockQueueStorage},
    CredentialResolver, DeliveryClient, DispatcherConfig, DispatcherWorker, QueueStorage,
    SyncCoordinator,
};
use cdc_webhook_testing::{assertions, employee_row, employees, BindingBuilder, MockSink};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

struct Pipeline {
    registry: BindingRegistry,
    bindings: MockBindingStorage,
    capture: EventCapture,
    worker: DispatcherWorker,
    queue: MockQueueStorage,
    clock: TestClock,
}

fn pipeline() -> Pipeline {
    let clock = TestClock::new();
    let credentials = MockCredentialStorage::new();
    let bindings = MockBindingStorage::new(credentials.clone());
    let queue = MockQueueStorage::new();
    let resolver = CredentialResolver::new(Arc::new(credentials));
    let client = DeliveryClient::with_defaults().unwrap();
    let (_tx, config) = watch::channel(DispatcherConfig::default());

    Pipeline {
        registry: BindingRegistry::new(Arc::new(bindings.clone()), Arc::new(clock.clone())),
        bindings: bindings.clone(),
        capture: EventCapture::new(
            Arc::new(bindings),
            Arc::new(queue.clone()),
            resolver.clone(),
            SyncCoordinator::new(client.clone(), Arc::new(clock.clone())),
            Arc::new(clock.clone()),
        ),
        worker: DispatcherWorker::new(
            Arc::new(queue.clone()),
            resolver,
            client,
            Arc::new(clock.clone()),
            config,
            CancellationToken::new(),
        ),
        queue,
        clock,
    }
}

fn insert(id: i64) -> RowChange {
    RowChange::after(employees(), Operation::Insert, None, Some(employee_row(id, "Ada", 1000)))
}

#[tokio::test]
async fn queued_insert_against_dead_sink_ends_failed_after_worker_drains_it() {
    let sink = MockSink::start().await;
    sink.respond_always(503).await;
    let p = pipeline();
    p.registry
        .configure(&TriggerConfig {
            dispatch: "ASYNC".to_string(),
            retry_number: 2,
            ..TriggerConfig::new("employee_async", "employees", &["INSERT"], sink.url())
        })
        .await
        .unwrap();

    let report = p.capture.capture(insert(1)).await.unwrap();
    assert_eq!(report.queued.len(), 1);
    sink.assert_request_count(0).await;

    let id = report.queued[0];
    while p.queue.find(id).await.unwrap().unwrap().status != QueueStatus::Failed {
        p.worker.process_due().await.unwrap();
        p.clock.advance(Duration::from_secs(1));
    }

    let record = p.queue.find(id).await.unwrap().unwrap();
    assert_eq!(record.attempt_count, 3);
    assert_eq!(record.attempt_times.len(), 3);
    assert_eq!(record.attempt_statuses, vec![Some(503); 3]);
    assert_eq!(record.attempt_responses.len(), 3);
    assertions::assert_delivery_info(&sink.bodies().await, 2);
}

#[tokio::test]
async fn private_abort_message_never_contains_header_value() {
    let sink = MockSink::start().await;
    sink.respond_with_body(401, "bad token secretvalue").await;
    let p = pipeline();
    p.registry
        .configure(&TriggerConfig {
            security: "PRIVATE".to_string(),
            cancel_on_failure: true,
            retry_number: 2,
            headers: [("Authorization", "secretvalue")].into_iter().collect::<WebhookHeaders>(),
            ..TriggerConfig::new("employee_private", "employees", &["INSERT"], sink.url())
        })
        .await
        .unwrap();

    let err = p.capture.capture(insert(1)).await.unwrap_err();

    assert!(err.is_abort());
    assert!(!err.to_string().contains("secretvalue"));
    assert!(!format!("{err:?}").contains("secretvalue"));
    sink.assert_request_count(3).await;
    assertions::assert_header(&sink.headers(0).await, "Authorization", "secretvalue");
}

#[tokio::test]
async fn private_delivery_uses_credentials_current_at_send_time() {
    let first = MockSink::start().await;
    first.respond_always(200).await;
    let second = MockSink::start().await;
    second.require_header("Authorization", "two", 200).await;

    let p = pipeline();
    let private = |url: String, token: &str| TriggerConfig {
        security: "PRIVATE".to_string(),
        headers: [("Authorization", token)].into_iter().collect::<WebhookHeaders>(),
        ..TriggerConfig::new("employee_private", "employees", &["INSERT"], url)
    };

    p.registry.configure(&private(first.url(), "one")).await.unwrap();
    p.capture.capture(insert(1)).await.unwrap();

    p.registry.configure(&private(second.url(), "two")).await.unwrap();
    p.capture.capture(insert(2)).await.unwrap();

    first.assert_request_count(1).await;
    second.assert_request_count(1).await;
    assertions::assert_header(&second.headers(0).await, "Authorization", "two");
}

#[tokio::test]
async fn update_payload_carries_both_rows_and_trace_context() {
    let sink = MockSink::start().await;
    sink.respond_always(200).await;
    let p = pipeline();
    p.registry
        .configure(&TriggerConfig {
            retry_number: 0,
            update_columns: Some(vec!["salary".to_string()]),
            ..TriggerConfig::new("salary_changes", "employees", &["UPDATE"], sink.url())
        })
        .await
        .unwrap();

    let change = RowChange {
        trace_context: Some(cdc_webhook_core::TraceContext {
            trace_id: "4bf92f3577b34da6".to_string(),
            span_id: "00f067aa0ba902b7".to_string(),
        }),
        ..RowChange::after(
            employees(),
            Operation::Update,
            Some(employee_row(1, "Ada", 1000)),
            Some(employee_row(1, "Ada", 1200)),
        )
    };
    let report = p.capture.capture(change).await.unwrap();

    assert_eq!(report.delivered.len(), 1);
    let body = &sink.bodies().await[0];
    assert_eq!(body["event"]["op"], "UPDATE");
    assert_eq!(body["event"]["data"]["old"]["salary"], 1000);
    assert_eq!(body["event"]["data"]["new"]["salary"], 1200);
    assert_eq!(body["event"]["trace_context"]["trace_id"], "4bf92f3577b34da6");
    assert_eq!(body["table"], serde_json::json!({"schema": "public", "name": "employees"}));
}

#[tokio::test]
async fn before_binding_fires_only_for_before_changes() {
    let sink = MockSink::start().await;
    sink.respond_always(200).await;
    let p = pipeline();
    let binding = BindingBuilder::new("salary_guard", sink.url())
        .operations(&[Operation::Update])
        .timing(TriggerTiming::Before)
        .update_columns(&["salary"])
        .header("X-Source", "hr")
        .timeout_seconds(2)
        .build();
    p.bindings.save_binding(binding, None).await.unwrap();

    let update = |timing| RowChange {
        timing,
        ..RowChange::after(
            employees(),
            Operation::Update,
            Some(employee_row(1, "Ada", 1000)),
            Some(employee_row(1, "Ada", 1100)),
        )
    };
    p.capture.capture(update(TriggerTiming::After)).await.unwrap();
    let report = p.capture.capture(update(TriggerTiming::Before)).await.unwrap();

    assert_eq!(report.delivered.len(), 1);
    sink.assert_request_count(1).await;
    assertions::assert_header(&sink.headers(0).await, "X-Source", "hr");
    assert_eq!(sink.bodies().await[0]["trigger"]["timing"], "BEFORE");
}

#[tokio::test]
async fn queued_binding_that_cancels_on_failure_is_refused_at_capture() {
    let p = pipeline();
    let binding = BindingBuilder::new("employee_async", "http://127.0.0.1:1/hook")
        .operations(&[Operation::Insert])
        .retries(1, 5, Backoff::Exponential)
        .cancel_on_failure()
        .queued()
        .build();
    p.bindings.save_binding(binding, None).await.unwrap();

    let err = p.capture.capture(insert(1)).await.unwrap_err();

    assert!(matches!(err, CaptureError::Configuration { .. }));
    assert!(p.queue.records().await.is_empty());
}
