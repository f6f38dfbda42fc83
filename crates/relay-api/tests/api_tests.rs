//! API Endpoint Tests
//!
//! Tests for:
//! - Health and OpenAPI endpoints
//! - Send endpoints
//! - Failure listing, statistics and filtering
//! - Retry, resolve and delete of failed messages

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use tower::ServiceExt;

use relay_api::{create_router, AppState};
use relay_broker::{Broker, MemoryBroker};
use relay_common::topology::{PRIMARY_QUEUE, UNROUTED_QUEUE};
use relay_common::{FailureType, Message, NewFailure, Topology};
use relay_publisher::{LogAlertNotifier, PublisherSettings, ResilientPublisher};
use relay_store::{FailureStore, InMemoryFailureStore};

struct TestApp {
    app: Router,
    broker: MemoryBroker,
    store: Arc<InMemoryFailureStore>,
}

async fn create_test_app() -> TestApp {
    let broker = MemoryBroker::new();
    broker.declare_topology(&Topology::default()).await.unwrap();
    let store = Arc::new(InMemoryFailureStore::new());
    let publisher = Arc::new(ResilientPublisher::new(
        Arc::new(broker.clone()),
        store.clone(),
        Arc::new(LogAlertNotifier),
        PublisherSettings::default(),
    ));
    let app = create_router(AppState::new(publisher, store.clone()));
    TestApp { app, broker, store }
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn consume_failure(id: &str) -> NewFailure {
    let body = String::from_utf8(Message::with_id(id, "body").to_json().unwrap()).unwrap();
    NewFailure::new(FailureType::BusinessError, body, "demo.exchange", "demo.routing.key").with_message_id(id)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ============================================================================
// Health Endpoint Tests
// ============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let t = create_test_app().await;

    let (status, json) = call(&t.app, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "UP");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_openapi_document() {
    let t = create_test_app().await;

    let (status, json) = call(&t.app, Method::GET, "/api/openapi.json", None).await;

    assert_eq!(status, StatusCode::OK);
    assert!(json["components"]["schemas"]["MessageResponse"].is_object());
}

// ============================================================================
// Send Endpoint Tests
// ============================================================================

#[tokio::test]
async fn test_send_message() {
    let t = create_test_app().await;

    let (status, json) = call(
        &t.app,
        Method::POST,
        "/api/messages/send",
        Some(serde_json::json!({ "content": "Hello" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert!(json["messageId"].is_string());
    assert_eq!(t.broker.queue_depth(PRIMARY_QUEUE), 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_with_retry_recovers() {
    let t = create_test_app().await;
    t.broker.fail_next_publishes(1);

    let (status, json) = call(
        &t.app,
        Method::POST,
        "/api/messages/send-with-retry",
        Some(serde_json::json!({ "content": "retry me" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert!(json["message"].as_str().unwrap().contains("2 attempt"));
}

#[tokio::test(start_paused = true)]
async fn test_send_with_retry_exhausted() {
    let t = create_test_app().await;
    t.broker.fail_next_publishes(4);

    let (status, json) = call(
        &t.app,
        Method::POST,
        "/api/messages/send-with-retry",
        Some(serde_json::json!({ "content": "never arrives" })),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["success"], false);
    let records = t.store.list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].failure_type, FailureType::SendFailedAfterRetry);
}

#[tokio::test]
async fn test_send_with_confirm() {
    let t = create_test_app().await;

    let (status, json) = call(
        &t.app,
        Method::POST,
        "/api/messages/send-with-confirm",
        Some(serde_json::json!({ "content": "confirm me" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
}

#[tokio::test]
async fn test_send_batch_with_contents() {
    let t = create_test_app().await;

    let (status, json) = call(
        &t.app,
        Method::POST,
        "/api/messages/send-batch",
        Some(serde_json::json!({ "contents": ["a", "b", "c"] })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["messageIds"].as_array().unwrap().len(), 3);
    assert_eq!(t.broker.queue_depth(PRIMARY_QUEUE), 3);
}

#[tokio::test]
async fn test_send_batch_by_count() {
    let t = create_test_app().await;

    let (status, json) = call(&t.app, Method::POST, "/api/messages/send-batch?count=2", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["messageIds"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_send_batch_rejects_oversized_count() {
    let t = create_test_app().await;

    let (status, json) = call(&t.app, Method::POST, "/api/messages/send-batch?count=1001", None).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);
    assert!(json["message"].as_str().unwrap().contains("1000"));
    assert_eq!(t.broker.queue_depth(PRIMARY_QUEUE), 0);
}

#[tokio::test]
async fn test_send_batch_accepts_count_at_limit() {
    let t = create_test_app().await;

    let (status, json) = call(&t.app, Method::POST, "/api/messages/send-batch?count=1000", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["messageIds"].as_array().unwrap().len(), 1000);
}

#[tokio::test]
async fn test_send_wrong_routing_records_failure() {
    let t = create_test_app().await;

    let (status, json) = call(&t.app, Method::POST, "/api/messages/send-wrong-routing", None).await;
    assert_eq!(status, StatusCode::OK);
    let message_id = json["messageId"].as_str().unwrap().to_string();
    settle().await;

    let (_, listing) = call(&t.app, Method::GET, "/api/failures?stage=publish", None).await;
    assert_eq!(listing["total"], 1);
    assert_eq!(listing["messages"][0]["failureType"], "ROUTING_FAILED");
    assert_eq!(listing["messages"][0]["messageId"], message_id.as_str());
    assert_eq!(t.broker.queue_depth(UNROUTED_QUEUE), 1);
}

#[tokio::test]
async fn test_send_error_prefixes_content() {
    let t = create_test_app().await;

    let (status, _) = call(&t.app, Method::POST, "/api/messages/send-error", None).await;

    assert_eq!(status, StatusCode::OK);
    let queued = t.broker.peek(PRIMARY_QUEUE);
    let message = Message::from_json(&queued[0].payload).unwrap();
    assert!(message.content.starts_with("ERROR:"));
}

// ============================================================================
// Failure Query Tests
// ============================================================================

#[tokio::test]
async fn test_get_failure_not_found() {
    let t = create_test_app().await;

    let (status, json) = call(&t.app, Method::GET, "/api/failures/missing", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn test_get_failure() {
    let t = create_test_app().await;
    let id = t.store.save(consume_failure("m1")).await.unwrap();

    let (status, json) = call(&t.app, Method::GET, &format!("/api/failures/{}", id), None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], id.as_str());
    assert_eq!(json["failureStage"], "consume");
    assert_eq!(json["status"], "PENDING");
}

#[tokio::test]
async fn test_statistics_by_stage() {
    let t = create_test_app().await;
    t.store.save(consume_failure("c1")).await.unwrap();
    t.store
        .save(NewFailure::new(FailureType::RoutingFailed, "{}", "demo.exchange", "wrong.routing.key"))
        .await
        .unwrap();

    let (_, all) = call(&t.app, Method::GET, "/api/failures/statistics", None).await;
    let (_, publish) = call(&t.app, Method::GET, "/api/failures/statistics?stage=PUBLISH", None).await;
    let (_, consume) = call(&t.app, Method::GET, "/api/failures/statistics?stage=consume", None).await;

    assert_eq!(all["total"], 2);
    assert_eq!(publish["total"], 1);
    assert_eq!(consume["total"], 1);
    assert_eq!(all["publishFailures"], 1);
    assert_eq!(all["consumeFailures"], 1);
}

#[tokio::test]
async fn test_invalid_stage_is_rejected() {
    let t = create_test_app().await;
    t.store.save(consume_failure("c1")).await.unwrap();

    let (status, json) = call(&t.app, Method::GET, "/api/failures/statistics?stage=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);

    let (status, _) = call(&t.app, Method::GET, "/api/failures?status=nope", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(t.store.len(), 1);
}

#[tokio::test]
async fn test_list_filtered_by_status() {
    let t = create_test_app().await;
    let resolved = t.store.save(consume_failure("c1")).await.unwrap();
    t.store.save(consume_failure("c2")).await.unwrap();
    t.store.mark_manually_resolved(&resolved, "ops", None).await.unwrap();

    let (_, json) = call(&t.app, Method::GET, "/api/failures?stage=consume&status=PENDING", None).await;
    assert_eq!(json["total"], 1);
    assert_eq!(json["messages"][0]["messageId"], "c2");

    let (_, pending) = call(&t.app, Method::GET, "/api/failures/pending", None).await;
    assert_eq!(pending.as_array().unwrap().len(), 1);
}

// ============================================================================
// Failure Administration Tests
// ============================================================================

#[tokio::test]
async fn test_retry_failure() {
    let t = create_test_app().await;
    let id = t.store.save(consume_failure("m-retry")).await.unwrap();

    let (status, json) = call(&t.app, Method::POST, &format!("/api/failures/{}/retry", id), None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["status"], "RETRY_SUCCESS");
    assert_eq!(t.broker.queue_depth(PRIMARY_QUEUE), 1);
}

#[tokio::test]
async fn test_retry_exhausted_failure_is_bad_request() {
    let t = create_test_app().await;
    let id = t.store.save(consume_failure("m-tired")).await.unwrap();
    for _ in 0..3 {
        t.store.mark_retrying(&id).await.unwrap();
        t.store.mark_retry_failed(&id, "nope").await.unwrap();
    }

    let (status, json) = call(&t.app, Method::POST, &format!("/api/failures/{}/retry", id), None).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);
    assert_eq!(t.store.get(&id).await.unwrap().unwrap().retry_count, 3);
}

#[tokio::test]
async fn test_retry_missing_failure_is_not_found() {
    let t = create_test_app().await;

    let (status, _) = call(&t.app, Method::POST, "/api/failures/missing/retry", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_retry_batch_default_limit() {
    let t = create_test_app().await;
    for i in 0..12 {
        t.store.save(consume_failure(&format!("m{}", i))).await.unwrap();
    }

    let (status, json) = call(&t.app, Method::POST, "/api/failures/retry-batch", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 10);
    assert_eq!(json["succeeded"], 10);
    assert_eq!(json["failed"], 0);
}

#[tokio::test]
async fn test_resolve_failure() {
    let t = create_test_app().await;
    let id = t.store.save(consume_failure("m-manual")).await.unwrap();

    let (status, json) = call(
        &t.app,
        Method::POST,
        &format!("/api/failures/{}/resolve", id),
        Some(serde_json::json!({ "resolvedBy": "ops", "note": "replayed by hand" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "MANUALLY_RESOLVED");
    assert_eq!(json["resolvedBy"], "ops");
    assert_eq!(json["note"], "replayed by hand");

    // terminal records cannot be resolved again
    let (status, _) = call(
        &t.app,
        Method::POST,
        &format!("/api/failures/{}/resolve", id),
        Some(serde_json::json!({ "resolvedBy": "ops" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_delete_failure() {
    let t = create_test_app().await;
    let id = t.store.save(consume_failure("m-del")).await.unwrap();

    let (status, _) = call(&t.app, Method::DELETE, &format!("/api/failures/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(t.store.is_empty());

    let (status, _) = call(&t.app, Method::DELETE, &format!("/api/failures/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unrouted_recent_without_consumer() {
    let t = create_test_app().await;

    let (status, json) = call(&t.app, Method::GET, "/api/unrouted/recent", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, serde_json::json!([]));
}
