//! Publisher Tests
//!
//! Tests for:
//! - Send-path retry schedule and exhaustion recording
//! - Routing failures (returns) and the alternate-exchange copy
//! - Confirm failures (nack, timeout)
//! - Manual recovery of recorded failures

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

use relay_broker::{
    BindingSpec, Broker, ConfirmListener, DeliveryStream, ExchangeSpec, MemoryBroker,
    OutboundMessage, QueueSpec, Result as BrokerResult, ReturnListener,
};
use relay_common::topology::{PRIMARY_QUEUE, UNROUTED_QUEUE, WRONG_ROUTING_KEY};
use relay_common::{
    FailureStage, FailureStatus, FailureType, Headers, Message, NewFailure, Route, Topology,
};
use relay_publisher::{
    LogAlertNotifier, PublishError, PublisherSettings, RecoveryError, RecoveryService,
    ResilientPublisher, RetryOutcome, SendOutcome,
};
use relay_store::{FailureStore, InMemoryFailureStore};

/// Delegates to a [`MemoryBroker`], timestamping every publish call. With
/// `swallow_confirms` the publisher never hears back.
struct RecordingBroker {
    inner: MemoryBroker,
    publishes: Mutex<Vec<Instant>>,
    swallow_confirms: bool,
}

impl RecordingBroker {
    fn new(inner: MemoryBroker) -> Self {
        Self { inner, publishes: Mutex::new(Vec::new()), swallow_confirms: false }
    }

    fn publish_times(&self) -> Vec<Instant> {
        self.publishes.lock().clone()
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    fn identifier(&self) -> &str {
        "recording"
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BrokerResult<()> {
        self.inner.declare_exchange(spec).await
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<()> {
        self.inner.declare_queue(spec).await
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> BrokerResult<()> {
        self.inner.bind_queue(binding).await
    }

    fn set_confirm_listener(&self, listener: Arc<dyn ConfirmListener>) {
        if !self.swallow_confirms {
            self.inner.set_confirm_listener(listener);
        }
    }

    fn set_return_listener(&self, listener: Arc<dyn ReturnListener>) {
        self.inner.set_return_listener(listener);
    }

    async fn publish(&self, message: OutboundMessage) -> BrokerResult<()> {
        self.publishes.lock().push(Instant::now());
        self.inner.publish(message).await
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> BrokerResult<Box<dyn DeliveryStream>> {
        self.inner.consume(queue, consumer_tag, prefetch).await
    }
}

/// Collects the `attempt` field of every "retrying" warning.
#[derive(Clone, Default)]
struct RetryWarnings {
    attempts: Arc<Mutex<Vec<u64>>>,
}

#[derive(Default)]
struct RetryVisitor {
    message: String,
    attempt: Option<u64>,
}

impl Visit for RetryVisitor {
    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "attempt" {
            self.attempt = Some(value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
}

impl<S: Subscriber> Layer<S> for RetryWarnings {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != tracing::Level::WARN {
            return;
        }
        let mut visitor = RetryVisitor::default();
        event.record(&mut visitor);
        if visitor.message.contains("retrying") {
            if let Some(attempt) = visitor.attempt {
                self.attempts.lock().push(attempt);
            }
        }
    }
}

struct Harness {
    memory: MemoryBroker,
    broker: Arc<RecordingBroker>,
    store: Arc<InMemoryFailureStore>,
    publisher: Arc<ResilientPublisher>,
}

async fn harness() -> Harness {
    harness_with(false).await
}

async fn harness_with(swallow_confirms: bool) -> Harness {
    let memory = MemoryBroker::new();
    memory.declare_topology(&Topology::default()).await.unwrap();

    let mut broker = RecordingBroker::new(memory.clone());
    broker.swallow_confirms = swallow_confirms;
    let broker = Arc::new(broker);
    let store = Arc::new(InMemoryFailureStore::new());
    let publisher = Arc::new(ResilientPublisher::new(
        broker.clone(),
        store.clone(),
        Arc::new(LogAlertNotifier),
        PublisherSettings::default(),
    ));

    Harness { memory, broker, store, publisher }
}

// ============================================================================
// Retry Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_send_with_retry_exhausts_after_four_attempts() {
    let h = harness().await;
    h.memory.fail_next_publishes(4);
    let message = Message::with_id("m-retry", "payload");

    let outcome = h.publisher.send_with_retry(&message).await;

    match outcome {
        RetryOutcome::Failed { message_id, attempts, .. } => {
            assert_eq!(message_id, "m-retry");
            assert_eq!(attempts, 4);
        }
        other => panic!("expected failure, got {:?}", other),
    }

    let times = h.broker.publish_times();
    assert_eq!(times.len(), 4);
    let gaps: Vec<u64> = times.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
    assert_eq!(gaps, vec![1, 2, 4]);

    let records = h.store.list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].failure_type, FailureType::SendFailedAfterRetry);
    assert_eq!(records[0].failure_stage, FailureStage::Publish);
    assert_eq!(records[0].message_id.as_deref(), Some("m-retry"));
}

#[tokio::test(start_paused = true)]
async fn test_send_with_retry_recovers_from_transient_failures() {
    let warnings = RetryWarnings::default();
    let _subscriber = tracing::subscriber::set_default(tracing_subscriber::registry().with(warnings.clone()));

    let h = harness().await;
    h.memory.fail_next_publishes(2);
    let message = Message::with_id("m1", "hello");

    let outcome = h.publisher.send_with_retry(&message).await;
    assert_eq!(outcome, RetryOutcome::Delivered { message_id: "m1".into(), attempts: 3 });
    // one warning per failed attempt that was retried
    assert_eq!(*warnings.attempts.lock(), vec![1, 2]);

    // let the background confirm settle
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.memory.queue_depth(PRIMARY_QUEUE), 1);
    assert!(h.store.is_empty());
    assert_eq!(h.broker.publish_times().len(), 3);
}

// ============================================================================
// Broker Signal Tests
// ============================================================================

#[tokio::test]
async fn test_send_confirmed() {
    let h = harness().await;
    let message = Message::with_id("m-ok", "hello");

    assert!(h.publisher.send_and_confirm(&message).await);
    assert_eq!(h.memory.queue_depth(PRIMARY_QUEUE), 1);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_wrong_routing_key_records_routing_failure_and_salvages_copy() {
    let h = harness().await;
    let message = Message::with_id("m-lost", "nowhere to go");

    let handle = h.publisher.send_to_routing_key(&message, WRONG_ROUTING_KEY).await;
    assert_eq!(handle.message_id(), "m-lost");
    // the exchange accepted it, so the confirm itself is positive
    assert_eq!(handle.wait().await, SendOutcome::Confirmed);

    let records = h.store.list().await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.failure_type, FailureType::RoutingFailed);
    assert_eq!(record.failure_stage, FailureStage::Publish);
    assert_eq!(record.reply_code, Some(312));
    assert_eq!(record.routing_key, WRONG_ROUTING_KEY);
    assert_eq!(record.message_id.as_deref(), Some("m-lost"));

    assert_eq!(h.memory.queue_depth(UNROUTED_QUEUE), 1);
    assert_eq!(h.memory.queue_depth(PRIMARY_QUEUE), 0);
}

#[tokio::test]
async fn test_unknown_exchange_records_confirm_failure() {
    let h = harness().await;
    let message = Message::with_id("m-nack", "hello");

    let outcome = h
        .publisher
        .send_to(&message, &Route::new("missing.exchange", "any"))
        .await
        .wait()
        .await;

    match outcome {
        SendOutcome::Failed { failure_type, reason } => {
            assert_eq!(failure_type, FailureType::ConfirmFailed);
            assert!(reason.contains("NOT_FOUND"), "reason: {}", reason);
        }
        SendOutcome::Confirmed => panic!("unknown exchange must not confirm"),
    }

    let records = h.store.list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].failure_type, FailureType::ConfirmFailed);
    assert_eq!(records[0].exchange, "missing.exchange");
}

#[tokio::test(start_paused = true)]
async fn test_missing_confirm_times_out() {
    let h = harness_with(true).await;
    let message = Message::with_id("m-silent", "hello");

    let started = Instant::now();
    let confirmed = h.publisher.send_and_confirm(&message).await;

    assert!(!confirmed);
    assert!(started.elapsed() >= Duration::from_secs(10));
    let records = h.store.list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].failure_type, FailureType::ConfirmFailed);
}

#[tokio::test]
async fn test_best_effort_send_error_is_recorded_without_retry() {
    let h = harness().await;
    h.memory.fail_next_publishes(1);
    let message = Message::with_id("m-once", "hello");

    let outcome = h.publisher.send(&message).await.wait().await;

    assert!(matches!(
        outcome,
        SendOutcome::Failed { failure_type: FailureType::SendFailedAfterRetry, .. }
    ));
    assert_eq!(h.broker.publish_times().len(), 1);
    assert_eq!(h.store.len(), 1);
}

#[tokio::test]
async fn test_send_batch_preserves_order() {
    let h = harness().await;
    let messages: Vec<Message> = (0..3).map(|i| Message::with_id(format!("b{}", i), "x")).collect();

    let handles = h.publisher.send_batch(&messages).await;
    let ids: Vec<&str> = handles.iter().map(|h| h.message_id()).collect();
    assert_eq!(ids, vec!["b0", "b1", "b2"]);

    for handle in handles {
        assert!(handle.wait().await.is_confirmed());
    }
    let queued: Vec<String> = h
        .memory
        .peek(PRIMARY_QUEUE)
        .into_iter()
        .filter_map(|d| d.message_id)
        .collect();
    assert_eq!(queued, vec!["b0", "b1", "b2"]);
}

// ============================================================================
// Recovery Tests
// ============================================================================

fn consume_failure(id: &str) -> NewFailure {
    let body = String::from_utf8(Message::with_id(id, "retry me").to_json().unwrap()).unwrap();
    NewFailure::new(FailureType::BusinessError, body, "dlx.exchange", "dlx.routing.key")
        .with_message_id(id)
}

#[tokio::test]
async fn test_retry_one_resends_consume_failure_to_primary_route() {
    let h = harness().await;
    let recovery = RecoveryService::new(h.store.clone(), h.publisher.clone());
    let id = h.store.save(consume_failure("m-dead")).await.unwrap();

    let report = recovery.retry_one(&id).await.unwrap();

    assert!(report.success);
    assert_eq!(report.status, FailureStatus::RetrySuccess);
    assert_eq!(report.retry_count, 1);
    let queued = h.memory.peek(PRIMARY_QUEUE);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].message_id.as_deref(), Some("m-dead"));
}

#[tokio::test]
async fn test_retry_one_failure_returns_record_to_pending() {
    let h = harness().await;
    let recovery = RecoveryService::new(h.store.clone(), h.publisher.clone());
    let id = h
        .store
        .save(NewFailure::new(FailureType::ConfirmFailed, "{}", "missing.exchange", "k").with_message_id("m-x"))
        .await
        .unwrap();

    let report = recovery.retry_one(&id).await.unwrap();

    assert!(!report.success);
    assert_eq!(report.status, FailureStatus::Pending);
    assert_eq!(report.retry_count, 1);
    let record = h.store.get(&id).await.unwrap().unwrap();
    assert!(record.note.unwrap_or_default().contains("NOT_FOUND"));
}

#[tokio::test]
async fn test_retry_one_of_still_unroutable_record_fails_without_new_record() {
    let h = harness().await;
    let recovery = RecoveryService::new(h.store.clone(), h.publisher.clone());
    let message = Message::with_id("m-lost", "nowhere to go");
    h.publisher.send_to_routing_key(&message, WRONG_ROUTING_KEY).await.wait().await;
    let records = h.store.list().await.unwrap();
    assert_eq!(records.len(), 1);
    let id = records[0].id.clone();

    let report = recovery.retry_one(&id).await.unwrap();

    assert!(!report.success);
    assert_eq!(report.status, FailureStatus::Pending);
    assert_eq!(report.retry_count, 1);
    assert!(report.error.unwrap_or_default().contains("312"));
    // the retry failure lives on the original record
    assert_eq!(h.store.len(), 1);
    let record = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.failure_type, FailureType::RoutingFailed);
    assert_eq!(h.memory.queue_depth(PRIMARY_QUEUE), 0);
}

#[tokio::test]
async fn test_republish_reports_return_as_error() {
    let h = harness().await;
    let route = Route::new(Topology::default().exchange, WRONG_ROUTING_KEY);

    let err = h
        .publisher
        .republish(&route, "m-again", bytes::Bytes::from_static(b"{}"), Headers::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::Returned { reply_code: 312, .. }));
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_retry_one_rejects_exhausted_record() {
    let h = harness().await;
    let recovery = RecoveryService::new(h.store.clone(), h.publisher.clone());
    let id = h.store.save(consume_failure("m-tired")).await.unwrap();
    for _ in 0..3 {
        h.store.mark_retrying(&id).await.unwrap();
        h.store.mark_retry_failed(&id, "still broken").await.unwrap();
    }

    let err = recovery.retry_one(&id).await.unwrap_err();

    assert!(matches!(err, RecoveryError::RetriesExhausted { retry_count: 3, .. }));
    let record = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status, FailureStatus::RetryExhausted);
    assert_eq!(record.retry_count, 3);
    assert_eq!(h.memory.queue_depth(PRIMARY_QUEUE), 0);
}

#[tokio::test]
async fn test_retry_one_unknown_id() {
    let h = harness().await;
    let recovery = RecoveryService::new(h.store.clone(), h.publisher.clone());

    let err = recovery.retry_one("nope").await.unwrap_err();
    assert!(matches!(err, RecoveryError::NotFound(id) if id == "nope"));
}

#[tokio::test]
async fn test_retry_batch_honours_limit() {
    let h = harness().await;
    let recovery = RecoveryService::new(h.store.clone(), h.publisher.clone());
    for i in 0..12 {
        h.store.save(consume_failure(&format!("m{}", i))).await.unwrap();
    }

    let summary = recovery.retry_batch(10).await.unwrap();

    assert_eq!(summary.total, 10);
    assert_eq!(summary.succeeded, 10);
    assert_eq!(summary.failed, 0);
    assert_eq!(h.store.list_pending().await.unwrap().len(), 2);
    assert_eq!(h.memory.queue_depth(PRIMARY_QUEUE), 10);
}

#[tokio::test]
async fn test_resolve_and_delete() {
    let h = harness().await;
    let recovery = RecoveryService::new(h.store.clone(), h.publisher.clone());
    let id = h.store.save(consume_failure("m-manual")).await.unwrap();

    let record = recovery.resolve(&id, "ops", Some("fixed upstream".into())).await.unwrap();
    assert_eq!(record.status, FailureStatus::ManuallyResolved);
    assert_eq!(record.resolved_by.as_deref(), Some("ops"));

    recovery.delete(&id).await.unwrap();
    assert!(matches!(recovery.delete(&id).await, Err(RecoveryError::NotFound(_))));
}
