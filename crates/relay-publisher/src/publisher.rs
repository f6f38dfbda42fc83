//! Resilient publisher.
//!
//! Every publish is mandatory and tracked for a confirm. Outcomes that lose
//! a message are written to the failure store and raise an alert:
//!
//! | Signal                              | Failure type             |
//! |-------------------------------------|--------------------------|
//! | nack, or no confirm within timeout  | `CONFIRM_FAILED`         |
//! | returned as unroutable              | `ROUTING_FAILED`         |
//! | send path still failing after retry | `SEND_FAILED_AFTER_RETRY`|
//!
//! Retry with backoff only covers send-path errors. A nack or a return is
//! recorded, never retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use relay_broker::{
    Broker, BrokerError, Confirm, ConfirmListener, OutboundMessage, ReturnListener,
    ReturnedMessage,
};
use relay_common::{DeliveryAttempt, FailureType, Headers, Message, NewFailure, Route, Topology};
use relay_config::RelayConfig;
use relay_store::FailureStore;

use crate::alert::{self, Alert, AlertNotifier};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    /// Where `send` publishes by default
    pub route: Route,
    pub confirm_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            route: Topology::default().primary_route(),
            confirm_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&RelayConfig> for PublisherSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            route: config.topology.primary_route(),
            confirm_timeout: config.broker.confirm_timeout(),
            retry: RetryPolicy::from(&config.publisher),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("send failed: {0}")]
    Send(#[from] BrokerError),

    #[error("broker rejected message: {0}")]
    Nacked(String),

    #[error("no confirm within {0:?}")]
    ConfirmTimeout(Duration),

    #[error("returned as unroutable: {reply_code} {reply_text}")]
    Returned { reply_code: u16, reply_text: String },
}

/// How a tracked publish ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Confirmed,
    Failed { failure_type: FailureType, reason: String },
}

impl SendOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, SendOutcome::Confirmed)
    }
}

/// Completes once the broker has confirmed or rejected the message, or the
/// confirm timed out.
#[derive(Debug)]
pub struct SendHandle {
    message_id: String,
    outcome: oneshot::Receiver<SendOutcome>,
}

impl SendHandle {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub async fn wait(self) -> SendOutcome {
        self.outcome.await.unwrap_or_else(|_| SendOutcome::Failed {
            failure_type: FailureType::ConfirmFailed,
            reason: "confirm watcher dropped".to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Delivered { message_id: String, attempts: u32 },
    Failed { message_id: String, attempts: u32, error: String },
}

impl RetryOutcome {
    pub fn message_id(&self) -> &str {
        match self {
            RetryOutcome::Delivered { message_id, .. } | RetryOutcome::Failed { message_id, .. } => message_id,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, RetryOutcome::Delivered { .. })
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// A return seen for a publish before its confirm arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Returned {
    reply_code: u16,
    reply_text: String,
}

/// What the broker reported for one publish.
#[derive(Debug)]
struct Resolution {
    confirm: Confirm,
    returned: Option<Returned>,
}

struct Waiter {
    tx: oneshot::Sender<Resolution>,
    returned: Option<Returned>,
    /// Record a return as `ROUTING_FAILED` instead of handing it to the caller
    record_returns: bool,
}

/// Publishes waiting on the broker, by correlation id.
///
/// Also the return listener: a return precedes the confirm of the same
/// publish, so it is parked on the waiter and handed over with the confirm.
struct PendingConfirms {
    waiters: DashMap<String, Waiter>,
    recorder: Arc<FailureRecorder>,
}

impl PendingConfirms {
    fn new(recorder: Arc<FailureRecorder>) -> Self {
        Self { waiters: DashMap::new(), recorder }
    }

    fn track(&self, correlation_id: &str, record_returns: bool) -> oneshot::Receiver<Resolution> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .insert(correlation_id.to_string(), Waiter { tx, returned: None, record_returns });
        rx
    }

    fn forget(&self, correlation_id: &str) {
        self.waiters.remove(correlation_id);
    }
}

#[async_trait]
impl ConfirmListener for PendingConfirms {
    async fn on_confirm(&self, correlation_id: &str, confirm: Confirm) {
        match self.waiters.remove(correlation_id) {
            Some((_, waiter)) => {
                let _ = waiter.tx.send(Resolution { confirm, returned: waiter.returned });
            }
            None => debug!(correlation_id = %correlation_id, "Confirm for untracked publish"),
        }
    }
}

#[async_trait]
impl ReturnListener for PendingConfirms {
    async fn on_return(&self, returned: ReturnedMessage) {
        warn!(
            message_id = %returned.message_id,
            exchange = %returned.exchange,
            routing_key = %returned.routing_key,
            reply_code = returned.reply_code,
            reply_text = %returned.reply_text,
            "Message returned as unroutable"
        );
        metrics::counter!("relay_publish_total", "outcome" => "returned").increment(1);

        // Untracked returns (the waiter already timed out) are always recorded.
        let record = match self.waiters.get_mut(&returned.correlation_id) {
            Some(mut waiter) => {
                waiter.returned = Some(Returned {
                    reply_code: returned.reply_code,
                    reply_text: returned.reply_text.clone(),
                });
                waiter.record_returns
            }
            None => true,
        };

        if record {
            self.recorder.record_return(returned).await;
        } else {
            debug!(message_id = %returned.message_id, "Return handed to the republishing caller");
        }
    }
}

/// Writes failure records and raises alerts. Store errors are logged and
/// swallowed so they never change a publish outcome.
struct FailureRecorder {
    store: Arc<dyn FailureStore>,
    alerts: Arc<dyn AlertNotifier>,
}

impl FailureRecorder {
    async fn record(&self, failure: NewFailure, detail: &str) -> Option<String> {
        metrics::counter!("relay_failures_recorded_total", "type" => failure.failure_type.as_str())
            .increment(1);

        let mut alert = Alert {
            failure_type: failure.failure_type,
            message_id: failure.message_id.clone().unwrap_or_default(),
            exchange: failure.exchange.clone(),
            routing_key: failure.routing_key.clone(),
            detail: detail.to_string(),
            record_id: None,
        };

        let record_id = match self.store.save(failure).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!(message_id = %alert.message_id, error = %e, "Failed to record failed message");
                None
            }
        };
        alert.record_id = record_id.clone();
        alert::dispatch(&self.alerts, alert);
        record_id
    }

    async fn record_return(&self, returned: ReturnedMessage) {
        let detail = format!("{} {}", returned.reply_code, returned.reply_text);
        let failure = NewFailure::new(
            FailureType::RoutingFailed,
            String::from_utf8_lossy(&returned.payload),
            returned.exchange,
            returned.routing_key,
        )
        .with_message_id(returned.message_id)
        .with_reply(Some(returned.reply_code), returned.reply_text);
        self.record(failure, &detail).await;
    }
}

// ============================================================================
// Publisher
// ============================================================================

pub struct ResilientPublisher {
    broker: Arc<dyn Broker>,
    recorder: Arc<FailureRecorder>,
    confirms: Arc<PendingConfirms>,
    settings: PublisherSettings,
    next_publish: AtomicU64,
}

/// What a confirm watcher needs to know to record a failure.
struct Publication {
    message_id: String,
    correlation_id: String,
    body: String,
    route: Route,
}

impl ResilientPublisher {
    /// Registers the confirm and return listeners on `broker`.
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn FailureStore>,
        alerts: Arc<dyn AlertNotifier>,
        settings: PublisherSettings,
    ) -> Self {
        let recorder = Arc::new(FailureRecorder { store, alerts });
        let confirms = Arc::new(PendingConfirms::new(Arc::clone(&recorder)));
        broker.set_confirm_listener(confirms.clone());
        broker.set_return_listener(confirms.clone());

        Self {
            broker,
            recorder,
            confirms,
            settings,
            next_publish: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &PublisherSettings {
        &self.settings
    }

    pub fn primary_route(&self) -> &Route {
        &self.settings.route
    }

    /// Publish to the primary route and track the confirm in the background.
    pub async fn send(&self, message: &Message) -> SendHandle {
        let route = self.settings.route.clone();
        self.send_to(message, &route).await
    }

    pub async fn send_to_routing_key(&self, message: &Message, routing_key: &str) -> SendHandle {
        let route = Route::new(self.settings.route.exchange.clone(), routing_key);
        self.send_to(message, &route).await
    }

    /// Best-effort publish: one attempt, no backoff. A send-path error is
    /// recorded as `SEND_FAILED_AFTER_RETRY`.
    pub async fn send_to(&self, message: &Message, route: &Route) -> SendHandle {
        let (tx, rx) = oneshot::channel();
        let handle = SendHandle { message_id: message.id.clone(), outcome: rx };

        info!(
            message_id = %message.id,
            exchange = %route.exchange,
            routing_key = %route.routing_key,
            "Sending message"
        );

        let payload = match encode(message) {
            Ok(payload) => payload,
            Err(reason) => {
                let _ = tx.send(SendOutcome::Failed { failure_type: FailureType::SendFailedAfterRetry, reason });
                return handle;
            }
        };

        let correlation_id = self.correlation_id(&message.id);
        match self
            .publish_once(route, &message.id, &correlation_id, payload.clone(), Headers::new(), true)
            .await
        {
            Ok(confirm) => {
                self.watch(
                    Publication {
                        message_id: message.id.clone(),
                        correlation_id,
                        body: body_text(&payload),
                        route: route.clone(),
                    },
                    confirm,
                    Some(tx),
                );
            }
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Send failed");
                let outcome = self
                    .record_send_failure(message, route, &payload, &e.to_string())
                    .await;
                let _ = tx.send(outcome);
            }
        }
        handle
    }

    /// Publish with exponential backoff on send-path errors. Returns once the
    /// message has been handed to the broker; the confirm is tracked in the
    /// background.
    pub async fn send_with_retry(&self, message: &Message) -> RetryOutcome {
        let route = self.settings.route.clone();
        let policy = &self.settings.retry;
        let max_attempts = policy.max_attempts();

        let payload = match encode(message) {
            Ok(payload) => payload,
            Err(error) => {
                return RetryOutcome::Failed { message_id: message.id.clone(), attempts: 0, error };
            }
        };

        let mut last_error = String::new();
        let mut attempts = 0;
        for attempt in 0..max_attempts {
            let delivery = DeliveryAttempt {
                message_id: message.id.clone(),
                attempt,
                backoff: policy.delay_for(attempt),
            };
            if !delivery.backoff.is_zero() {
                tokio::time::sleep(delivery.backoff).await;
            }
            attempts = attempt + 1;

            let correlation_id = self.correlation_id(&message.id);
            match self
                .publish_once(&route, &message.id, &correlation_id, payload.clone(), Headers::new(), true)
                .await
            {
                Ok(confirm) => {
                    info!(message_id = %message.id, attempts, "Message sent");
                    self.watch(
                        Publication {
                            message_id: message.id.clone(),
                            correlation_id,
                            body: body_text(&payload),
                            route: route.clone(),
                        },
                        confirm,
                        None,
                    );
                    return RetryOutcome::Delivered { message_id: message.id.clone(), attempts };
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempts < max_attempts && e.is_transient() {
                        metrics::counter!("relay_publish_retries_total").increment(1);
                        warn!(
                            message_id = %delivery.message_id,
                            attempt = attempts,
                            max_attempts,
                            next_backoff_ms = policy.delay_for(attempts).as_millis() as u64,
                            error = %e,
                            "Publish attempt failed, retrying"
                        );
                    } else {
                        warn!(message_id = %delivery.message_id, attempt = attempts, error = %e, "Publish attempt failed");
                        if !e.is_transient() {
                            break;
                        }
                    }
                }
            }
        }

        error!(message_id = %message.id, attempts, error = %last_error, "Publish failed after retries");
        self.record_send_failure(message, &route, &payload, &last_error).await;
        RetryOutcome::Failed { message_id: message.id.clone(), attempts, error: last_error }
    }

    /// Publish and wait for the confirm.
    pub async fn send_and_confirm(&self, message: &Message) -> bool {
        self.send(message).await.wait().await.is_confirmed()
    }

    /// One tracked publish per message, in order.
    pub async fn send_batch(&self, messages: &[Message]) -> Vec<SendHandle> {
        let mut handles = Vec::with_capacity(messages.len());
        for message in messages {
            handles.push(self.send(message).await);
        }
        info!(count = messages.len(), "Batch sent");
        handles
    }

    /// Publish raw bytes and wait for the confirm. A return for this publish
    /// is an error, as is a nack or a timeout. Nothing is recorded; the caller
    /// decides what a failure means. Used for consumer retries, unrouted
    /// repairs and failed-message recovery.
    pub async fn republish(
        &self,
        route: &Route,
        message_id: &str,
        payload: Bytes,
        headers: Headers,
    ) -> Result<(), PublishError> {
        let correlation_id = self.correlation_id(message_id);
        let confirm = self
            .publish_once(route, message_id, &correlation_id, payload, headers, false)
            .await?;
        match await_confirm(confirm, self.settings.confirm_timeout).await {
            Ok(None) => Ok(()),
            Ok(Some(returned)) => Err(PublishError::Returned {
                reply_code: returned.reply_code,
                reply_text: returned.reply_text,
            }),
            Err(e) => {
                self.confirms.forget(&correlation_id);
                Err(e)
            }
        }
    }

    fn correlation_id(&self, message_id: &str) -> String {
        let seq = self.next_publish.fetch_add(1, Ordering::Relaxed);
        format!("{message_id}#{seq}")
    }

    async fn publish_once(
        &self,
        route: &Route,
        message_id: &str,
        correlation_id: &str,
        payload: Bytes,
        headers: Headers,
        record_returns: bool,
    ) -> Result<oneshot::Receiver<Resolution>, BrokerError> {
        let rx = self.confirms.track(correlation_id, record_returns);

        let outbound = OutboundMessage::new(&route.exchange, &route.routing_key, message_id, payload)
            .with_correlation_id(correlation_id)
            .with_headers(headers);
        if let Err(e) = self.broker.publish(outbound).await {
            self.confirms.forget(correlation_id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Resolve a publish in the background, recording `CONFIRM_FAILED` on a
    /// nack or timeout.
    fn watch(
        &self,
        publication: Publication,
        confirm: oneshot::Receiver<Resolution>,
        notify: Option<oneshot::Sender<SendOutcome>>,
    ) {
        let confirms = Arc::clone(&self.confirms);
        let recorder = Arc::clone(&self.recorder);
        let timeout = self.settings.confirm_timeout;

        tokio::spawn(async move {
            // A return was already recorded by the listener; the exchange
            // still accepted the message.
            let outcome = match await_confirm(confirm, timeout).await {
                Ok(_) => {
                    debug!(message_id = %publication.message_id, "Message reached exchange");
                    metrics::counter!("relay_publish_total", "outcome" => "confirmed").increment(1);
                    SendOutcome::Confirmed
                }
                Err(e) => {
                    confirms.forget(&publication.correlation_id);
                    let reason = e.to_string();
                    error!(
                        message_id = %publication.message_id,
                        exchange = %publication.route.exchange,
                        reason = %reason,
                        "Message did not reach exchange"
                    );
                    metrics::counter!("relay_publish_total", "outcome" => "confirm_failed").increment(1);

                    let failure = NewFailure::new(
                        FailureType::ConfirmFailed,
                        publication.body,
                        publication.route.exchange,
                        publication.route.routing_key,
                    )
                    .with_message_id(publication.message_id)
                    .with_reply(None, reason.clone());
                    recorder.record(failure, &reason).await;
                    SendOutcome::Failed { failure_type: FailureType::ConfirmFailed, reason }
                }
            };
            if let Some(notify) = notify {
                let _ = notify.send(outcome);
            }
        });
    }

    async fn record_send_failure(
        &self,
        message: &Message,
        route: &Route,
        payload: &Bytes,
        reason: &str,
    ) -> SendOutcome {
        metrics::counter!("relay_publish_total", "outcome" => "send_failed").increment(1);
        let failure = NewFailure::new(
            FailureType::SendFailedAfterRetry,
            body_text(payload),
            route.exchange.clone(),
            route.routing_key.clone(),
        )
        .with_message_id(message.id.clone())
        .with_reply(None, reason);
        self.recorder.record(failure, reason).await;
        SendOutcome::Failed {
            failure_type: FailureType::SendFailedAfterRetry,
            reason: reason.to_string(),
        }
    }
}

/// Ack yields the return seen for the publish, if any.
async fn await_confirm(
    confirm: oneshot::Receiver<Resolution>,
    timeout: Duration,
) -> Result<Option<Returned>, PublishError> {
    match tokio::time::timeout(timeout, confirm).await {
        Ok(Ok(Resolution { confirm: Confirm::Ack, returned })) => Ok(returned),
        Ok(Ok(Resolution { confirm: Confirm::Nack { reason }, .. })) => Err(PublishError::Nacked(reason)),
        Ok(Err(_)) => Err(PublishError::Nacked("confirm channel closed".to_string())),
        Err(_) => Err(PublishError::ConfirmTimeout(timeout)),
    }
}

fn encode(message: &Message) -> Result<Bytes, String> {
    message.to_json().map(Bytes::from).map_err(|e| {
        error!(message_id = %message.id, error = %e, "Failed to serialize message");
        e.to_string()
    })
}

fn body_text(payload: &Bytes) -> String {
    String::from_utf8_lossy(payload).into_owned()
}
