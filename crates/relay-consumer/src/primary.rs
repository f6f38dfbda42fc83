//! Primary queue consumer.
//!
//! Per delivery:
//! 1. undecodable payload: nack without requeue
//! 2. already processed: ack and drop
//! 3. process; on success remember the id and ack
//! 4. on failure with `x-retry-count < max_retry`: republish to the retry
//!    exchange with the count bumped, then ack. The retry queue's TTL is the
//!    delay; on expiry the broker routes the message back here.
//! 5. otherwise nack without requeue so the broker dead-letters it

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use relay_broker::{Broker, Delivery, DeliveryStream};
use relay_common::headers::{retry_count, set_retry_count};
use relay_common::{Message, Route, Topology};
use relay_config::RelayConfig;
use relay_publisher::ResilientPublisher;
use relay_store::IdempotencyGuard;

use crate::{ack, nack, ConsumerGroup, DeliveryHandler, MessageProcessor, Result};

#[derive(Debug, Clone)]
pub struct PrimarySettings {
    pub queue: String,
    pub retry_route: Route,
    pub max_retry: u32,
    pub concurrency: u32,
    pub prefetch: u16,
}

impl Default for PrimarySettings {
    fn default() -> Self {
        let topology = Topology::default();
        Self {
            queue: topology.queue.clone(),
            retry_route: topology.retry_route(),
            max_retry: 3,
            concurrency: 3,
            prefetch: 1,
        }
    }
}

impl From<&RelayConfig> for PrimarySettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            queue: config.topology.queue.clone(),
            retry_route: config.topology.retry_route(),
            max_retry: config.consumer.max_retry,
            concurrency: config.consumer.effective_concurrency(),
            prefetch: config.consumer.prefetch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Duplicate,
    Processed,
    /// Sent through the delay queue; `attempt` is the new retry count
    RetryScheduled { attempt: u32 },
    /// Retry republish failed; the delivery went back to this queue
    Requeued,
    DeadLettered,
    /// Payload could not be decoded
    Rejected,
}

pub struct PrimaryConsumer {
    publisher: Arc<ResilientPublisher>,
    processor: Arc<dyn MessageProcessor>,
    guard: Arc<IdempotencyGuard>,
    settings: PrimarySettings,
}

impl PrimaryConsumer {
    pub fn new(
        publisher: Arc<ResilientPublisher>,
        processor: Arc<dyn MessageProcessor>,
        guard: Arc<IdempotencyGuard>,
        settings: PrimarySettings,
    ) -> Self {
        Self { publisher, processor, guard, settings }
    }

    pub fn settings(&self) -> &PrimarySettings {
        &self.settings
    }

    pub async fn start(self: Arc<Self>, broker: &Arc<dyn Broker>) -> Result<ConsumerGroup> {
        let queue = self.settings.queue.clone();
        let concurrency = self.settings.concurrency;
        let prefetch = self.settings.prefetch;
        ConsumerGroup::start("primary", broker, &queue, concurrency, prefetch, self).await
    }

    pub async fn handle_delivery(&self, stream: &dyn DeliveryStream, delivery: &Delivery) -> ConsumeOutcome {
        let message = match Message::from_json(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                error!(
                    message_id = ?delivery.message_id,
                    error = %e,
                    "Undecodable message, rejecting without requeue"
                );
                nack(stream, delivery, false).await;
                return ConsumeOutcome::Rejected;
            }
        };

        if self.guard.is_processed(&message.id) {
            info!(message_id = %message.id, "Duplicate message, skipping");
            metrics::counter!("relay_consume_total", "outcome" => "duplicate").increment(1);
            ack(stream, delivery).await;
            return ConsumeOutcome::Duplicate;
        }

        let error = match self.processor.process(&message).await {
            Ok(()) => {
                self.guard.mark_processed(&message.id);
                info!(message_id = %message.id, "Message processed");
                metrics::counter!("relay_consume_total", "outcome" => "processed").increment(1);
                ack(stream, delivery).await;
                return ConsumeOutcome::Processed;
            }
            Err(e) => e,
        };

        let count = retry_count(&delivery.headers);
        if count >= self.settings.max_retry {
            error!(
                message_id = %message.id,
                retry_count = count,
                error = %error,
                "Retries exhausted, dead-lettering message"
            );
            metrics::counter!("relay_consume_total", "outcome" => "dead_lettered").increment(1);
            nack(stream, delivery, false).await;
            return ConsumeOutcome::DeadLettered;
        }

        let attempt = count + 1;
        let mut headers = delivery.headers.clone();
        set_retry_count(&mut headers, attempt);

        match self
            .publisher
            .republish(&self.settings.retry_route, &message.id, delivery.payload.clone(), headers)
            .await
        {
            Ok(()) => {
                warn!(
                    message_id = %message.id,
                    attempt,
                    max_retry = self.settings.max_retry,
                    error = %error,
                    "Processing failed, scheduled delayed retry"
                );
                metrics::counter!("relay_consume_total", "outcome" => "retry_scheduled").increment(1);
                ack(stream, delivery).await;
                ConsumeOutcome::RetryScheduled { attempt }
            }
            Err(e) => {
                error!(
                    message_id = %message.id,
                    error = %e,
                    "Could not schedule retry, requeueing delivery"
                );
                metrics::counter!("relay_consume_total", "outcome" => "requeued").increment(1);
                nack(stream, delivery, true).await;
                ConsumeOutcome::Requeued
            }
        }
    }
}

#[async_trait]
impl DeliveryHandler for PrimaryConsumer {
    async fn handle(&self, stream: &dyn DeliveryStream, delivery: Delivery) {
        self.handle_delivery(stream, &delivery).await;
    }
}
