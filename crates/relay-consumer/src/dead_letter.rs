//! Dead-letter queue consumer.
//!
//! Classifies each dead letter by the reason of its most recent `x-death`
//! entry and records it as a consume-stage failure. Deliveries are always
//! acked; a store error is logged and the message dropped.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use relay_broker::{Broker, Delivery, DeliveryStream};
use relay_common::{DeathRecord, FailureStage, FailureType, Message, NewFailure};
use relay_store::FailureStore;

use crate::{ack, ConsumerGroup, DeliveryHandler, Result};

pub struct DeadLetterConsumer {
    store: Arc<dyn FailureStore>,
    queue: String,
}

impl DeadLetterConsumer {
    pub fn new(store: Arc<dyn FailureStore>, queue: impl Into<String>) -> Self {
        Self { store, queue: queue.into() }
    }

    pub async fn start(self: Arc<Self>, broker: &Arc<dyn Broker>, prefetch: u16) -> Result<ConsumerGroup> {
        let queue = self.queue.clone();
        ConsumerGroup::start("dead-letter", broker, &queue, 1, prefetch, self).await
    }

    /// Build the failure record for a dead letter.
    pub fn classify(delivery: &Delivery) -> NewFailure {
        let death = DeathRecord::first(&delivery.headers);
        let (failure_type, reason, queue) = match &death {
            Some(d) => (d.reason.failure_type(), d.reason.as_str().to_string(), d.queue.clone()),
            None => (FailureType::ConsumeFailed, "unknown".to_string(), "unknown".to_string()),
        };

        let exchange = death
            .as_ref()
            .map(|d| d.exchange.clone())
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| delivery.exchange.clone());
        let routing_key = death
            .as_ref()
            .and_then(|d| d.routing_keys.first().cloned())
            .unwrap_or_else(|| delivery.routing_key.clone());

        // Prefer the id inside the body; fall back to the broker property.
        let message_id = Message::from_json(&delivery.payload)
            .map(|m| m.id)
            .ok()
            .or_else(|| delivery.message_id.clone());

        let mut failure = NewFailure::new(
            failure_type,
            String::from_utf8_lossy(&delivery.payload),
            exchange,
            routing_key,
        )
        .with_reply(None, format!("dead letter reason: {}, source queue: {}", reason, queue))
        .with_stage(FailureStage::Consume);
        if let Some(id) = message_id {
            failure = failure.with_message_id(id);
        }
        failure
    }

    /// Record the dead letter and ack it. Returns the record id when the
    /// store accepted it.
    pub async fn handle_delivery(&self, stream: &dyn DeliveryStream, delivery: &Delivery) -> Option<String> {
        let failure = Self::classify(delivery);
        warn!(
            message_id = ?failure.message_id,
            failure_type = %failure.failure_type,
            reply_text = ?failure.reply_text,
            "Dead letter received"
        );
        metrics::counter!("relay_failures_recorded_total", "type" => failure.failure_type.as_str())
            .increment(1);

        let record_id = match self.store.save(failure).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!(delivery_tag = delivery.delivery_tag, error = %e, "Failed to record dead letter");
                None
            }
        };
        ack(stream, delivery).await;
        record_id
    }
}

#[async_trait]
impl DeliveryHandler for DeadLetterConsumer {
    async fn handle(&self, stream: &dyn DeliveryStream, delivery: Delivery) {
        self.handle_delivery(stream, &delivery).await;
    }
}
