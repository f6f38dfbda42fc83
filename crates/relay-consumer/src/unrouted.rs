//! Consumer for messages salvaged by the alternate exchange.
//!
//! Each capture is logged and kept in a bounded history for diagnostics.
//! With a [`RepairStrategy`] configured, a message whose routing key can be
//! corrected is resent once, marked with `x-repair-attempted` so a second
//! failure is only captured. Deliveries are always acked.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use relay_broker::{Broker, Delivery, DeliveryStream};
use relay_common::headers::REPAIR_ATTEMPTED_HEADER;
use relay_common::{FieldValue, Message, Route};
use relay_config::UnroutedConfig;
use relay_publisher::ResilientPublisher;

use crate::{ack, ConsumerGroup, DeliveryHandler, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnroutedCapture {
    pub message_id: Option<String>,
    pub exchange: String,
    pub routing_key: String,
    pub captured_at: DateTime<Utc>,
    /// Routing key the message was resent with, if repaired
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repaired_to: Option<String>,
}

/// Decides a corrected routing key for an unrouted message.
pub trait RepairStrategy: Send + Sync {
    fn repair(&self, capture: &UnroutedCapture) -> Option<String>;
}

/// Replaces a substring of the routing key.
#[derive(Debug, Clone)]
pub struct SubstringRepair {
    pub from: String,
    pub to: String,
}

impl SubstringRepair {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self { from: from.into(), to: to.into() }
    }
}

impl RepairStrategy for SubstringRepair {
    fn repair(&self, capture: &UnroutedCapture) -> Option<String> {
        if self.from.is_empty() || !capture.routing_key.contains(&self.from) {
            return None;
        }
        let repaired = capture.routing_key.replace(&self.from, &self.to);
        (repaired != capture.routing_key).then_some(repaired)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnroutedOutcome {
    Captured,
    Repaired { routing_key: String },
    RepairFailed,
}

pub struct UnroutedConsumer {
    publisher: Arc<ResilientPublisher>,
    repair: Option<Arc<dyn RepairStrategy>>,
    queue: String,
    history: Mutex<VecDeque<UnroutedCapture>>,
    history_size: usize,
}

impl UnroutedConsumer {
    pub fn new(publisher: Arc<ResilientPublisher>, queue: impl Into<String>, history_size: usize) -> Self {
        Self {
            publisher,
            repair: None,
            queue: queue.into(),
            history: Mutex::new(VecDeque::with_capacity(history_size)),
            history_size,
        }
    }

    pub fn from_config(publisher: Arc<ResilientPublisher>, queue: impl Into<String>, config: &UnroutedConfig) -> Self {
        let consumer = Self::new(publisher, queue, config.history_size);
        if config.repair_enabled {
            consumer.with_repair(Arc::new(SubstringRepair::new(&config.repair_from, &config.repair_to)))
        } else {
            consumer
        }
    }

    pub fn with_repair(mut self, strategy: Arc<dyn RepairStrategy>) -> Self {
        self.repair = Some(strategy);
        self
    }

    pub async fn start(self: Arc<Self>, broker: &Arc<dyn Broker>, prefetch: u16) -> Result<ConsumerGroup> {
        let queue = self.queue.clone();
        ConsumerGroup::start("unrouted", broker, &queue, 1, prefetch, self).await
    }

    /// Most recent captures, newest first.
    pub fn recent(&self) -> Vec<UnroutedCapture> {
        self.history.lock().iter().rev().cloned().collect()
    }

    pub async fn handle_delivery(&self, stream: &dyn DeliveryStream, delivery: &Delivery) -> UnroutedOutcome {
        let mut capture = UnroutedCapture {
            message_id: delivery
                .message_id
                .clone()
                .or_else(|| Message::from_json(&delivery.payload).ok().map(|m| m.id)),
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            captured_at: Utc::now(),
            repaired_to: None,
        };
        warn!(
            message_id = ?capture.message_id,
            exchange = %capture.exchange,
            routing_key = %capture.routing_key,
            "Unrouted message captured"
        );

        let outcome = self.try_repair(delivery, &capture).await;
        if let UnroutedOutcome::Repaired { routing_key } = &outcome {
            capture.repaired_to = Some(routing_key.clone());
        }
        self.remember(capture);
        ack(stream, delivery).await;
        outcome
    }

    async fn try_repair(&self, delivery: &Delivery, capture: &UnroutedCapture) -> UnroutedOutcome {
        let Some(strategy) = &self.repair else {
            return UnroutedOutcome::Captured;
        };
        if delivery.headers.contains_key(REPAIR_ATTEMPTED_HEADER) {
            info!(message_id = ?capture.message_id, "Already repaired once, not retrying");
            return UnroutedOutcome::Captured;
        }
        let Some(routing_key) = strategy.repair(capture) else {
            return UnroutedOutcome::Captured;
        };

        let message_id = capture.message_id.clone().unwrap_or_default();
        let mut headers = delivery.headers.clone();
        headers.insert(REPAIR_ATTEMPTED_HEADER.to_string(), FieldValue::Bool(true));
        let route = Route::new(capture.exchange.clone(), routing_key.clone());

        match self.publisher.republish(&route, &message_id, delivery.payload.clone(), headers).await {
            Ok(()) => {
                info!(message_id = %message_id, routing_key = %routing_key, "Unrouted message repaired and resent");
                UnroutedOutcome::Repaired { routing_key }
            }
            Err(e) => {
                error!(message_id = %message_id, error = %e, "Repair resend failed");
                UnroutedOutcome::RepairFailed
            }
        }
    }

    fn remember(&self, capture: UnroutedCapture) {
        if self.history_size == 0 {
            return;
        }
        let mut history = self.history.lock();
        while history.len() >= self.history_size {
            history.pop_front();
        }
        history.push_back(capture);
    }
}

#[async_trait]
impl DeliveryHandler for UnroutedConsumer {
    async fn handle(&self, stream: &dyn DeliveryStream, delivery: Delivery) {
        self.handle_delivery(stream, &delivery).await;
    }
}
