//! Broker abstraction
//!
//! The reliability layer talks to the broker through [`Broker`]. Publishing
//! only reports send-path errors; the two asynchronous broker signals arrive
//! through separately registered listeners:
//!
//! - [`ConfirmListener`]: the message reached (or did not reach) an exchange,
//!   keyed by the publish's correlation id (the message id unless overridden)
//! - [`ReturnListener`]: the exchange accepted the message but no queue matched
//!
//! Implementations:
//! - [`memory::MemoryBroker`]: in-process broker with the routing, dead-letter
//!   and TTL behaviour the fixed topology relies on
//! - `amqp::AmqpBroker` (feature `amqp`): RabbitMQ via lapin

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use relay_common::{Headers, Topology};

pub mod memory;
pub mod topology;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use memory::MemoryBroker;
pub use topology::{BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec, TopologyPlan};

/// Reply code the broker uses for an unroutable mandatory publish.
pub const NO_ROUTE: u16 = 312;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("Broker closed")]
    Closed,
}

impl BrokerError {
    /// Whether a retry of the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_) | BrokerError::Channel(_) | BrokerError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message_id: String,
    /// Handed back with the confirm for this publish
    pub correlation_id: String,
    pub payload: Bytes,
    pub headers: Headers,
    /// Ask the broker to return the message when no queue matches
    pub mandatory: bool,
}

impl OutboundMessage {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        message_id: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        let message_id = message_id.into();
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            correlation_id: message_id.clone(),
            message_id,
            payload: payload.into(),
            headers: Headers::new(),
            mandatory: true,
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}

/// A message received from a queue, acked or nacked by delivery tag.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub message_id: Option<String>,
    pub payload: Bytes,
    pub headers: Headers,
    pub redelivered: bool,
}

/// Arrival confirmation for a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirm {
    Ack,
    Nack { reason: String },
}

/// A message the broker could not route.
#[derive(Debug, Clone)]
pub struct ReturnedMessage {
    pub message_id: String,
    /// Correlation id of the publish that came back
    pub correlation_id: String,
    pub exchange: String,
    pub routing_key: String,
    pub reply_code: u16,
    pub reply_text: String,
    pub payload: Bytes,
}

// ============================================================================
// Traits
// ============================================================================

#[async_trait]
pub trait ConfirmListener: Send + Sync {
    async fn on_confirm(&self, correlation_id: &str, confirm: Confirm);
}

#[async_trait]
pub trait ReturnListener: Send + Sync {
    async fn on_return(&self, returned: ReturnedMessage);
}

/// One consumer subscription. Each worker owns its own stream.
#[async_trait]
pub trait DeliveryStream: Send + Sync {
    fn consumer_tag(&self) -> &str;

    /// Next delivery, or `None` once the stream is cancelled or closed.
    async fn next(&mut self) -> Option<Delivery>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Stop delivering. Unacknowledged deliveries go back to the queue.
    async fn cancel(&self) -> Result<()>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    fn identifier(&self) -> &str;

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<()>;

    /// Declare every exchange, queue and binding of the fixed topology.
    async fn declare_topology(&self, topology: &Topology) -> Result<()> {
        let plan = TopologyPlan::from_topology(topology);
        for exchange in &plan.exchanges {
            self.declare_exchange(exchange).await?;
        }
        for queue in &plan.queues {
            self.declare_queue(queue).await?;
        }
        for binding in &plan.bindings {
            self.bind_queue(binding).await?;
        }
        tracing::info!(
            broker = self.identifier(),
            exchanges = plan.exchanges.len(),
            queues = plan.queues.len(),
            "Topology declared"
        );
        Ok(())
    }

    fn set_confirm_listener(&self, listener: Arc<dyn ConfirmListener>);

    fn set_return_listener(&self, listener: Arc<dyn ReturnListener>);

    /// Hand a message to the broker. An error here is a send-path failure;
    /// confirmation and returns arrive later through the listeners.
    async fn publish(&self, message: OutboundMessage) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<Box<dyn DeliveryStream>>;
}
