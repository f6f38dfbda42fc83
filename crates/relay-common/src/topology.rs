//! Names of the fixed broker topology.

use serde::{Deserialize, Serialize};

pub const PRIMARY_EXCHANGE: &str = "demo.exchange";
pub const PRIMARY_QUEUE: &str = "demo.queue";
pub const PRIMARY_ROUTING_KEY: &str = "demo.routing.key";

pub const DEAD_LETTER_EXCHANGE: &str = "dlx.exchange";
pub const DEAD_LETTER_QUEUE: &str = "dlx.queue";
pub const DEAD_LETTER_ROUTING_KEY: &str = "dlx.routing.key";

pub const RETRY_EXCHANGE: &str = "demo.retry.exchange";
pub const RETRY_QUEUE: &str = "demo.retry.queue";
pub const RETRY_ROUTING_KEY: &str = "demo.retry.routing.key";
pub const RETRY_DELAY_MS: u64 = 5_000;

pub const ALTERNATE_EXCHANGE: &str = "alternate.exchange";
pub const UNROUTED_QUEUE: &str = "unrouted.messages.queue";

/// Routing key used to demonstrate an unroutable publish.
pub const WRONG_ROUTING_KEY: &str = "wrong.routing.key";

/// Exchange plus routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    pub exchange: String,
    pub routing_key: String,
}

impl Route {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    pub dead_letter_routing_key: String,
    pub retry_exchange: String,
    pub retry_queue: String,
    pub retry_routing_key: String,
    /// TTL of the delay queue in milliseconds
    pub retry_delay_ms: u64,
    pub alternate_exchange: String,
    pub unrouted_queue: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: PRIMARY_EXCHANGE.to_string(),
            queue: PRIMARY_QUEUE.to_string(),
            routing_key: PRIMARY_ROUTING_KEY.to_string(),
            dead_letter_exchange: DEAD_LETTER_EXCHANGE.to_string(),
            dead_letter_queue: DEAD_LETTER_QUEUE.to_string(),
            dead_letter_routing_key: DEAD_LETTER_ROUTING_KEY.to_string(),
            retry_exchange: RETRY_EXCHANGE.to_string(),
            retry_queue: RETRY_QUEUE.to_string(),
            retry_routing_key: RETRY_ROUTING_KEY.to_string(),
            retry_delay_ms: RETRY_DELAY_MS,
            alternate_exchange: ALTERNATE_EXCHANGE.to_string(),
            unrouted_queue: UNROUTED_QUEUE.to_string(),
        }
    }
}

impl Topology {
    pub fn primary_route(&self) -> Route {
        Route::new(&self.exchange, &self.routing_key)
    }

    pub fn retry_route(&self) -> Route {
        Route::new(&self.retry_exchange, &self.retry_routing_key)
    }

    pub fn dead_letter_route(&self) -> Route {
        Route::new(&self.dead_letter_exchange, &self.dead_letter_routing_key)
    }
}
