//! Declarations derived from the fixed topology.

use std::time::Duration;

use relay_common::Topology;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub alternate_exchange: Option<String>,
}

impl ExchangeSpec {
    pub fn direct(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: ExchangeKind::Direct, alternate_exchange: None }
    }

    pub fn fanout(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: ExchangeKind::Fanout, alternate_exchange: None }
    }

    pub fn with_alternate(mut self, exchange: impl Into<String>) -> Self {
        self.alternate_exchange = Some(exchange.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl: Option<Duration>,
    pub max_length: Option<usize>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn dead_letter_to(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl BindingSpec {
    pub fn new(queue: impl Into<String>, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self { queue: queue.into(), exchange: exchange.into(), routing_key: routing_key.into() }
    }
}

/// Everything a broker needs declared, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyPlan {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

impl TopologyPlan {
    pub fn from_topology(t: &Topology) -> Self {
        let exchanges = vec![
            ExchangeSpec::fanout(&t.alternate_exchange),
            ExchangeSpec::direct(&t.exchange).with_alternate(&t.alternate_exchange),
            ExchangeSpec::direct(&t.dead_letter_exchange),
            ExchangeSpec::direct(&t.retry_exchange),
        ];

        let queues = vec![
            QueueSpec::new(&t.queue).dead_letter_to(&t.dead_letter_exchange, &t.dead_letter_routing_key),
            QueueSpec::new(&t.dead_letter_queue),
            QueueSpec::new(&t.retry_queue)
                .with_ttl(Duration::from_millis(t.retry_delay_ms))
                .dead_letter_to(&t.exchange, &t.routing_key),
            QueueSpec::new(&t.unrouted_queue),
        ];

        let bindings = vec![
            BindingSpec::new(&t.queue, &t.exchange, &t.routing_key),
            BindingSpec::new(&t.dead_letter_queue, &t.dead_letter_exchange, &t.dead_letter_routing_key),
            BindingSpec::new(&t.retry_queue, &t.retry_exchange, &t.retry_routing_key),
            BindingSpec::new(&t.unrouted_queue, &t.alternate_exchange, ""),
        ];

        Self { exchanges, queues, bindings }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_wires_retry_queue_back_to_primary() {
        let plan = TopologyPlan::from_topology(&Topology::default());

        let retry = plan.queues.iter().find(|q| q.name == "demo.retry.queue").unwrap();
        assert_eq!(retry.message_ttl, Some(Duration::from_millis(5000)));
        assert_eq!(retry.dead_letter_exchange.as_deref(), Some("demo.exchange"));
        assert_eq!(retry.dead_letter_routing_key.as_deref(), Some("demo.routing.key"));

        let primary = plan.queues.iter().find(|q| q.name == "demo.queue").unwrap();
        assert_eq!(primary.dead_letter_exchange.as_deref(), Some("dlx.exchange"));
        assert_eq!(primary.dead_letter_routing_key.as_deref(), Some("dlx.routing.key"));
    }

    #[test]
    fn test_alternate_exchange_declared_first() {
        let plan = TopologyPlan::from_topology(&Topology::default());
        assert_eq!(plan.exchanges[0].name, "alternate.exchange");
        assert_eq!(plan.exchanges[0].kind, ExchangeKind::Fanout);
        assert_eq!(plan.exchanges[1].alternate_exchange.as_deref(), Some("alternate.exchange"));
    }
}
