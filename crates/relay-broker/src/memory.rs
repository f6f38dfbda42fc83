//! In-process broker.
//!
//! Implements the subset of AMQP broker behaviour the relay depends on:
//! direct and fanout exchanges, alternate exchanges, dead-letter exchanges
//! with `x-death` bookkeeping, per-queue message TTL, max-length overflow,
//! prefetch-limited consumers, publisher confirms and mandatory returns.
//!
//! Unlike RabbitMQ, a mandatory publish the primary exchange cannot route
//! is returned to the publisher even when its alternate exchange took a
//! copy, so both salvage paths can be observed together.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, warn};

use relay_common::headers::record_death;
use relay_common::{DeathReason, DeathRecord, Headers};

use crate::{
    BindingSpec, Broker, BrokerError, Confirm, ConfirmListener, Delivery, DeliveryStream,
    ExchangeKind, ExchangeSpec, OutboundMessage, QueueSpec, Result, ReturnListener,
    ReturnedMessage, NO_ROUTE,
};

/// Guards against alternate-exchange cycles.
const MAX_ROUTING_DEPTH: usize = 4;

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    confirm_listener: RwLock<Option<Arc<dyn ConfirmListener>>>,
    return_listener: RwLock<Option<Arc<dyn ReturnListener>>>,
    injected_failures: AtomicU32,
    publish_attempts: AtomicU64,
    next_delivery_tag: AtomicU64,
    next_seq: AtomicU64,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingSpec>,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    unacked: usize,
    acked: u64,
    notify: Arc<Notify>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    exchange: String,
    routing_key: String,
    message_id: String,
    payload: Bytes,
    headers: Headers,
    redelivered: bool,
}

impl StoredMessage {
    fn to_delivery(&self, delivery_tag: u64) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            message_id: Some(self.message_id.clone()),
            payload: self.payload.clone(),
            headers: self.headers.clone(),
            redelivered: self.redelivered,
        }
    }
}

enum PublishOutcome {
    Routed { returned: bool },
    UnknownExchange,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                confirm_listener: RwLock::new(None),
                return_listener: RwLock::new(None),
                injected_failures: AtomicU32::new(0),
                publish_attempts: AtomicU64::new(0),
                next_delivery_tag: AtomicU64::new(1),
                next_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Make the next `n` publishes fail on the send path.
    pub fn fail_next_publishes(&self, n: u32) {
        self.inner.injected_failures.store(n, Ordering::SeqCst);
    }

    /// Publish calls seen, including ones that failed.
    pub fn publish_attempts(&self) -> u64 {
        self.inner.publish_attempts.load(Ordering::SeqCst)
    }

    /// Messages waiting in a queue (not counting unacked ones).
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner.state.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner.state.lock().queues.get(queue).map_or(0, |q| q.unacked)
    }

    /// Acks settled on a queue since it was declared.
    pub fn acked_count(&self, queue: &str) -> u64 {
        self.inner.state.lock().queues.get(queue).map_or(0, |q| q.acked)
    }

    /// Snapshot of the messages waiting in a queue, front first.
    pub fn peek(&self, queue: &str) -> Vec<Delivery> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.to_delivery(0)).collect())
            .unwrap_or_default()
    }

    fn take_injected_failure(&self) -> bool {
        self.inner
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Inner {
    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Queues a message lands in. `None` if the exchange does not exist; the
    /// flag is false when only an alternate exchange matched.
    fn resolve(state: &State, exchange: &str, routing_key: &str, depth: usize) -> Option<(Vec<String>, bool)> {
        let spec = state.exchanges.get(exchange)?;
        let queues: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| spec.kind == ExchangeKind::Fanout || b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect();
        if !queues.is_empty() {
            return Some((queues, true));
        }

        if let Some(alternate) = &spec.alternate_exchange {
            if depth < MAX_ROUTING_DEPTH {
                if let Some((queues, _)) = Self::resolve(state, alternate, routing_key, depth + 1) {
                    return Some((queues, false));
                }
            }
        }
        Some((Vec::new(), false))
    }

    fn enqueue(self: &Arc<Self>, state: &mut State, queue: &str, message: StoredMessage) {
        let Some(q) = state.queues.get_mut(queue) else {
            warn!(queue = %queue, "Binding points at undeclared queue, message dropped");
            return;
        };

        if let Some(ttl) = q.spec.message_ttl {
            let inner = Arc::clone(self);
            let queue_name = queue.to_string();
            let seq = message.seq;
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                inner.expire(&queue_name, seq);
            });
        }

        q.ready.push_back(message);
        let overflow = match q.spec.max_length {
            Some(max) if q.ready.len() > max => q.ready.pop_front(),
            _ => None,
        };
        q.notify.notify_waiters();

        if let Some(dropped) = overflow {
            self.dead_letter(state, queue, dropped, DeathReason::MaxLen);
        }
    }

    fn expire(self: &Arc<Self>, queue: &str, seq: u64) {
        let mut state = self.state.lock();
        let expired = state.queues.get_mut(queue).and_then(|q| {
            let pos = q.ready.iter().position(|m| m.seq == seq)?;
            q.ready.remove(pos)
        });
        if let Some(message) = expired {
            debug!(queue = %queue, message_id = %message.message_id, "Message expired");
            self.dead_letter(&mut state, queue, message, DeathReason::Expired);
        }
    }

    fn dead_letter(self: &Arc<Self>, state: &mut State, queue: &str, mut message: StoredMessage, reason: DeathReason) {
        let Some((exchange, routing_key)) = state.queues.get(queue).and_then(|q| {
            let exchange = q.spec.dead_letter_exchange.clone()?;
            let routing_key = q
                .spec
                .dead_letter_routing_key
                .clone()
                .unwrap_or_else(|| message.routing_key.clone());
            Some((exchange, routing_key))
        }) else {
            debug!(queue = %queue, message_id = %message.message_id, "No dead-letter exchange, message discarded");
            return;
        };

        record_death(
            &mut message.headers,
            DeathRecord {
                reason,
                queue: queue.to_string(),
                exchange: message.exchange.clone(),
                routing_keys: vec![message.routing_key.clone()],
                count: 0,
            },
        );
        message.seq = self.next_seq();
        message.exchange = exchange.clone();
        message.routing_key = routing_key.clone();
        message.redelivered = false;

        match Self::resolve(state, &exchange, &routing_key, 0) {
            Some((queues, _)) if !queues.is_empty() => {
                for target in queues {
                    self.enqueue(state, &target, message.clone());
                }
            }
            _ => warn!(exchange = %exchange, routing_key = %routing_key, "Dead-lettered message could not be routed"),
        }
    }

    fn take(&self, queue: &str) -> Option<StoredMessage> {
        let mut state = self.state.lock();
        let q = state.queues.get_mut(queue)?;
        let message = q.ready.pop_front()?;
        q.unacked += 1;
        Some(message)
    }

    fn settle(self: &Arc<Self>, queue: &str, message: StoredMessage, outcome: Settle) {
        let mut state = self.state.lock();
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        q.unacked = q.unacked.saturating_sub(1);
        match outcome {
            Settle::Ack => q.acked += 1,
            Settle::Requeue => {
                let mut message = message;
                message.redelivered = true;
                q.ready.push_front(message);
                q.notify.notify_waiters();
            }
            Settle::Reject => self.dead_letter(&mut state, queue, message, DeathReason::Rejected),
        }
    }
}

enum Settle {
    Ack,
    Requeue,
    Reject,
}

#[async_trait]
impl Broker for MemoryBroker {
    fn identifier(&self) -> &str {
        "memory"
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        self.inner.state.lock().exchanges.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let mut state = self.inner.state.lock();
        state
            .queues
            .entry(spec.name.clone())
            .and_modify(|q| q.spec = spec.clone())
            .or_insert_with(|| QueueState {
                spec: spec.clone(),
                ready: VecDeque::new(),
                unacked: 0,
                acked: 0,
                notify: Arc::new(Notify::new()),
            });
        Ok(())
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<()> {
        let mut state = self.inner.state.lock();
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(BrokerError::NotFound { kind: "exchange", name: binding.exchange.clone() });
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(BrokerError::NotFound { kind: "queue", name: binding.queue.clone() });
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    fn set_confirm_listener(&self, listener: Arc<dyn ConfirmListener>) {
        *self.inner.confirm_listener.write() = Some(listener);
    }

    fn set_return_listener(&self, listener: Arc<dyn ReturnListener>) {
        *self.inner.return_listener.write() = Some(listener);
    }

    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        self.inner.publish_attempts.fetch_add(1, Ordering::SeqCst);
        if self.take_injected_failure() {
            return Err(BrokerError::Connection("connection refused".to_string()));
        }

        let outcome = {
            let mut state = self.inner.state.lock();
            match Inner::resolve(&state, &message.exchange, &message.routing_key, 0) {
                None => PublishOutcome::UnknownExchange,
                Some((queues, matched_directly)) => {
                    let stored = StoredMessage {
                        seq: self.inner.next_seq(),
                        exchange: message.exchange.clone(),
                        routing_key: message.routing_key.clone(),
                        message_id: message.message_id.clone(),
                        payload: message.payload.clone(),
                        headers: message.headers.clone(),
                        redelivered: false,
                    };
                    for queue in &queues {
                        self.inner.enqueue(&mut state, queue, stored.clone());
                    }
                    PublishOutcome::Routed { returned: message.mandatory && !matched_directly }
                }
            }
        };

        let (confirm, returned) = match outcome {
            PublishOutcome::UnknownExchange => (
                Confirm::Nack {
                    reason: format!("NOT_FOUND - no exchange '{}' in vhost '/'", message.exchange),
                },
                None,
            ),
            PublishOutcome::Routed { returned } => (
                Confirm::Ack,
                returned.then(|| ReturnedMessage {
                    message_id: message.message_id.clone(),
                    correlation_id: message.correlation_id.clone(),
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    reply_code: NO_ROUTE,
                    reply_text: "NO_ROUTE".to_string(),
                    payload: message.payload.clone(),
                }),
            ),
        };

        // Returns precede the confirm for the same publish, as on the wire.
        let confirm_listener = self.inner.confirm_listener.read().clone();
        let return_listener = self.inner.return_listener.read().clone();
        let correlation_id = message.correlation_id;
        tokio::spawn(async move {
            if let (Some(listener), Some(returned)) = (return_listener, returned) {
                listener.on_return(returned).await;
            }
            if let Some(listener) = confirm_listener {
                listener.on_confirm(&correlation_id, confirm).await;
            }
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<Box<dyn DeliveryStream>> {
        let notify = self
            .inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| Arc::clone(&q.notify))
            .ok_or_else(|| BrokerError::NotFound { kind: "queue", name: queue.to_string() })?;

        debug!(queue = %queue, consumer_tag = %consumer_tag, prefetch, "Consumer registered");
        Ok(Box::new(MemoryConsumer {
            inner: Arc::clone(&self.inner),
            queue: queue.to_string(),
            tag: consumer_tag.to_string(),
            prefetch: usize::from(prefetch.max(1)),
            notify,
            unacked: Mutex::new(HashMap::new()),
            cancelled: AtomicBool::new(false),
        }))
    }
}

struct MemoryConsumer {
    inner: Arc<Inner>,
    queue: String,
    tag: String,
    prefetch: usize,
    notify: Arc<Notify>,
    unacked: Mutex<HashMap<u64, StoredMessage>>,
    cancelled: AtomicBool,
}

impl MemoryConsumer {
    fn take_unacked(&self, delivery_tag: u64) -> Result<StoredMessage> {
        self.unacked
            .lock()
            .remove(&delivery_tag)
            .ok_or_else(|| BrokerError::Channel(format!("unknown delivery tag {}", delivery_tag)))
    }

    fn requeue_unacked(&self) {
        let mut pending: Vec<(u64, StoredMessage)> = self.unacked.lock().drain().collect();
        // push_front in reverse so the original order is kept
        pending.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, message) in pending {
            self.inner.settle(&self.queue, message, Settle::Requeue);
        }
    }
}

#[async_trait]
impl DeliveryStream for MemoryConsumer {
    fn consumer_tag(&self) -> &str {
        &self.tag
    }

    async fn next(&mut self) -> Option<Delivery> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.cancelled.load(Ordering::SeqCst) {
                return None;
            }
            if self.unacked.lock().len() < self.prefetch {
                if let Some(message) = self.inner.take(&self.queue) {
                    let tag = self.inner.next_delivery_tag.fetch_add(1, Ordering::SeqCst);
                    let delivery = message.to_delivery(tag);
                    self.unacked.lock().insert(tag, message);
                    return Some(delivery);
                }
            }
            notified.await;
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let message = self.take_unacked(delivery_tag)?;
        self.inner.settle(&self.queue, message, Settle::Ack);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let message = self.take_unacked(delivery_tag)?;
        let outcome = if requeue { Settle::Requeue } else { Settle::Reject };
        self.inner.settle(&self.queue, message, outcome);
        Ok(())
    }

    async fn cancel(&self) -> Result<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        self.requeue_unacked();
        self.notify.notify_waiters();
        debug!(queue = %self.queue, consumer_tag = %self.tag, "Consumer cancelled");
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        // A closed channel hands its unacked deliveries back to the queue.
        self.requeue_unacked();
    }
}
