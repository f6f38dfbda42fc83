//! Consumers for the relay topology
//!
//! - [`PrimaryConsumer`]: processes the main queue with a worker pool,
//!   delaying failures through the retry queue and dead-lettering them once
//!   the retry budget is spent
//! - [`DeadLetterConsumer`]: records everything that lands in the DLQ
//! - [`UnroutedConsumer`]: captures messages salvaged by the alternate
//!   exchange, optionally repairing their routing key
//!
//! All three run on [`ConsumerGroup`]: one task per worker, each with its own
//! delivery stream, stopped through a broadcast shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use relay_broker::{Broker, BrokerError, Delivery, DeliveryStream};
use relay_common::Message;

pub mod dead_letter;
pub mod primary;
pub mod unrouted;

pub use dead_letter::DeadLetterConsumer;
pub use primary::{ConsumeOutcome, PrimaryConsumer, PrimarySettings};
pub use unrouted::{RepairStrategy, SubstringRepair, UnroutedCapture, UnroutedConsumer, UnroutedOutcome};

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Failed to start consumer on {queue}: {source}")]
    Subscribe {
        queue: String,
        #[source]
        source: BrokerError,
    },
}

pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Application logic run for each primary-queue message. An error sends the
/// message down the retry path.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: &Message) -> anyhow::Result<()>;
}

/// Handles one delivery and settles it on the stream it came from.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, stream: &dyn DeliveryStream, delivery: Delivery);
}

/// Running workers of one consumer.
pub struct ConsumerGroup {
    name: String,
    shutdown_tx: broadcast::Sender<()>,
    workers: Vec<JoinHandle<()>>,
}

impl ConsumerGroup {
    /// Subscribe `concurrency` streams to `queue` and start a worker on each.
    pub async fn start(
        name: &str,
        broker: &Arc<dyn Broker>,
        queue: &str,
        concurrency: u32,
        prefetch: u16,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut workers = Vec::with_capacity(concurrency as usize);

        for n in 0..concurrency.max(1) {
            let tag = format!("{}-{}", name, n);
            let stream = broker
                .consume(queue, &tag, prefetch)
                .await
                .map_err(|source| ConsumerError::Subscribe { queue: queue.to_string(), source })?;
            let shutdown_rx = shutdown_tx.subscribe();
            workers.push(tokio::spawn(run_worker(stream, Arc::clone(&handler), shutdown_rx)));
        }

        info!(consumer = %name, queue = %queue, workers = workers.len(), prefetch, "Consumer started");
        Ok(Self { name: name.to_string(), shutdown_tx, workers })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop pulling new deliveries and wait for in-flight ones to be settled.
    /// Returns false if the workers did not finish within `timeout`.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        let _ = self.shutdown_tx.send(());
        let name = self.name;
        let drained = tokio::time::timeout(timeout, async {
            for worker in self.workers {
                if let Err(e) = worker.await {
                    warn!(consumer = %name, error = %e, "Consumer worker ended abnormally");
                }
            }
        })
        .await
        .is_ok();

        if drained {
            info!(consumer = %name, "Consumer drained");
        } else {
            warn!(consumer = %name, timeout_secs = timeout.as_secs(), "Consumer drain timed out");
        }
        drained
    }
}

async fn run_worker(
    mut stream: Box<dyn DeliveryStream>,
    handler: Arc<dyn DeliveryHandler>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => None,
            delivery = stream.next() => delivery,
        };
        let Some(delivery) = delivery else { break };
        handler.handle(stream.as_ref(), delivery).await;
    }

    if let Err(e) = stream.cancel().await {
        warn!(consumer_tag = %stream.consumer_tag(), error = %e, "Failed to cancel consumer");
    }
    debug!(consumer_tag = %stream.consumer_tag(), "Worker stopped");
}

/// Ack, logging rather than propagating a failure.
pub(crate) async fn ack(stream: &dyn DeliveryStream, delivery: &Delivery) {
    if let Err(e) = stream.ack(delivery.delivery_tag).await {
        warn!(delivery_tag = delivery.delivery_tag, error = %e, "Ack failed");
    }
}

pub(crate) async fn nack(stream: &dyn DeliveryStream, delivery: &Delivery, requeue: bool) {
    if let Err(e) = stream.nack(delivery.delivery_tag, requeue).await {
        warn!(delivery_tag = delivery.delivery_tag, requeue, error = %e, "Nack failed");
    }
}
