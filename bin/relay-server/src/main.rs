//! Message Relay Server
//!
//! Declares the broker topology, starts the primary, dead-letter and
//! unrouted consumers, and serves the HTTP API plus a Prometheus endpoint.
//!
//! Without `broker.uri` (or `RELAY_BROKER_URI`) everything runs against the
//! in-process broker. Build with `--features amqp` to talk to RabbitMQ.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use relay_api::{create_router, AppState};
use relay_broker::{Broker, MemoryBroker};
use relay_common::Message;
use relay_config::{LogFormat, RelayConfig};
use relay_consumer::{DeadLetterConsumer, MessageProcessor, PrimaryConsumer, PrimarySettings, UnroutedConsumer};
use relay_publisher::{LogAlertNotifier, PublisherSettings, ResilientPublisher};
use relay_store::{FailureStore, IdempotencyGuard, InMemoryFailureStore};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayConfig::load().context("Failed to load configuration")?;
    init_tracing(config.logging.format);

    info!("Starting Message Relay");

    // 1. Broker and topology
    let broker = connect_broker(&config).await?;
    broker
        .declare_topology(&config.topology)
        .await
        .context("Failed to declare broker topology")?;

    // 2. Metrics recorder, installed before any counter is touched
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    // 3. Store, publisher, idempotency
    let store: Arc<dyn FailureStore> = Arc::new(InMemoryFailureStore::with_max_retry_count(
        config.store.max_retry_count,
    ));
    let publisher = Arc::new(ResilientPublisher::new(
        Arc::clone(&broker),
        Arc::clone(&store),
        Arc::new(LogAlertNotifier),
        PublisherSettings::from(&config),
    ));
    let guard = Arc::new(IdempotencyGuard::new(
        config.idempotency.ttl(),
        config.idempotency.max_entries,
    ));

    // 4. Consumers
    let primary = Arc::new(PrimaryConsumer::new(
        Arc::clone(&publisher),
        Arc::new(DemoProcessor),
        guard,
        PrimarySettings::from(&config),
    ))
    .start(&broker)
    .await?;

    let dead_letter = Arc::new(DeadLetterConsumer::new(
        Arc::clone(&store),
        config.topology.dead_letter_queue.clone(),
    ))
    .start(&broker, config.consumer.prefetch)
    .await?;

    let unrouted_consumer = Arc::new(UnroutedConsumer::from_config(
        Arc::clone(&publisher),
        config.topology.unrouted_queue.clone(),
        &config.unrouted,
    ));
    let unrouted = Arc::clone(&unrouted_consumer)
        .start(&broker, config.consumer.prefetch)
        .await?;

    // 5. Metrics endpoint
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.http.metrics_port));
    let metrics_task = tokio::spawn(serve_metrics(metrics_addr, prometheus));

    // 6. HTTP API
    let state = AppState::new(publisher, store).with_unrouted(unrouted_consumer);
    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API listener on {}", addr))?;
    info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    info!("Shutdown signal received, draining consumers...");

    // Graceful shutdown: every group gets the full drain window.
    let drain = config.consumer.drain_timeout();
    let (primary_ok, dead_letter_ok, unrouted_ok) = tokio::join!(
        primary.shutdown(drain),
        dead_letter.shutdown(drain),
        unrouted.shutdown(drain),
    );
    if !(primary_ok && dead_letter_ok && unrouted_ok) {
        warn!("Some consumers did not drain before the timeout");
    }

    metrics_task.abort();
    info!("Message Relay shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    match format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn connect_broker(config: &RelayConfig) -> Result<Arc<dyn Broker>> {
    match config.broker.uri.as_deref() {
        #[cfg(feature = "amqp")]
        Some(uri) => {
            let broker = relay_broker::amqp::AmqpBroker::connect(uri)
                .await
                .context("Failed to connect to AMQP broker")?;
            Ok(Arc::new(broker))
        }
        #[cfg(not(feature = "amqp"))]
        Some(_) => {
            warn!("broker.uri is set but this build has no AMQP support, using the in-process broker");
            Ok(Arc::new(MemoryBroker::new()))
        }
        None => {
            info!("No broker URI configured, using the in-process broker");
            Ok(Arc::new(MemoryBroker::new()))
        }
    }
}

async fn serve_metrics(addr: SocketAddr, handle: PrometheusHandle) {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "Failed to bind metrics listener");
            return;
        }
    };
    info!(%addr, "Metrics server listening");
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "Metrics server error");
    }
}

/// Fails any message whose content mentions an error or exception, which
/// drives it through the retry and dead-letter path.
struct DemoProcessor;

#[async_trait]
impl MessageProcessor for DemoProcessor {
    async fn process(&self, message: &Message) -> anyhow::Result<()> {
        let content = message.content.to_lowercase();
        if content.contains("error") || content.contains("exception") {
            anyhow::bail!("Simulated processing failure for message {}", message.id);
        }
        info!(message_id = %message.id, content = %message.content, "Processing message");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
