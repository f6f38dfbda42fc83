//! Alert notifications for terminal publish failures.
//!
//! Alerts are dispatched on their own task; a slow or failing notifier never
//! affects the publish outcome.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use relay_common::FailureType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub failure_type: FailureType,
    pub message_id: String,
    pub exchange: String,
    pub routing_key: String,
    pub detail: String,
    pub record_id: Option<String>,
}

#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Writes alerts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertNotifier;

#[async_trait]
impl AlertNotifier for LogAlertNotifier {
    async fn notify(&self, alert: &Alert) -> anyhow::Result<()> {
        warn!(
            failure_type = %alert.failure_type,
            message_id = %alert.message_id,
            exchange = %alert.exchange,
            routing_key = %alert.routing_key,
            record_id = ?alert.record_id,
            detail = %alert.detail,
            "ALERT: message publish failed"
        );
        Ok(())
    }
}

/// Fire-and-forget delivery of an alert.
pub fn dispatch(notifier: &Arc<dyn AlertNotifier>, alert: Alert) {
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&alert).await {
            error!(message_id = %alert.message_id, error = %e, "Failed to send alert");
        }
    });
}
