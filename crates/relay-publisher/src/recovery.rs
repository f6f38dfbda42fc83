//! Manual recovery of recorded failures.
//!
//! A retry resends the stored body: publish-stage records go back to the
//! exchange and routing key they failed on, consume-stage records to the
//! primary route. The outcome moves the record through the status machine.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use relay_common::{FailedMessageRecord, FailureStage, FailureStatus, Headers, Route, TransitionError};
use relay_store::{FailureStore, StoreError};

use crate::publisher::ResilientPublisher;

pub const DEFAULT_BATCH_LIMIT: usize = 10;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Failed message not found: {0}")]
    NotFound(String),

    #[error("Retries exhausted for failed message {id} ({retry_count}/{max_retry_count})")]
    RetriesExhausted { id: String, retry_count: u32, max_retry_count: u32 },

    #[error("Invalid state: {0}")]
    InvalidState(#[from] TransitionError),

    #[error("Store error: {0}")]
    Store(String),
}

impl From<StoreError> for RecoveryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { id } => RecoveryError::NotFound(id),
            StoreError::Transition(t) => RecoveryError::InvalidState(t),
            other => RecoveryError::Store(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RecoveryError>;

/// Result of one manual retry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryReport {
    pub id: String,
    pub success: bool,
    pub status: FailureStatus,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchRetryReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct RecoveryService {
    store: Arc<dyn FailureStore>,
    publisher: Arc<ResilientPublisher>,
}

impl RecoveryService {
    pub fn new(store: Arc<dyn FailureStore>, publisher: Arc<ResilientPublisher>) -> Self {
        Self { store, publisher }
    }

    pub async fn retry_one(&self, id: &str) -> Result<RetryReport> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| RecoveryError::NotFound(id.to_string()))?;

        if record.status == FailureStatus::RetryExhausted || record.retries_exhausted() {
            return Err(RecoveryError::RetriesExhausted {
                id: record.id,
                retry_count: record.retry_count,
                max_retry_count: record.max_retry_count,
            });
        }

        let record = self.store.mark_retrying(id).await?;
        let route = self.target_route(&record);
        let message_id = record.message_id.clone().unwrap_or_else(|| record.id.clone());

        info!(
            id = %record.id,
            message_id = %message_id,
            attempt = record.retry_count,
            exchange = %route.exchange,
            routing_key = %route.routing_key,
            "Retrying failed message"
        );

        let payload = Bytes::from(record.message_body.clone().into_bytes());
        match self.publisher.republish(&route, &message_id, payload, Headers::new()).await {
            Ok(()) => {
                let updated = self.store.mark_retry_success(id).await?;
                info!(id = %updated.id, "Failed message retried successfully");
                Ok(report(&updated, None))
            }
            Err(e) => {
                let reason = e.to_string();
                let updated = self.store.mark_retry_failed(id, &reason).await?;
                warn!(id = %updated.id, status = %updated.status, error = %reason, "Retry of failed message failed");
                Ok(report(&updated, Some(reason)))
            }
        }
    }

    /// Retry up to `limit` pending records, oldest first.
    pub async fn retry_batch(&self, limit: usize) -> Result<BatchRetryReport> {
        let pending = self.store.list_pending().await?;
        let mut summary = BatchRetryReport::default();

        for record in pending.into_iter().take(limit) {
            summary.total += 1;
            match self.retry_one(&record.id).await {
                Ok(r) if r.success => summary.succeeded += 1,
                Ok(_) => summary.failed += 1,
                Err(e) => {
                    warn!(id = %record.id, error = %e, "Skipping failed message in batch retry");
                    summary.failed += 1;
                }
            }
        }

        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Batch retry finished"
        );
        Ok(summary)
    }

    pub async fn resolve(&self, id: &str, resolved_by: &str, note: Option<String>) -> Result<FailedMessageRecord> {
        let record = self.store.mark_manually_resolved(id, resolved_by, note).await?;
        info!(id = %record.id, resolved_by = %resolved_by, "Failed message resolved manually");
        Ok(record)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        if self.store.delete(id).await? {
            Ok(())
        } else {
            Err(RecoveryError::NotFound(id.to_string()))
        }
    }

    fn target_route(&self, record: &FailedMessageRecord) -> Route {
        match record.failure_stage {
            FailureStage::Publish => Route::new(record.exchange.clone(), record.routing_key.clone()),
            FailureStage::Consume => self.publisher.primary_route().clone(),
        }
    }
}

fn report(record: &FailedMessageRecord, error: Option<String>) -> RetryReport {
    RetryReport {
        id: record.id.clone(),
        success: error.is_none(),
        status: record.status,
        retry_count: record.retry_count,
        error,
    }
}
