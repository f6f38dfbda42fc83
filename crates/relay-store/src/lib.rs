//! Failed message storage
//!
//! [`FailureStore`] is the seam between the reliability logic and whatever
//! holds failed-message records. The in-memory implementation is the
//! reference; a durable backend must provide the same contract:
//!
//! - create a record from a [`NewFailure`] and return its id
//! - read one record by id, or `None`
//! - list all records, records of one stage, records of one stage and
//!   status (all newest first), and pending records (oldest first)
//! - apply the four status transitions atomically per record, rejecting
//!   invalid ones without modifying the record
//! - delete by id, reporting whether anything was removed
//! - aggregate statistics overall and per stage
//!
//! Reads need only be point-in-time snapshots; writes to the same record
//! must not be lost.

use async_trait::async_trait;
use thiserror::Error;

use relay_common::{
    FailedMessageRecord, FailureStage, FailureStatistics, FailureStatus, NewFailure,
    TransitionError,
};

pub mod idempotency;
pub mod memory;

pub use idempotency::IdempotencyGuard;
pub use memory::InMemoryFailureStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed message not found: {id}")]
    NotFound { id: String },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait FailureStore: Send + Sync {
    /// Persist a new record in PENDING state, returning its id.
    async fn save(&self, failure: NewFailure) -> Result<String>;

    async fn get(&self, id: &str) -> Result<Option<FailedMessageRecord>>;

    /// All records, newest first.
    async fn list(&self) -> Result<Vec<FailedMessageRecord>>;

    /// Records of one stage, newest first.
    async fn list_by_stage(&self, stage: FailureStage) -> Result<Vec<FailedMessageRecord>>;

    /// Records of one stage in one status, newest first.
    async fn list_by_stage_and_status(
        &self,
        stage: FailureStage,
        status: FailureStatus,
    ) -> Result<Vec<FailedMessageRecord>>;

    /// PENDING records, oldest first.
    async fn list_pending(&self) -> Result<Vec<FailedMessageRecord>>;

    async fn mark_retrying(&self, id: &str) -> Result<FailedMessageRecord>;

    async fn mark_retry_success(&self, id: &str) -> Result<FailedMessageRecord>;

    async fn mark_retry_failed(&self, id: &str, reason: &str) -> Result<FailedMessageRecord>;

    async fn mark_manually_resolved(
        &self,
        id: &str,
        resolved_by: &str,
        note: Option<String>,
    ) -> Result<FailedMessageRecord>;

    async fn delete(&self, id: &str) -> Result<bool>;

    async fn statistics(&self) -> Result<FailureStatistics>;

    async fn statistics_by_stage(&self, stage: FailureStage) -> Result<FailureStatistics>;
}
