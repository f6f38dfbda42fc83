//! In-memory failure store backed by DashMap.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info};

use relay_common::{
    FailedMessageRecord, FailureStage, FailureStatistics, FailureStatus, NewFailure,
    TransitionError, DEFAULT_MAX_RETRY_COUNT,
};

use crate::{FailureStore, Result, StoreError};

pub struct InMemoryFailureStore {
    records: DashMap<String, FailedMessageRecord>,
    max_retry_count: u32,
}

impl Default for InMemoryFailureStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFailureStore {
    pub fn new() -> Self {
        Self::with_max_retry_count(DEFAULT_MAX_RETRY_COUNT)
    }

    pub fn with_max_retry_count(max_retry_count: u32) -> Self {
        Self {
            records: DashMap::new(),
            max_retry_count,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn snapshot<F>(&self, filter: F) -> Vec<FailedMessageRecord>
    where
        F: Fn(&FailedMessageRecord) -> bool,
    {
        self.records
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn newest_first(mut records: Vec<FailedMessageRecord>) -> Vec<FailedMessageRecord> {
        records.sort_by(|a, b| b.failure_time.cmp(&a.failure_time));
        records
    }

    /// Run a transition while holding the entry's shard lock.
    fn transition<F>(&self, id: &str, apply: F) -> Result<FailedMessageRecord>
    where
        F: FnOnce(&mut FailedMessageRecord) -> std::result::Result<(), TransitionError>,
    {
        let mut entry = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(id))?;
        apply(entry.value_mut())?;
        Ok(entry.value().clone())
    }
}

#[async_trait]
impl FailureStore for InMemoryFailureStore {
    async fn save(&self, failure: NewFailure) -> Result<String> {
        let record = FailedMessageRecord::new(failure, self.max_retry_count, Utc::now());
        let id = record.id.clone();
        info!(
            record_id = %id,
            message_id = ?record.message_id,
            failure_type = %record.failure_type,
            failure_stage = %record.failure_stage,
            "Failed message recorded"
        );
        self.records.insert(id.clone(), record);
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<FailedMessageRecord>> {
        Ok(self.records.get(id).map(|entry| entry.value().clone()))
    }

    async fn list(&self) -> Result<Vec<FailedMessageRecord>> {
        Ok(Self::newest_first(self.snapshot(|_| true)))
    }

    async fn list_by_stage(&self, stage: FailureStage) -> Result<Vec<FailedMessageRecord>> {
        Ok(Self::newest_first(self.snapshot(|r| r.failure_stage == stage)))
    }

    async fn list_by_stage_and_status(
        &self,
        stage: FailureStage,
        status: FailureStatus,
    ) -> Result<Vec<FailedMessageRecord>> {
        Ok(Self::newest_first(
            self.snapshot(|r| r.failure_stage == stage && r.status == status),
        ))
    }

    async fn list_pending(&self) -> Result<Vec<FailedMessageRecord>> {
        let mut records = self.snapshot(|r| r.status == FailureStatus::Pending);
        records.sort_by(|a, b| a.failure_time.cmp(&b.failure_time));
        Ok(records)
    }

    async fn mark_retrying(&self, id: &str) -> Result<FailedMessageRecord> {
        let record = self.transition(id, |r| r.mark_retrying(Utc::now()))?;
        info!(record_id = %id, retry_count = record.retry_count, "Failed message marked retrying");
        Ok(record)
    }

    async fn mark_retry_success(&self, id: &str) -> Result<FailedMessageRecord> {
        let record = self.transition(id, |r| r.mark_retry_success(Utc::now()))?;
        info!(record_id = %id, "Failed message retry succeeded");
        Ok(record)
    }

    async fn mark_retry_failed(&self, id: &str, reason: &str) -> Result<FailedMessageRecord> {
        let record = self.transition(id, |r| r.mark_retry_failed(reason))?;
        info!(
            record_id = %id,
            status = %record.status,
            remaining = record.max_retry_count.saturating_sub(record.retry_count),
            reason = %reason,
            "Failed message retry failed"
        );
        Ok(record)
    }

    async fn mark_manually_resolved(
        &self,
        id: &str,
        resolved_by: &str,
        note: Option<String>,
    ) -> Result<FailedMessageRecord> {
        let record = self.transition(id, |r| r.mark_manually_resolved(resolved_by, note, Utc::now()))?;
        info!(record_id = %id, resolved_by = %resolved_by, "Failed message manually resolved");
        Ok(record)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let removed = self.records.remove(id).is_some();
        debug!(record_id = %id, removed, "Delete failed message");
        Ok(removed)
    }

    async fn statistics(&self) -> Result<FailureStatistics> {
        Ok(FailureStatistics::from_records(&self.snapshot(|_| true)))
    }

    async fn statistics_by_stage(&self, stage: FailureStage) -> Result<FailureStatistics> {
        Ok(FailureStatistics::from_records(&self.snapshot(|r| r.failure_stage == stage)))
    }
}
