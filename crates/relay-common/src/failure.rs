//! Failed message records and their status machine.
//!
//! A record is created by the publisher (publish stage) or the dead-letter
//! consumer (consume stage) and afterwards only changes through the
//! `mark_*` transitions below. Each transition validates before it mutates,
//! so a rejected transition leaves the record untouched.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_RETRY_COUNT: u32 = 3;

// ============================================================================
// Taxonomy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Publish,
    Consume,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Publish => "publish",
            FailureStage::Consume => "consume",
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "publish" => Ok(FailureStage::Publish),
            "consume" => Ok(FailureStage::Consume),
            _ => Err(format!("Invalid failure stage: '{}'. Expected publish or consume", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    /// Accepted at the exchange, no queue matched
    RoutingFailed,
    /// Never reached the exchange
    ConfirmFailed,
    /// Transient send error, retries exhausted
    SendFailedAfterRetry,
    /// Unclassified processing failure
    ConsumeFailed,
    /// Application rejected the message
    BusinessError,
    /// Aged out of a queue
    MessageExpired,
    /// Queue length limit exceeded
    QueueOverflow,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::RoutingFailed => "ROUTING_FAILED",
            FailureType::ConfirmFailed => "CONFIRM_FAILED",
            FailureType::SendFailedAfterRetry => "SEND_FAILED_AFTER_RETRY",
            FailureType::ConsumeFailed => "CONSUME_FAILED",
            FailureType::BusinessError => "BUSINESS_ERROR",
            FailureType::MessageExpired => "MESSAGE_EXPIRED",
            FailureType::QueueOverflow => "QUEUE_OVERFLOW",
        }
    }

    /// The stage this failure type naturally belongs to.
    pub fn stage(&self) -> FailureStage {
        match self {
            FailureType::RoutingFailed
            | FailureType::ConfirmFailed
            | FailureType::SendFailedAfterRetry => FailureStage::Publish,
            FailureType::ConsumeFailed
            | FailureType::BusinessError
            | FailureType::MessageExpired
            | FailureType::QueueOverflow => FailureStage::Consume,
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ROUTING_FAILED" => Ok(FailureType::RoutingFailed),
            "CONFIRM_FAILED" => Ok(FailureType::ConfirmFailed),
            "SEND_FAILED_AFTER_RETRY" => Ok(FailureType::SendFailedAfterRetry),
            "CONSUME_FAILED" => Ok(FailureType::ConsumeFailed),
            "BUSINESS_ERROR" => Ok(FailureType::BusinessError),
            "MESSAGE_EXPIRED" => Ok(FailureType::MessageExpired),
            "QUEUE_OVERFLOW" => Ok(FailureType::QueueOverflow),
            _ => Err(format!("Invalid failure type: '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureStatus {
    Pending,
    Retrying,
    RetrySuccess,
    RetryExhausted,
    ManuallyResolved,
}

impl FailureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStatus::Pending => "PENDING",
            FailureStatus::Retrying => "RETRYING",
            FailureStatus::RetrySuccess => "RETRY_SUCCESS",
            FailureStatus::RetryExhausted => "RETRY_EXHAUSTED",
            FailureStatus::ManuallyResolved => "MANUALLY_RESOLVED",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailureStatus::RetrySuccess | FailureStatus::ManuallyResolved)
    }
}

impl fmt::Display for FailureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(FailureStatus::Pending),
            "RETRYING" => Ok(FailureStatus::Retrying),
            "RETRY_SUCCESS" => Ok(FailureStatus::RetrySuccess),
            "RETRY_EXHAUSTED" => Ok(FailureStatus::RetryExhausted),
            "MANUALLY_RESOLVED" => Ok(FailureStatus::ManuallyResolved),
            _ => Err(format!("Invalid failure status: '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("cannot move record from {from} to {to}")]
    Invalid { from: FailureStatus, to: FailureStatus },

    #[error("retry limit reached ({retry_count}/{max_retry_count})")]
    RetryLimitReached { retry_count: u32, max_retry_count: u32 },
}

// ============================================================================
// Records
// ============================================================================

/// Everything needed to create a record. The store fills in id, status and
/// timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFailure {
    pub message_id: Option<String>,
    pub message_body: String,
    pub exchange: String,
    pub routing_key: String,
    pub reply_code: Option<u16>,
    pub reply_text: Option<String>,
    pub failure_type: FailureType,
    pub failure_stage: FailureStage,
}

impl NewFailure {
    /// Stage defaults to the failure type's natural stage.
    pub fn new(
        failure_type: FailureType,
        message_body: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            message_id: None,
            message_body: message_body.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            reply_code: None,
            reply_text: None,
            failure_type,
            failure_stage: failure_type.stage(),
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_reply(mut self, reply_code: Option<u16>, reply_text: impl Into<String>) -> Self {
        self.reply_code = reply_code;
        self.reply_text = Some(reply_text.into());
        self
    }

    pub fn with_stage(mut self, stage: FailureStage) -> Self {
        self.failure_stage = stage;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedMessageRecord {
    pub id: String,
    pub message_id: Option<String>,
    pub message_body: String,
    pub exchange: String,
    pub routing_key: String,
    pub reply_code: Option<u16>,
    pub reply_text: Option<String>,
    pub failure_stage: FailureStage,
    pub failure_type: FailureType,
    pub failure_time: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retry_count: u32,
    pub last_retry_time: Option<DateTime<Utc>>,
    pub status: FailureStatus,
    pub resolved_time: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub note: Option<String>,
}

impl FailedMessageRecord {
    pub fn new(failure: NewFailure, max_retry_count: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_id: failure.message_id,
            message_body: failure.message_body,
            exchange: failure.exchange,
            routing_key: failure.routing_key,
            reply_code: failure.reply_code,
            reply_text: failure.reply_text,
            failure_stage: failure.failure_stage,
            failure_type: failure.failure_type,
            failure_time: now,
            retry_count: 0,
            max_retry_count,
            last_retry_time: None,
            status: FailureStatus::Pending,
            resolved_time: None,
            resolved_by: None,
            note: None,
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        self.status == FailureStatus::RetryExhausted || self.retry_count >= self.max_retry_count
    }

    /// PENDING -> RETRYING, consuming one retry.
    pub fn mark_retrying(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.expect_status(&[FailureStatus::Pending], FailureStatus::Retrying)?;
        if self.retry_count >= self.max_retry_count {
            return Err(TransitionError::RetryLimitReached {
                retry_count: self.retry_count,
                max_retry_count: self.max_retry_count,
            });
        }
        self.status = FailureStatus::Retrying;
        self.retry_count += 1;
        self.last_retry_time = Some(now);
        Ok(())
    }

    /// RETRYING -> RETRY_SUCCESS
    pub fn mark_retry_success(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.expect_status(&[FailureStatus::Retrying], FailureStatus::RetrySuccess)?;
        self.status = FailureStatus::RetrySuccess;
        self.resolved_time = Some(now);
        Ok(())
    }

    /// RETRYING -> PENDING while retries remain, RETRY_EXHAUSTED otherwise.
    pub fn mark_retry_failed(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        let next = if self.retry_count >= self.max_retry_count {
            FailureStatus::RetryExhausted
        } else {
            FailureStatus::Pending
        };
        self.expect_status(&[FailureStatus::Retrying], next)?;
        self.status = next;
        self.note = Some(reason.into());
        Ok(())
    }

    /// PENDING or RETRY_EXHAUSTED -> MANUALLY_RESOLVED
    pub fn mark_manually_resolved(
        &mut self,
        resolved_by: impl Into<String>,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.expect_status(
            &[FailureStatus::Pending, FailureStatus::RetryExhausted],
            FailureStatus::ManuallyResolved,
        )?;
        self.status = FailureStatus::ManuallyResolved;
        self.resolved_time = Some(now);
        self.resolved_by = Some(resolved_by.into());
        if note.is_some() {
            self.note = note;
        }
        Ok(())
    }

    fn expect_status(&self, allowed: &[FailureStatus], to: FailureStatus) -> Result<(), TransitionError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(TransitionError::Invalid { from: self.status, to })
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Point-in-time counts over a set of records. Derived, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureStatistics {
    pub total: u64,
    pub pending: u64,
    pub retrying: u64,
    pub retry_success: u64,
    pub retry_exhausted: u64,
    pub manually_resolved: u64,
    pub publish_failures: u64,
    pub consume_failures: u64,
}

impl FailureStatistics {
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a FailedMessageRecord>,
    {
        let mut stats = Self::default();
        for record in records {
            stats.total += 1;
            match record.status {
                FailureStatus::Pending => stats.pending += 1,
                FailureStatus::Retrying => stats.retrying += 1,
                FailureStatus::RetrySuccess => stats.retry_success += 1,
                FailureStatus::RetryExhausted => stats.retry_exhausted += 1,
                FailureStatus::ManuallyResolved => stats.manually_resolved += 1,
            }
            match record.failure_stage {
                FailureStage::Publish => stats.publish_failures += 1,
                FailureStage::Consume => stats.consume_failures += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> FailedMessageRecord {
        let failure = NewFailure::new(FailureType::RoutingFailed, "{}", "demo.exchange", "wrong.routing.key");
        FailedMessageRecord::new(failure, DEFAULT_MAX_RETRY_COUNT, Utc::now())
    }

    #[test]
    fn test_new_record_is_pending() {
        let r = record();
        assert_eq!(r.status, FailureStatus::Pending);
        assert_eq!(r.retry_count, 0);
        assert_eq!(r.max_retry_count, 3);
        assert_eq!(r.failure_stage, FailureStage::Publish);
    }

    #[test]
    fn test_retry_cycle_until_exhausted() {
        let mut r = record();
        for attempt in 1..=3 {
            r.mark_retrying(Utc::now()).unwrap();
            assert_eq!(r.retry_count, attempt);
            r.mark_retry_failed("still broken").unwrap();
        }
        assert_eq!(r.status, FailureStatus::RetryExhausted);
        assert_eq!(r.note.as_deref(), Some("still broken"));

        let err = r.mark_retrying(Utc::now()).unwrap_err();
        assert!(matches!(err, TransitionError::Invalid { .. }));
        assert!(r.retry_count <= r.max_retry_count);
    }

    #[test]
    fn test_retry_limit_checked_on_pending_record() {
        let mut r = record();
        r.retry_count = r.max_retry_count;

        let err = r.mark_retrying(Utc::now()).unwrap_err();
        assert_eq!(err, TransitionError::RetryLimitReached { retry_count: 3, max_retry_count: 3 });
        assert_eq!(r.status, FailureStatus::Pending);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut r = record();
        r.mark_retrying(Utc::now()).unwrap();
        r.mark_retry_success(Utc::now()).unwrap();
        assert!(r.status.is_terminal());
        assert!(r.resolved_time.is_some());

        let before = r.clone();
        assert!(r.mark_manually_resolved("ops", None, Utc::now()).is_err());
        assert!(r.mark_retry_failed("x").is_err());
        assert_eq!(r, before);
    }

    #[test]
    fn test_exhausted_only_leaves_via_manual_resolution() {
        let mut r = record();
        r.max_retry_count = 1;
        r.mark_retrying(Utc::now()).unwrap();
        r.mark_retry_failed("boom").unwrap();
        assert_eq!(r.status, FailureStatus::RetryExhausted);

        assert!(r.mark_retry_success(Utc::now()).is_err());
        r.mark_manually_resolved("alice", Some("replayed by hand".into()), Utc::now()).unwrap();
        assert_eq!(r.status, FailureStatus::ManuallyResolved);
        assert_eq!(r.resolved_by.as_deref(), Some("alice"));
    }

    #[test]
    fn test_pending_can_be_resolved_directly() {
        let mut r = record();
        r.mark_manually_resolved("bob", None, Utc::now()).unwrap();
        assert_eq!(r.status, FailureStatus::ManuallyResolved);
    }

    #[test]
    fn test_retrying_cannot_be_resolved() {
        let mut r = record();
        r.mark_retrying(Utc::now()).unwrap();
        let err = r.mark_manually_resolved("bob", None, Utc::now()).unwrap_err();
        assert_eq!(err, TransitionError::Invalid {
            from: FailureStatus::Retrying,
            to: FailureStatus::ManuallyResolved,
        });
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("PUBLISH".parse::<FailureStage>().unwrap(), FailureStage::Publish);
        assert_eq!("consume".parse::<FailureStage>().unwrap(), FailureStage::Consume);
        assert!("bogus".parse::<FailureStage>().is_err());
        assert_eq!("queue_overflow".parse::<FailureType>().unwrap(), FailureType::QueueOverflow);
        assert_eq!("RETRY_EXHAUSTED".parse::<FailureStatus>().unwrap(), FailureStatus::RetryExhausted);
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let json = serde_json::to_value(record()).unwrap();
        assert_eq!(json["failureStage"], "publish");
        assert_eq!(json["failureType"], "ROUTING_FAILED");
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["routingKey"], "wrong.routing.key");
        assert_eq!(json["maxRetryCount"], 3);
    }

    #[test]
    fn test_statistics_split_by_stage() {
        let mut consume = record();
        consume.failure_stage = FailureStage::Consume;
        consume.status = FailureStatus::RetryExhausted;
        let records = vec![record(), record(), consume];

        let stats = FailureStatistics::from_records(&records);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.retry_exhausted, 1);
        assert_eq!(stats.publish_failures + stats.consume_failures, stats.total);
    }
}
