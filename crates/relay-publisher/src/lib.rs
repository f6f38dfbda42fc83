//! Publishing side of the relay
//!
//! - [`ResilientPublisher`]: confirm tracking, return recording and
//!   send-path retry with exponential backoff
//! - [`RetryPolicy`]: the backoff schedule
//! - [`AlertNotifier`]: fire-and-forget alerts for recorded failures
//! - [`RecoveryService`]: manual retry and resolution of recorded failures

pub mod alert;
pub mod publisher;
pub mod recovery;
pub mod retry;

pub use alert::{Alert, AlertNotifier, LogAlertNotifier};
pub use publisher::{
    PublishError, PublisherSettings, ResilientPublisher, RetryOutcome, SendHandle, SendOutcome,
};
pub use recovery::{BatchRetryReport, RecoveryError, RecoveryService, RetryReport, DEFAULT_BATCH_LIMIT};
pub use retry::RetryPolicy;
