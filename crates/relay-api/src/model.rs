//! Request and response bodies

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use relay_common::{FailedMessageRecord, FailureStatistics};

#[derive(Debug, Deserialize, ToSchema)]
pub struct SendRequest {
    pub content: String,
}

/// Either explicit contents, or `count` generated messages.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct BatchRequest {
    #[serde(default)]
    pub contents: Vec<String>,
}

/// Largest batch one request may send.
pub const MAX_BATCH_SIZE: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct BatchQuery {
    #[serde(default = "default_batch_count")]
    pub count: usize,
}

fn default_batch_count() -> usize {
    5
}

/// Standard send result
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub message: String,
}

impl MessageResponse {
    pub fn ok(message_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self { success: true, message_id: Some(message_id.into()), message: message.into() }
    }

    pub fn failed(message_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self { success: false, message_id: Some(message_id.into()), message: message.into() }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub success: bool,
    pub message_ids: Vec<String>,
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct FailureQuery {
    pub stage: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatisticsQuery {
    pub stage: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RetryBatchQuery {
    pub limit: Option<usize>,
}

/// Listing with the statistics of the same record set
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureListResponse {
    pub total: usize,
    pub statistics: FailureStatistics,
    pub messages: Vec<FailedMessageRecord>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub resolved_by: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BatchRetryResponse {
    pub success: bool,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}
