//! Failed-message administration endpoints

use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};

use relay_common::{FailedMessageRecord, FailureStage, FailureStatistics, FailureStatus};
use relay_publisher::{RetryReport, DEFAULT_BATCH_LIMIT};

use crate::error::{ApiError, ApiResult};
use crate::model::{
    BatchRetryResponse, FailureListResponse, FailureQuery, ResolveRequest, RetryBatchQuery,
    StatisticsQuery,
};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_failures))
        .route("/pending", get(list_pending))
        .route("/statistics", get(statistics))
        .route("/retry-batch", post(retry_batch))
        .route("/:id", get(get_failure).delete(delete_failure))
        .route("/:id/retry", post(retry_failure))
        .route("/:id/resolve", post(resolve_failure))
}

fn parse<T: FromStr<Err = String>>(value: &str) -> Result<T, ApiError> {
    value.parse().map_err(ApiError::BadRequest)
}

async fn list_failures(
    State(state): State<AppState>,
    Query(query): Query<FailureQuery>,
) -> ApiResult<FailureListResponse> {
    // Validate everything before touching the store.
    let stage = query.stage.as_deref().map(parse::<FailureStage>).transpose()?;
    let status = query.status.as_deref().map(parse::<FailureStatus>).transpose()?;

    let messages = match (stage, status) {
        (Some(stage), Some(status)) => state.store.list_by_stage_and_status(stage, status).await?,
        (Some(stage), None) => state.store.list_by_stage(stage).await?,
        (None, Some(status)) => state
            .store
            .list()
            .await?
            .into_iter()
            .filter(|r| r.status == status)
            .collect(),
        (None, None) => state.store.list().await?,
    };

    Ok(Json(FailureListResponse {
        total: messages.len(),
        statistics: FailureStatistics::from_records(&messages),
        messages,
    }))
}

async fn list_pending(State(state): State<AppState>) -> ApiResult<Vec<FailedMessageRecord>> {
    Ok(Json(state.store.list_pending().await?))
}

async fn statistics(
    State(state): State<AppState>,
    Query(query): Query<StatisticsQuery>,
) -> ApiResult<FailureStatistics> {
    let stats = match query.stage.as_deref() {
        Some(stage) => state.store.statistics_by_stage(parse(stage)?).await?,
        None => state.store.statistics().await?,
    };
    Ok(Json(stats))
}

async fn get_failure(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<FailedMessageRecord> {
    state
        .store
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Failed message not found: {}", id)))
}

async fn delete_failure(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<serde_json::Value> {
    state.recovery.delete(&id).await?;
    Ok(Json(serde_json::json!({ "success": true, "message": "Failed message deleted" })))
}

async fn retry_failure(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<RetryReport> {
    Ok(Json(state.recovery.retry_one(&id).await?))
}

async fn retry_batch(
    State(state): State<AppState>,
    Query(query): Query<RetryBatchQuery>,
) -> ApiResult<BatchRetryResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_BATCH_LIMIT);
    let summary = state.recovery.retry_batch(limit).await?;
    Ok(Json(BatchRetryResponse {
        success: true,
        total: summary.total,
        succeeded: summary.succeeded,
        failed: summary.failed,
    }))
}

async fn resolve_failure(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResolveRequest>,
) -> ApiResult<FailedMessageRecord> {
    if req.resolved_by.trim().is_empty() {
        return Err(ApiError::BadRequest("resolvedBy must not be empty".to_string()));
    }
    Ok(Json(state.recovery.resolve(&id, &req.resolved_by, req.note).await?))
}
