//! Send endpoints

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tracing::info;

use relay_common::topology::WRONG_ROUTING_KEY;
use relay_common::Message;
use relay_publisher::RetryOutcome;

use crate::error::{ApiError, ApiResult};
use crate::model::{BatchQuery, BatchRequest, BatchResponse, MessageResponse, SendRequest, MAX_BATCH_SIZE};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/send", post(send))
        .route("/send-with-retry", post(send_with_retry))
        .route("/send-with-confirm", post(send_with_confirm))
        .route("/send-batch", post(send_batch))
        .route("/send-wrong-routing", post(send_wrong_routing))
        .route("/send-error", post(send_error))
}

async fn send(State(state): State<AppState>, Json(req): Json<SendRequest>) -> Json<MessageResponse> {
    let message = Message::new(req.content);
    let handle = state.publisher.send(&message).await;
    Json(MessageResponse::ok(handle.message_id(), "Message sent, awaiting confirm"))
}

async fn send_with_retry(
    State(state): State<AppState>,
    Json(req): Json<SendRequest>,
) -> (StatusCode, Json<MessageResponse>) {
    let message = Message::new(req.content);
    match state.publisher.send_with_retry(&message).await {
        RetryOutcome::Delivered { message_id, attempts } => (
            StatusCode::OK,
            Json(MessageResponse::ok(message_id, format!("Message sent after {} attempt(s)", attempts))),
        ),
        RetryOutcome::Failed { message_id, attempts, error } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(MessageResponse::failed(
                message_id,
                format!("Send failed after {} attempts, recorded as failed message: {}", attempts, error),
            )),
        ),
    }
}

async fn send_with_confirm(
    State(state): State<AppState>,
    Json(req): Json<SendRequest>,
) -> (StatusCode, Json<MessageResponse>) {
    let message = Message::new(req.content);
    if state.publisher.send_and_confirm(&message).await {
        (StatusCode::OK, Json(MessageResponse::ok(message.id, "Message confirmed by broker")))
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(MessageResponse::failed(message.id, "Message was not confirmed by broker")),
        )
    }
}

async fn send_batch(
    State(state): State<AppState>,
    Query(query): Query<BatchQuery>,
    body: Option<Json<BatchRequest>>,
) -> ApiResult<BatchResponse> {
    let contents = match body {
        Some(Json(req)) if !req.contents.is_empty() => req.contents,
        _ => {
            if query.count > MAX_BATCH_SIZE {
                return Err(ApiError::BadRequest(format!("count must be at most {}", MAX_BATCH_SIZE)));
            }
            (1..=query.count).map(|i| format!("Batch message #{}", i)).collect()
        }
    };
    if contents.len() > MAX_BATCH_SIZE {
        return Err(ApiError::BadRequest(format!("at most {} contents per batch", MAX_BATCH_SIZE)));
    }
    let messages: Vec<Message> = contents.into_iter().map(Message::new).collect();

    let handles = state.publisher.send_batch(&messages).await;
    let message_ids: Vec<String> = handles.iter().map(|h| h.message_id().to_string()).collect();
    info!(count = message_ids.len(), "Batch accepted");

    Ok(Json(BatchResponse {
        success: true,
        message: format!("{} messages sent, awaiting confirms", message_ids.len()),
        message_ids,
    }))
}

async fn send_wrong_routing(State(state): State<AppState>) -> Json<MessageResponse> {
    let message = Message::new("Message with an unroutable key");
    let handle = state.publisher.send_to_routing_key(&message, WRONG_ROUTING_KEY).await;
    Json(MessageResponse::ok(
        handle.message_id(),
        format!("Message sent with routing key '{}', expect a routing failure", WRONG_ROUTING_KEY),
    ))
}

async fn send_error(State(state): State<AppState>, body: Option<Json<SendRequest>>) -> Json<MessageResponse> {
    let content = match body {
        Some(Json(req)) => format!("ERROR: {}", req.content),
        None => "ERROR: message that fails processing".to_string(),
    };
    let message = Message::new(content);
    let handle = state.publisher.send(&message).await;
    Json(MessageResponse::ok(handle.message_id(), "Error test message sent"))
}
