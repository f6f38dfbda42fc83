//! HTTP API
//!
//! Thin pass-through over the publisher, the failure store and the recovery
//! service:
//! - `/api/messages/*`: send operations
//! - `/api/failures/*`: list, inspect, retry, resolve and delete failures
//! - `/api/unrouted/recent`: recent captures of the unrouted consumer
//! - `/health`, `/api/openapi.json`

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use relay_consumer::{UnroutedCapture, UnroutedConsumer};
use relay_publisher::{RecoveryService, ResilientPublisher};
use relay_store::FailureStore;

pub mod error;
pub mod failures;
pub mod messages;
pub mod model;

pub use error::{ApiError, ApiResult};

use model::HealthResponse;

#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<ResilientPublisher>,
    pub store: Arc<dyn FailureStore>,
    pub recovery: Arc<RecoveryService>,
    pub unrouted: Option<Arc<UnroutedConsumer>>,
}

impl AppState {
    pub fn new(publisher: Arc<ResilientPublisher>, store: Arc<dyn FailureStore>) -> Self {
        let recovery = Arc::new(RecoveryService::new(Arc::clone(&store), Arc::clone(&publisher)));
        Self { publisher, store, recovery, unrouted: None }
    }

    pub fn with_unrouted(mut self, consumer: Arc<UnroutedConsumer>) -> Self {
        self.unrouted = Some(consumer);
        self
    }
}

#[derive(OpenApi)]
#[openapi(
    info(title = "Message Relay API"),
    components(schemas(
        model::SendRequest,
        model::BatchRequest,
        model::MessageResponse,
        model::BatchResponse,
        model::ErrorResponse,
        model::HealthResponse,
        model::ResolveRequest,
        model::BatchRetryResponse,
    ))
)]
pub struct ApiDoc;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/openapi.json", get(openapi))
        .route("/api/unrouted/recent", get(recent_unrouted))
        .nest("/api/messages", messages::router())
        .nest("/api/failures", failures::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

async fn recent_unrouted(State(state): State<AppState>) -> Json<Vec<UnroutedCapture>> {
    Json(state.unrouted.map(|u| u.recent()).unwrap_or_default())
}
