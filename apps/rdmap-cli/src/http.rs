//! HTTP adapter: `POST /ai-search`, `GET /health`, `POST /admin/reload`.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

use rdmap_core::error::Error;
use rdmap_core::types::{SearchRequest, SearchResponse, Stage};
use rdmap_search::{Health, SearchService, StateInfo};

pub type AppState = Arc<SearchService>;

pub fn router(service: AppState) -> Router {
    Router::new()
        .route("/ai-search", post(search))
        .route("/health", get(health))
        .route("/admin/reload", post(reload))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    stage: Option<Stage>,
}

pub struct ApiError {
    status: StatusCode,
    message: String,
    stage: Option<Stage>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into(), stage: Some(Stage::Validate) }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::IndexNotLoaded | Error::IndexUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::EmbeddingFailed(_) => StatusCode::BAD_GATEWAY,
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "request failed");
        }
        Self { status, message: err.to_string(), stage: err.stage() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody { error: self.message, stage: self.stage };
        (self.status, Json(body)).into_response()
    }
}

async fn search(
    State(service): State<AppState>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    Ok(Json(service.search(&req).await?))
}

async fn health(State(service): State<AppState>) -> Json<Health> {
    Json(service.health())
}

async fn reload(State(service): State<AppState>) -> Result<Json<StateInfo>, ApiError> {
    Ok(Json(service.reload().await?))
}
