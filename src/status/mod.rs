use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::health::HealthState;
use crate::scheduler::{Admission, Priority};
use crate::service::OrchestrationService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<OrchestrationService>,
}

#[derive(Debug, Deserialize)]
pub struct TaskRequest {
    pub match_id: String,
    pub url: String,
    #[serde(default)]
    pub priority: Option<Priority>,
}

/// Build the Axum router for the status surface.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/audit", get(audit_handler))
        .route("/api/tasks", post(submit_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// GET /health (503 while FAILING)
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let summary = state.service.summary();
    let code = if summary.state == HealthState::Failing {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(summary))
}

/// GET /api/status
async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.service.status().await)
}

/// GET /api/audit
async fn audit_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.service.health().get_audit_log())
}

/// POST /api/tasks  {"match_id": "...", "url": "...", "priority": "live"?}
async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskRequest>,
) -> impl IntoResponse {
    let admission = state
        .service
        .submit(&req.match_id, &req.url, req.priority)
        .await;
    let code = match admission {
        Admission::Accepted => StatusCode::ACCEPTED,
        Admission::RateLimited | Admission::QueueFull => StatusCode::TOO_MANY_REQUESTS,
        Admission::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        Admission::Invalid => StatusCode::BAD_REQUEST,
    };
    (
        code,
        Json(json!({
            "match_id": req.match_id,
            "accepted": admission.is_accepted(),
            "admission": admission,
        })),
    )
}
