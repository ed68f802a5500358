//! Health check handler.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use tracing::info;

/// Report that the service is up.
pub async fn health() -> impl IntoResponse {
    info!("Health check");
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}
