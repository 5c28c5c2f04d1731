use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// Liveness only; `/api/admin/system/health` checks dependencies.
#[axum::debug_handler]
pub async fn health() -> impl IntoResponse {
    let body = json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(body))
}
