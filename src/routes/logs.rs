use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Json},
};
use serde_json::json;
use validator::Validate;

use crate::{
    dto::log_dto::{CleanupPayload, EventLogListQuery, WebhookLogQuery},
    error::{Error, Result},
    models::event_log::LogLevel,
    services::event_log_service::EventLogQuery,
    AppState,
};

#[utoipa::path(
    get,
    path = "/api/admin/webhook-logs",
    params(
        ("endpoint_id" = Option<i64>, Query, description = "Filter by endpoint"),
        ("status" = Option<String>, Query, description = "Filter by status"),
        ("limit" = Option<usize>, Query, description = "Maximum rows, default 100")
    ),
    responses(
        (status = 200, description = "Webhook logs, newest first"),
        (status = 400, description = "Unknown status")
    )
)]
#[axum::debug_handler]
pub async fn list_webhook_logs(
    State(state): State<AppState>,
    Query(query): Query<WebhookLogQuery>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.webhooks.list(&query).await?))
}

#[utoipa::path(
    get,
    path = "/api/admin/webhook-logs/{id}",
    params(("id" = i64, Path, description = "Webhook log ID")),
    responses(
        (status = 200, description = "Webhook log"),
        (status = 404, description = "Log not found")
    )
)]
#[axum::debug_handler]
pub async fn get_webhook_log(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.webhooks.logs().get(id).await?))
}

#[utoipa::path(
    post,
    path = "/api/admin/webhook-logs/{id}/retry",
    params(("id" = i64, Path, description = "Webhook log ID")),
    responses(
        (status = 200, description = "Log after the replay"),
        (status = 400, description = "Log not retryable or out of retries"),
        (status = 404, description = "Log not found")
    )
)]
#[axum::debug_handler]
pub async fn retry_webhook_log(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    let max_retries = state.settings.get_int("webhook_max_retries").await.max(0) as u32;
    Ok(Json(state.webhooks.retry(id, max_retries).await?))
}

#[utoipa::path(
    post,
    path = "/api/admin/webhook-logs/cleanup",
    request_body = CleanupPayload,
    responses(
        (status = 200, description = "Number of deleted logs"),
        (status = 400, description = "Invalid retention")
    )
)]
#[axum::debug_handler]
pub async fn cleanup_webhook_logs(
    State(state): State<AppState>,
    Json(payload): Json<CleanupPayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let deleted = state.webhooks.cleanup(payload.days).await?;
    Ok(Json(json!({ "deleted": deleted })))
}

#[utoipa::path(
    get,
    path = "/api/admin/event-logs",
    params(
        ("level" = Option<String>, Query, description = "Filter by level"),
        ("category" = Option<String>, Query, description = "Filter by category"),
        ("limit" = Option<usize>, Query, description = "Maximum rows, default 100")
    ),
    responses(
        (status = 200, description = "Event log entries, newest first"),
        (status = 400, description = "Unknown level")
    )
)]
#[axum::debug_handler]
pub async fn list_event_logs(
    State(state): State<AppState>,
    Query(query): Query<EventLogListQuery>,
) -> Result<impl IntoResponse> {
    let level = query
        .level
        .as_deref()
        .map(|l| l.parse::<LogLevel>().map_err(Error::BadRequest))
        .transpose()?;
    let query = EventLogQuery {
        level,
        category: query.category,
        limit: query.limit,
    };
    Ok(Json(state.event_log.list(&query).await?))
}

#[utoipa::path(
    post,
    path = "/api/admin/event-logs/cleanup",
    request_body = CleanupPayload,
    responses(
        (status = 200, description = "Number of deleted entries; critical entries are kept"),
        (status = 400, description = "Invalid retention")
    )
)]
#[axum::debug_handler]
pub async fn cleanup_event_logs(
    State(state): State<AppState>,
    Json(payload): Json<CleanupPayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    state.event_log.flush().await;
    let deleted = state.event_log.cleanup(payload.days).await?;
    Ok(Json(json!({ "deleted": deleted })))
}
