use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;

use crate::{
    dto::log_dto::{SettingValuePayload, SettingsExportQuery, SettingsImportPayload},
    error::Result,
    AppState,
};

#[utoipa::path(
    get,
    path = "/api/admin/settings",
    responses((status = 200, description = "Effective value of every setting"))
)]
#[axum::debug_handler]
pub async fn list_settings(State(state): State<AppState>) -> Result<impl IntoResponse> {
    Ok(Json(state.settings.all().await?))
}

#[utoipa::path(
    get,
    path = "/api/admin/settings/{key}",
    params(("key" = String, Path, description = "Setting key")),
    responses(
        (status = 200, description = "Effective value"),
        (status = 404, description = "Unknown setting")
    )
)]
#[axum::debug_handler]
pub async fn get_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse> {
    let value = state.settings.get(&key).await?;
    Ok(Json(json!({ "key": key, "value": value })))
}

#[utoipa::path(
    put,
    path = "/api/admin/settings/{key}",
    params(("key" = String, Path, description = "Setting key")),
    request_body = SettingValuePayload,
    responses(
        (status = 200, description = "Stored value after coercion"),
        (status = 400, description = "Value does not match the setting's type"),
        (status = 404, description = "Unknown setting")
    )
)]
#[axum::debug_handler]
pub async fn set_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(payload): Json<SettingValuePayload>,
) -> Result<impl IntoResponse> {
    let value = state.settings.set(&key, &payload.value).await?;
    Ok(Json(json!({ "key": key, "value": value })))
}

#[utoipa::path(
    delete,
    path = "/api/admin/settings/{key}",
    params(("key" = String, Path, description = "Setting key")),
    responses(
        (status = 204, description = "Setting reverted to its default"),
        (status = 404, description = "Unknown setting")
    )
)]
#[axum::debug_handler]
pub async fn delete_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse> {
    state.settings.delete(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/admin/settings-export",
    params(("group" = Option<String>, Query, description = "Only settings of this group")),
    responses((status = 200, description = "Settings as one JSON object"))
)]
#[axum::debug_handler]
pub async fn export_settings(
    State(state): State<AppState>,
    Query(query): Query<SettingsExportQuery>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.settings.export(query.group.as_deref()).await?))
}

#[utoipa::path(
    post,
    path = "/api/admin/settings-import",
    request_body = SettingsImportPayload,
    responses(
        (status = 200, description = "Number of imported settings"),
        (status = 400, description = "A value failed validation; nothing was applied")
    )
)]
#[axum::debug_handler]
pub async fn import_settings(
    State(state): State<AppState>,
    Json(payload): Json<SettingsImportPayload>,
) -> Result<impl IntoResponse> {
    let imported = state.settings.import(&payload.settings).await?;
    Ok(Json(json!({ "imported": imported })))
}
