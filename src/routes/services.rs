use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use validator::Validate;

use crate::{
    dto::service_dto::{CreateServicePayload, SendPayload, ServiceView, UpdateServicePayload},
    error::Result,
    services::connector_service::SendOptions,
    AppState,
};

#[utoipa::path(
    get,
    path = "/api/admin/services",
    responses((status = 200, description = "External services, credentials masked"))
)]
#[axum::debug_handler]
pub async fn list_services(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let mut services = state.connector.services().all().await?;
    services.sort_by_key(|s| s.id);
    let services: Vec<ServiceView> = services.into_iter().map(ServiceView::from).collect();
    Ok(Json(services))
}

#[utoipa::path(
    get,
    path = "/api/admin/services/{id}",
    params(("id" = i64, Path, description = "Service ID")),
    responses(
        (status = 200, description = "External service, credentials masked"),
        (status = 404, description = "Service not found")
    )
)]
#[axum::debug_handler]
pub async fn get_service(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    let service = state.connector.services().get(id).await?;
    Ok(Json(ServiceView::from(service)))
}

#[utoipa::path(
    post,
    path = "/api/admin/services",
    request_body = CreateServicePayload,
    responses(
        (status = 201, description = "Service created"),
        (status = 400, description = "Invalid payload or auth configuration")
    )
)]
#[axum::debug_handler]
pub async fn create_service(
    State(state): State<AppState>,
    Json(payload): Json<CreateServicePayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let service = state.connector.create_service(payload).await?;
    Ok((StatusCode::CREATED, Json(ServiceView::from(service))))
}

#[utoipa::path(
    patch,
    path = "/api/admin/services/{id}",
    params(("id" = i64, Path, description = "Service ID")),
    request_body = UpdateServicePayload,
    responses(
        (status = 200, description = "Service updated"),
        (status = 400, description = "Invalid payload or auth configuration"),
        (status = 404, description = "Service not found")
    )
)]
#[axum::debug_handler]
pub async fn update_service(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateServicePayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let service = state.connector.update_service(id, payload).await?;
    Ok(Json(ServiceView::from(service)))
}

#[utoipa::path(
    delete,
    path = "/api/admin/services/{id}",
    params(("id" = i64, Path, description = "Service ID")),
    responses(
        (status = 204, description = "Service deleted"),
        (status = 404, description = "Service not found")
    )
)]
#[axum::debug_handler]
pub async fn delete_service(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    state.connector.delete_service(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/admin/services/{id}/health",
    params(("id" = i64, Path, description = "Service ID")),
    responses(
        (status = 200, description = "Health report; the service's health status is updated"),
        (status = 404, description = "Service not found")
    )
)]
#[axum::debug_handler]
pub async fn health_check(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.connector.health_check(id).await?))
}

#[utoipa::path(
    post,
    path = "/api/admin/services/{id}/test",
    params(("id" = i64, Path, description = "Service ID")),
    responses(
        (status = 200, description = "Probe result, nothing recorded"),
        (status = 404, description = "Service not found")
    )
)]
#[axum::debug_handler]
pub async fn test_connection(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.connector.test_connection(id).await?))
}

#[utoipa::path(
    post,
    path = "/api/admin/services/{id}/send",
    params(("id" = i64, Path, description = "Service ID")),
    request_body = SendPayload,
    responses(
        (status = 200, description = "Connector result, including failed calls"),
        (status = 404, description = "Service not found")
    )
)]
#[axum::debug_handler]
pub async fn send(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<SendPayload>,
) -> Result<impl IntoResponse> {
    let response = state
        .connector
        .send(
            id,
            &payload.path,
            payload.data.as_ref(),
            &payload.method,
            &SendOptions::default(),
        )
        .await?;
    Ok(Json(response))
}
