use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;
use validator::Validate;

use crate::{
    dto::endpoint_dto::{
        CreateEndpointPayload, EndpointListQuery, EndpointResponse, UpdateEndpointPayload,
    },
    error::Result,
    AppState,
};

#[utoipa::path(
    get,
    path = "/api/admin/endpoints",
    params(
        ("handler_type" = Option<String>, Query, description = "Filter by handler type"),
        ("active" = Option<bool>, Query, description = "Filter by active flag")
    ),
    responses(
        (status = 200, description = "Endpoint definitions"),
        (status = 400, description = "Unknown handler type")
    )
)]
#[axum::debug_handler]
pub async fn list_endpoints(
    State(state): State<AppState>,
    Query(query): Query<EndpointListQuery>,
) -> Result<impl IntoResponse> {
    let endpoints: Vec<EndpointResponse> = state
        .endpoints
        .list(&query)
        .await?
        .into_iter()
        .map(EndpointResponse::from)
        .collect();
    Ok(Json(endpoints))
}

#[utoipa::path(
    get,
    path = "/api/admin/endpoints/{id}",
    params(("id" = i64, Path, description = "Endpoint ID")),
    responses(
        (status = 200, description = "Endpoint definition"),
        (status = 404, description = "Endpoint not found")
    )
)]
#[axum::debug_handler]
pub async fn get_endpoint(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    let endpoint = state.endpoints.get(id).await?;
    Ok(Json(EndpointResponse::from(endpoint)))
}

#[utoipa::path(
    post,
    path = "/api/admin/endpoints",
    request_body = CreateEndpointPayload,
    responses(
        (status = 201, description = "Endpoint created"),
        (status = 400, description = "Invalid payload or duplicate route")
    )
)]
#[axum::debug_handler]
pub async fn create_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<CreateEndpointPayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let endpoint = state.endpoints.create(payload).await?;
    Ok((StatusCode::CREATED, Json(EndpointResponse::from(endpoint))))
}

#[utoipa::path(
    patch,
    path = "/api/admin/endpoints/{id}",
    params(("id" = i64, Path, description = "Endpoint ID")),
    request_body = UpdateEndpointPayload,
    responses(
        (status = 200, description = "Endpoint updated"),
        (status = 400, description = "Invalid payload or duplicate route"),
        (status = 404, description = "Endpoint not found")
    )
)]
#[axum::debug_handler]
pub async fn update_endpoint(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateEndpointPayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let endpoint = state.endpoints.update(id, payload).await?;
    state.dispatcher.clear_cache().await;
    Ok(Json(EndpointResponse::from(endpoint)))
}

#[utoipa::path(
    delete,
    path = "/api/admin/endpoints/{id}",
    params(("id" = i64, Path, description = "Endpoint ID")),
    responses(
        (status = 204, description = "Endpoint deleted"),
        (status = 404, description = "Endpoint not found")
    )
)]
#[axum::debug_handler]
pub async fn delete_endpoint(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    state.endpoints.delete(id).await?;
    state.dispatcher.clear_cache().await;
    Ok(StatusCode::NO_CONTENT)
}

/// The new credential is only ever shown in this response.
#[utoipa::path(
    post,
    path = "/api/admin/endpoints/{id}/rotate-credential",
    params(("id" = i64, Path, description = "Endpoint ID")),
    responses(
        (status = 200, description = "New secret or API key"),
        (status = 400, description = "Endpoint has no rotatable credential"),
        (status = 404, description = "Endpoint not found")
    )
)]
#[axum::debug_handler]
pub async fn rotate_credential(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    let credential = state.endpoints.rotate_credential(id).await?;
    Ok(Json(json!({ "endpoint_id": id, "credential": credential })))
}
