use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use validator::Validate;

use crate::{
    dto::task_dto::{CreateTaskPayload, UpdateTaskPayload},
    error::Result,
    AppState,
};

#[utoipa::path(
    get,
    path = "/api/admin/tasks",
    responses((status = 200, description = "Scheduled tasks, highest priority first"))
)]
#[axum::debug_handler]
pub async fn list_tasks(State(state): State<AppState>) -> Result<impl IntoResponse> {
    Ok(Json(state.scheduler.list().await?))
}

#[utoipa::path(
    get,
    path = "/api/admin/tasks/{id}",
    params(("id" = i64, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Scheduled task"),
        (status = 404, description = "Task not found")
    )
)]
#[axum::debug_handler]
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.scheduler.tasks().get(id).await?))
}

#[utoipa::path(
    post,
    path = "/api/admin/tasks",
    request_body = CreateTaskPayload,
    responses(
        (status = 201, description = "Task created"),
        (status = 400, description = "Invalid payload, frequency or duplicate handler")
    )
)]
#[axum::debug_handler]
pub async fn create_task(
    State(state): State<AppState>,
    Json(payload): Json<CreateTaskPayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let task = state.scheduler.create(payload).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

#[utoipa::path(
    patch,
    path = "/api/admin/tasks/{id}",
    params(("id" = i64, Path, description = "Task ID")),
    request_body = UpdateTaskPayload,
    responses(
        (status = 200, description = "Task updated"),
        (status = 400, description = "Invalid payload or frequency"),
        (status = 404, description = "Task not found")
    )
)]
#[axum::debug_handler]
pub async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateTaskPayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    Ok(Json(state.scheduler.update(id, payload).await?))
}

#[utoipa::path(
    delete,
    path = "/api/admin/tasks/{id}",
    params(("id" = i64, Path, description = "Task ID")),
    responses(
        (status = 204, description = "Task deleted"),
        (status = 403, description = "System tasks cannot be deleted"),
        (status = 404, description = "Task not found")
    )
)]
#[axum::debug_handler]
pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    state.scheduler.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/admin/tasks/{id}/run",
    params(("id" = i64, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Run outcome"),
        (status = 400, description = "Task already running"),
        (status = 404, description = "Task not found")
    )
)]
#[axum::debug_handler]
pub async fn run_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.scheduler.run_now(id).await?))
}
