use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use validator::Validate;

use crate::{
    dto::etl_dto::{
        CreateTemplatePayload, JobListQuery, PreviewPayload, RunTemplatePayload,
        UpdateTemplatePayload,
    },
    error::Result,
    AppState,
};

#[utoipa::path(
    get,
    path = "/api/admin/templates",
    responses((status = 200, description = "ETL templates"))
)]
#[axum::debug_handler]
pub async fn list_templates(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let mut templates = state.etl.templates().all().await?;
    templates.sort_by_key(|t| t.id);
    Ok(Json(templates))
}

#[utoipa::path(
    get,
    path = "/api/admin/templates/{id}",
    params(("id" = i64, Path, description = "Template ID")),
    responses(
        (status = 200, description = "ETL template"),
        (status = 404, description = "Template not found")
    )
)]
#[axum::debug_handler]
pub async fn get_template(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.etl.templates().get(id).await?))
}

#[utoipa::path(
    post,
    path = "/api/admin/templates",
    request_body = CreateTemplatePayload,
    responses(
        (status = 201, description = "Template created"),
        (status = 400, description = "Invalid payload or pipeline configuration")
    )
)]
#[axum::debug_handler]
pub async fn create_template(
    State(state): State<AppState>,
    Json(payload): Json<CreateTemplatePayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    let template = state.etl.create_template(payload).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

#[utoipa::path(
    patch,
    path = "/api/admin/templates/{id}",
    params(("id" = i64, Path, description = "Template ID")),
    request_body = UpdateTemplatePayload,
    responses(
        (status = 200, description = "Template updated"),
        (status = 400, description = "Invalid payload or pipeline configuration"),
        (status = 404, description = "Template not found")
    )
)]
#[axum::debug_handler]
pub async fn update_template(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateTemplatePayload>,
) -> Result<impl IntoResponse> {
    payload.validate()?;
    Ok(Json(state.etl.update_template(id, payload).await?))
}

#[utoipa::path(
    delete,
    path = "/api/admin/templates/{id}",
    params(("id" = i64, Path, description = "Template ID")),
    responses(
        (status = 204, description = "Template deleted"),
        (status = 404, description = "Template not found")
    )
)]
#[axum::debug_handler]
pub async fn delete_template(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    state.etl.delete_template(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Extract and transform a sample without loading it anywhere.
#[utoipa::path(
    post,
    path = "/api/admin/templates/{id}/preview",
    params(("id" = i64, Path, description = "Template ID")),
    request_body = PreviewPayload,
    responses(
        (status = 200, description = "Extracted and transformed sample"),
        (status = 404, description = "Template not found")
    )
)]
#[axum::debug_handler]
pub async fn preview_template(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<PreviewPayload>,
) -> Result<impl IntoResponse> {
    let template = state.etl.templates().get(id).await?;
    Ok(Json(state.etl.preview(&template, &payload.sample).await?))
}

#[utoipa::path(
    post,
    path = "/api/admin/templates/{id}/run",
    params(("id" = i64, Path, description = "Template ID")),
    request_body = RunTemplatePayload,
    responses(
        (status = 200, description = "Finished job, completed or failed"),
        (status = 400, description = "Template inactive"),
        (status = 404, description = "Template not found")
    )
)]
#[axum::debug_handler]
pub async fn run_template(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<RunTemplatePayload>,
) -> Result<impl IntoResponse> {
    let job = state.etl.create_job(id, payload.input, None, None).await?;
    Ok(Json(state.etl.run_job(job.id).await?))
}

#[utoipa::path(
    get,
    path = "/api/admin/jobs",
    params(
        ("template_id" = Option<i64>, Query, description = "Filter by template"),
        ("status" = Option<String>, Query, description = "Filter by job status"),
        ("limit" = Option<usize>, Query, description = "Maximum rows, default 100")
    ),
    responses((status = 200, description = "ETL jobs, newest first"))
)]
#[axum::debug_handler]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobListQuery>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.etl.list_jobs(&query).await?))
}

#[utoipa::path(
    get,
    path = "/api/admin/jobs/{id}",
    params(("id" = i64, Path, description = "Job ID")),
    responses(
        (status = 200, description = "ETL job"),
        (status = 404, description = "Job not found")
    )
)]
#[axum::debug_handler]
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.etl.jobs().get(id).await?))
}

#[utoipa::path(
    post,
    path = "/api/admin/jobs/{id}/retry",
    params(("id" = i64, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Re-run job"),
        (status = 400, description = "Job not failed or out of retries"),
        (status = 404, description = "Job not found")
    )
)]
#[axum::debug_handler]
pub async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.etl.retry_job(id).await?))
}
