mod common;

use std::path::Path;

use axum::http::StatusCode;
use custom_endpoints::{
    database::store::Store,
    dto::{
        etl_dto::{CreateTemplatePayload, JobListQuery, UpdateTemplatePayload},
        service_dto::CreateServicePayload,
    },
    error::Error,
    models::{
        etl::{EtlJob, EtlStage, EtlTemplate, JobStatus},
        webhook_log::WebhookStatus,
    },
    AppState,
};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{admin_request, json_request, send, setup_app, setup_state};

async fn template(state: &AppState, definition: Value) -> EtlTemplate {
    let payload: CreateTemplatePayload = serde_json::from_value(definition).unwrap();
    state.etl.create_template(payload).await.unwrap()
}

async fn run(state: &AppState, template_id: i64, input: Value) -> EtlJob {
    let job = state.etl.create_job(template_id, input, None, None).await.unwrap();
    state.etl.run_job(job.id).await.unwrap()
}

#[tokio::test]
async fn failed_loads_record_the_stage_on_the_job() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/contacts"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "down"})))
        .expect(1)
        .mount(&server)
        .await;

    let state = setup_state().await;
    let payload: CreateServicePayload = serde_json::from_value(json!({
        "name": "crm",
        "base_url": server.uri(),
        "retry_config": {"max_retries": 0, "base_delay_ms": 1}
    }))
    .unwrap();
    let service = state.connector.create_service(payload).await.unwrap();

    let template = template(
        &state,
        json!({
            "name": "Push contacts",
            "external_service_id": service.id,
            "load_config": {"destination": "external_service", "endpoint": "/contacts"}
        }),
    )
    .await;

    let job = run(&state, template.id, json!({"email": "a@example.com"})).await;
    assert_eq!(job.status, JobStatus::Failed);

    let stored = state.etl.jobs().get(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.error_stage, Some(EtlStage::Load));
    assert!(stored.error_message.as_deref().is_some_and(|m| !m.is_empty()));
    assert_eq!(stored.transformed_data, Some(json!({"email": "a@example.com"})));
    let load = stored.load_result.unwrap();
    assert_eq!(load["success"], false);
    assert_eq!(load["status_code"], 500);
    assert!(stored.completed_at.is_some());
}

#[tokio::test]
async fn job_retries_stop_at_the_cap() {
    let state = setup_state().await;
    let template = template(
        &state,
        json!({
            "name": "Into nowhere",
            "load_config": {"destination": "database", "table": "missing_table"}
        }),
    )
    .await;

    let mut job = run(&state, template.id, json!({"id": 1})).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_stage, Some(EtlStage::Load));

    for attempt in 1..=3 {
        let retry = state.etl.retry_job(job.id).await.unwrap();
        assert_eq!(retry.retry_count, attempt);
        assert_eq!(retry.retry_of, Some(job.id));
        assert_eq!(retry.status, JobStatus::Failed);
        job = retry;
    }

    let err = state.etl.retry_job(job.id).await.unwrap_err();
    assert!(matches!(err, Error::BadRequest(ref m) if m.contains("retry limit")));

    // Only failed jobs can be retried.
    let ok = template_without_load(&state).await;
    let done = run(&state, ok.id, json!({"id": 2})).await;
    assert!(matches!(state.etl.retry_job(done.id).await, Err(Error::BadRequest(_))));
}

async fn template_without_load(state: &AppState) -> EtlTemplate {
    template(state, json!({"name": "Passthrough"})).await
}

#[tokio::test]
async fn run_pending_drains_the_queue_oldest_first() {
    let state = setup_state().await;
    let template = template_without_load(&state).await;

    let mut queued = Vec::new();
    for n in 0..3 {
        let job = state
            .etl
            .create_job(template.id, json!({"n": n}), None, None)
            .await
            .unwrap();
        queued.push(job.id);
    }

    let first = state.etl.run_pending(2).await.unwrap();
    assert_eq!(first.iter().map(|j| j.id).collect::<Vec<_>>(), queued[..2].to_vec());
    assert!(first.iter().all(|j| j.status == JobStatus::Completed));

    let pending = state
        .etl
        .list_jobs(&JobListQuery {
            status: Some("pending".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, queued[2]);

    let rest = state.etl.run_pending(10).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert!(state.etl.run_pending(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn database_destination_upserts_by_key() {
    let state = setup_state().await;
    let contacts = template(
        &state,
        json!({
            "name": "Contacts into table",
            "load_config": {
                "destination": "database",
                "table": "crm_contacts",
                "operation": "upsert",
                "key_field": "email",
                "create_if_missing": true
            }
        }),
    )
    .await;

    let job = run(&state, contacts.id, json!({"email": "ada@example.com", "name": "Ada"})).await;
    assert_eq!(job.status, JobStatus::Completed);
    let load = job.load_result.unwrap();
    assert_eq!(load["destination"], "database");
    assert_eq!(load["inserted"], 1);

    let job = run(&state, contacts.id, json!({"email": "ada@example.com", "name": "Ada L."})).await;
    assert_eq!(job.load_result.unwrap()["updated"], 1);

    let rows = state
        .store
        .get_rows_data("crm_contacts", None, None, true)
        .await
        .into_data()
        .unwrap();
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], "Ada L.");

    // Internal tables are off limits.
    let internal = template(
        &state,
        json!({
            "name": "Sneaky",
            "load_config": {"destination": "database", "table": "scheduled_tasks"}
        }),
    )
    .await;
    let job = run(&state, internal.id, json!({"name": "x"})).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_stage, Some(EtlStage::Load));
}

#[tokio::test]
async fn file_destination_writes_an_export() {
    let state = setup_state().await;
    let name = format!("contacts-{}", uuid::Uuid::new_v4());
    let template = template(
        &state,
        json!({
            "name": "Contacts export",
            "load_config": {"destination": "file", "format": "csv", "filename": name}
        }),
    )
    .await;

    let job = run(
        &state,
        template.id,
        json!([
            {"email": "ada@example.com", "name": "Ada"},
            {"email": "bo@example.com", "name": "Bo"}
        ]),
    )
    .await;
    assert_eq!(job.status, JobStatus::Completed);

    let load = job.load_result.unwrap();
    let filename = format!("{}.csv", name);
    assert_eq!(load["filename"], filename.as_str());
    assert!(load["url"].as_str().unwrap().ends_with(&format!("/exports/{}", filename)));

    let written = Path::new(&state.config.export_dir).join(&filename);
    let contents = std::fs::read_to_string(&written).unwrap();
    assert_eq!(contents, "email,name\nada@example.com,Ada\nbo@example.com,Bo\n");
    std::fs::remove_file(written).unwrap();
}

#[tokio::test]
async fn retryable_webhook_failures_succeed_on_retry() {
    let (app, state) = setup_app().await;
    let template = template(&state, json!({"name": "Later", "is_active": false})).await;

    send(
        &app,
        admin_request(
            "POST",
            "/api/admin/endpoints",
            Some(json!({
                "name": "Leads",
                "slug": "leads",
                "method": "POST",
                "handler_type": "webhook",
                "handler_config": {"etl_template_id": template.id}
            })),
        ),
    )
    .await;

    let (status, _) = send(&app, json_request("POST", "/api/custom/leads", &json!({"lead": 1}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let logs = state.webhooks.logs().all().await.unwrap();
    assert_eq!(logs.len(), 1);
    let log = &logs[0];
    assert_eq!(log.status, WebhookStatus::Failed);
    assert!(log.retryable);

    // Still inactive: the retry fails again but stays retryable.
    let summary = state.webhooks.retry_failed(3, 10).await.unwrap();
    assert_eq!((summary.retried, summary.succeeded, summary.failed), (1, 0, 1));

    state
        .etl
        .update_template(
            template.id,
            UpdateTemplatePayload {
                is_active: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let summary = state.webhooks.retry_failed(3, 10).await.unwrap();
    assert_eq!((summary.retried, summary.succeeded, summary.failed), (1, 1, 0));

    let log = state.webhooks.logs().get(log.id).await.unwrap();
    assert_eq!(log.status, WebhookStatus::Queued);
    assert_eq!(log.retry_count, 2);
    let job = state.etl.jobs().get(log.etl_job_id.unwrap()).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.input_data, json!({"lead": 1}));

    // Nothing left to retry.
    let summary = state.webhooks.retry_failed(3, 10).await.unwrap();
    assert_eq!(summary.retried, 0);
}
