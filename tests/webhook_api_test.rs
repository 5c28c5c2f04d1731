mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use custom_endpoints::{
    dto::log_dto::WebhookLogQuery,
    models::{etl::JobStatus, webhook_log::WebhookStatus},
    utils::crypto::{sign, DigestFormat, SignatureAlgorithm},
};
use serde_json::json;

use common::{admin_request, json_request, send, setup_app};

#[tokio::test]
async fn webhook_delivery_is_logged_as_processed() {
    let (app, state) = setup_app().await;

    let (status, created) = send(
        &app,
        admin_request(
            "POST",
            "/api/admin/endpoints",
            Some(json!({
                "name": "Orders",
                "slug": "orders",
                "method": "POST",
                "handler_type": "webhook"
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["url"], "/custom/orders");

    let (status, body) = send(&app, json_request("POST", "/api/custom/orders", &json!({"id": 7}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let logs = state.webhooks.list(&WebhookLogQuery::default()).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, WebhookStatus::Processed);
    assert_eq!(logs[0].request_payload, json!({"id": 7}));
    assert_eq!(body["log_id"], logs[0].id);
}

#[tokio::test]
async fn unknown_routes_and_methods() {
    let (app, _) = setup_app().await;
    send(
        &app,
        admin_request(
            "POST",
            "/api/admin/endpoints",
            Some(json!({
                "name": "Orders",
                "slug": "orders",
                "method": "POST",
                "handler_type": "webhook"
            })),
        ),
    )
    .await;

    let req = Request::builder()
        .method("GET")
        .uri("/api/custom/orders")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    let (status, body) = send(&app, json_request("POST", "/api/custom/missing", &json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Endpoint not found");
}

#[tokio::test]
async fn bad_signatures_are_rejected_and_not_retryable() {
    let (app, state) = setup_app().await;
    send(
        &app,
        admin_request(
            "POST",
            "/api/admin/endpoints",
            Some(json!({
                "name": "Payments",
                "slug": "payments",
                "method": "POST",
                "handler_type": "webhook",
                "handler_config": {
                    "require_signature": true,
                    "secret": "whsec_test",
                    "signature_header": "x-signature"
                }
            })),
        ),
    )
    .await;

    let payload = json!({"amount": 10}).to_string();
    let req = Request::builder()
        .method("POST")
        .uri("/api/custom/payments")
        .header("content-type", "application/json")
        .header("x-signature", "sha256=deadbeef")
        .body(Body::from(payload.clone()))
        .unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let signature = sign(
        SignatureAlgorithm::Sha256,
        DigestFormat::Hex,
        "whsec_test",
        payload.as_bytes(),
    );
    let req = Request::builder()
        .method("POST")
        .uri("/api/custom/payments")
        .header("content-type", "application/json")
        .header("x-signature", format!("sha256={}", signature))
        .body(Body::from(payload))
        .unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);

    let logs = state.webhooks.list(&WebhookLogQuery::default()).await.unwrap();
    assert_eq!(logs.len(), 2);
    let failed = logs.iter().find(|l| l.status == WebhookStatus::Failed).unwrap();
    assert!(!failed.retryable);
    assert_eq!(failed.response_code, Some(401));

    let (status, _) = send(
        &app,
        admin_request("POST", &format!("/api/admin/webhook-logs/{}/retry", failed.id), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn webhook_runs_etl_template_inline() {
    let (app, state) = setup_app().await;

    let (status, template) = send(
        &app,
        admin_request(
            "POST",
            "/api/admin/templates",
            Some(json!({
                "name": "Normalize names",
                "transform_config": {
                    "field_mappings": {
                        "full_name": {"source": "name", "transformations": ["uppercase"]}
                    }
                }
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    send(
        &app,
        admin_request(
            "POST",
            "/api/admin/endpoints",
            Some(json!({
                "name": "Signups",
                "slug": "signups",
                "method": "POST",
                "handler_type": "webhook",
                "handler_config": {
                    "etl_template_id": template["id"],
                    "process_immediately": true
                }
            })),
        ),
    )
    .await;

    let (status, body) = send(&app, json_request("POST", "/api/custom/signups", &json!({"name": "ada"}))).await;
    assert_eq!(status, StatusCode::OK);
    let job_id = body["etl_job_id"].as_i64().unwrap();

    let job = state.etl.jobs().get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.transformed_data, Some(json!({"full_name": "ADA"})));

    let log = state.webhooks.logs().get(body["log_id"].as_i64().unwrap()).await.unwrap();
    assert_eq!(log.status, WebhookStatus::Processed);
    assert_eq!(log.etl_job_id, Some(job_id));
}

#[tokio::test]
async fn xml_and_form_bodies_are_parsed() {
    let (app, state) = setup_app().await;
    send(
        &app,
        admin_request(
            "POST",
            "/api/admin/endpoints",
            Some(json!({
                "name": "Feed",
                "slug": "feed",
                "method": "POST",
                "handler_type": "webhook",
                "handler_config": {"include_payload": true}
            })),
        ),
    )
    .await;

    let req = Request::builder()
        .method("POST")
        .uri("/api/custom/feed")
        .header("content-type", "application/xml")
        .body(Body::from(r#"<order id="9"><item>a</item><item>b</item></order>"#))
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["payload"]["order"]["@id"], "9");
    assert_eq!(body["payload"]["order"]["item"], json!(["a", "b"]));

    let req = Request::builder()
        .method("POST")
        .uri("/api/custom/feed")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from("name=ada&plan=pro"))
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["payload"], json!({"name": "ada", "plan": "pro"}));

    let logs = state.webhooks.list(&WebhookLogQuery::default()).await.unwrap();
    assert!(logs.iter().all(|l| l.status == WebhookStatus::Processed));
}
