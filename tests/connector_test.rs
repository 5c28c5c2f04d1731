mod common;

use axum::http::StatusCode;
use custom_endpoints::{
    dto::service_dto::CreateServicePayload,
    error::Error,
    models::external_service::{ExternalService, HealthStatus},
    services::connector_service::SendOptions,
    AppState,
};
use serde_json::{json, Value};
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{admin_request, json_request, send, setup_app, setup_state};

async fn create_service(state: &AppState, server: &MockServer, extra: Value) -> ExternalService {
    let mut definition = json!({
        "name": "upstream",
        "base_url": server.uri(),
        "retry_config": {"max_retries": 3, "base_delay_ms": 1}
    });
    if let (Some(target), Value::Object(extra)) = (definition.as_object_mut(), extra) {
        target.extend(extra);
    }
    let payload: CreateServicePayload = serde_json::from_value(definition).unwrap();
    state.connector.create_service(payload).await.unwrap()
}

#[tokio::test]
async fn transient_failures_are_retried_with_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"orders": []})))
        .mount(&server)
        .await;

    let state = setup_state().await;
    let service = create_service(&state, &server, json!({})).await;

    let response = state
        .connector
        .send(service.id, "/orders", None, "GET", &SendOptions::default())
        .await
        .unwrap();
    assert!(response.success);
    assert_eq!(response.attempts, 4);
    assert_eq!(response.body, json!({"orders": []}));

    let stored = state.connector.services().get(service.id).await.unwrap();
    assert_eq!(stored.health_status, HealthStatus::Healthy);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "nope"})))
        .expect(1)
        .mount(&server)
        .await;

    let state = setup_state().await;
    let service = create_service(&state, &server, json!({})).await;

    let response = state
        .connector
        .send(service.id, "missing", None, "GET", &SendOptions::default())
        .await
        .unwrap();
    assert!(!response.success);
    assert_eq!(response.status_code, 404);
    assert_eq!(response.attempts, 1);
}

#[tokio::test]
async fn exhausted_retries_mark_the_service_unhealthy() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/jobs"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let state = setup_state().await;
    let service = create_service(
        &state,
        &server,
        json!({"retry_config": {"max_retries": 2, "base_delay_ms": 1}}),
    )
    .await;

    let response = state
        .connector
        .send(service.id, "/jobs", Some(&json!({"a": 1})), "POST", &SendOptions::default())
        .await
        .unwrap();
    assert!(!response.success);
    assert_eq!(response.attempts, 3);

    let stored = state.connector.services().get(service.id).await.unwrap();
    assert_eq!(stored.health_status, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn outbound_rate_limit_rejects_before_sending() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(2)
        .mount(&server)
        .await;

    let state = setup_state().await;
    let service = create_service(
        &state,
        &server,
        json!({"rate_limit_config": {"max_requests": 2, "time_window": 60}}),
    )
    .await;

    for _ in 0..2 {
        let response = state
            .connector
            .send(service.id, "/", None, "GET", &SendOptions::default())
            .await
            .unwrap();
        assert!(response.success);
    }
    let third = state
        .connector
        .send(service.id, "/", None, "GET", &SendOptions::default())
        .await;
    assert!(matches!(third, Err(Error::RateLimited(_))));
}

#[tokio::test]
async fn auth_headers_follow_the_auth_type() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bearer"))
        .and(header("authorization", "Bearer t-1"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/basic"))
        .and(header("authorization", "Basic dXNlcjpwYXNz"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/key"))
        .and(header("x-token", "k-1"))
        .and(query_param("q", "1"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let state = setup_state().await;
    let bearer = create_service(
        &state,
        &server,
        json!({"auth_type": "bearer", "auth_config": {"token": "t-1"}}),
    )
    .await;
    let basic = create_service(
        &state,
        &server,
        json!({"auth_type": "basic", "auth_config": {"username": "user", "password": "pass"}}),
    )
    .await;
    let api_key = create_service(
        &state,
        &server,
        json!({"auth_type": "api_key", "auth_config": {"header_name": "X-Token", "api_key": "k-1"}}),
    )
    .await;

    let options = SendOptions::default();
    let r = state.connector.send(bearer.id, "/bearer", None, "GET", &options).await.unwrap();
    assert_eq!(r.status_code, 200);
    let r = state.connector.send(basic.id, "/basic", None, "GET", &options).await.unwrap();
    assert_eq!(r.status_code, 200);
    let r = state
        .connector
        .send(api_key.id, "/key", Some(&json!({"q": 1})), "GET", &options)
        .await
        .unwrap();
    assert_eq!(r.status_code, 200);
}

#[tokio::test]
async fn oauth2_tokens_are_fetched_once_and_cached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=client_credentials"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "oa-1", "expires_in": 3600})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me"))
        .and(header("authorization", "Bearer oa-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1})))
        .expect(2)
        .mount(&server)
        .await;

    let state = setup_state().await;
    let service = create_service(
        &state,
        &server,
        json!({
            "auth_type": "oauth2",
            "auth_config": {
                "token_url": format!("{}/oauth/token", server.uri()),
                "client_id": "cid",
                "client_secret": "cs"
            }
        }),
    )
    .await;

    for _ in 0..2 {
        let r = state
            .connector
            .send(service.id, "/me", None, "GET", &SendOptions::default())
            .await
            .unwrap();
        assert_eq!(r.body, json!({"id": 1}));
    }
}

#[tokio::test]
async fn health_checks_classify_and_persist() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let state = setup_state().await;
    let service = create_service(
        &state,
        &server,
        json!({"health_check_path": "/status", "expected_status": 200}),
    )
    .await;

    let preview = state.connector.test_connection(service.id).await.unwrap();
    assert_eq!(preview.status, HealthStatus::Degraded);
    let stored = state.connector.services().get(service.id).await.unwrap();
    assert_eq!(stored.health_status, HealthStatus::Unknown);

    let report = state.connector.health_check(service.id).await.unwrap();
    assert_eq!(report.status, HealthStatus::Degraded);
    let stored = state.connector.services().get(service.id).await.unwrap();
    assert_eq!(stored.health_status, HealthStatus::Degraded);
    assert!(stored.last_health_check.is_some());
}

#[tokio::test]
async fn forward_endpoints_proxy_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/orders"))
        .and(header("x-request-source", "edge"))
        .and(body_string_contains("\"id\":7"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({"queued": true})))
        .mount(&server)
        .await;

    let (app, state) = setup_app().await;
    let service = create_service(&state, &server, json!({})).await;

    let (status, _) = send(
        &app,
        admin_request(
            "POST",
            "/api/admin/endpoints",
            Some(json!({
                "name": "Proxy",
                "slug": "proxy",
                "method": "POST",
                "handler_type": "forward",
                "handler_config": {"service_id": service.id, "target_path": "/v2/orders"}
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let mut req = json_request("POST", "/api/custom/proxy", &json!({"id": 7}));
    req.headers_mut()
        .insert("x-request-source", "edge".parse().unwrap());
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, json!({"queued": true}));
}

#[tokio::test]
async fn admin_service_views_mask_credentials() {
    let (app, _) = setup_app().await;
    let (status, body) = send(
        &app,
        admin_request(
            "POST",
            "/api/admin/services",
            Some(json!({
                "name": "crm",
                "base_url": "https://crm.example.com",
                "auth_type": "bearer",
                "auth_config": {"token": "very-secret"}
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["auth_config"]["token"], "********");

    let (status, _) = send(
        &app,
        admin_request(
            "POST",
            "/api/admin/services",
            Some(json!({"name": "broken", "base_url": "not a url"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
