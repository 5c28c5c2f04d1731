mod common;

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use custom_endpoints::{
    build_router,
    dto::dispatch_dto::{HandlerResponse, InboundRequest},
    error::{Error, Result},
    models::endpoint::Endpoint,
    services::extensions::{ActionHook, DispatchInterceptor, Extensions, ScriptHandler, ScriptOutput},
};
use serde_json::{json, Value};

use common::{admin_request, json_request, send, setup_state_with};

struct Greeter;

#[async_trait]
impl ActionHook for Greeter {
    async fn fire(&self, _action: &str, data: &Value, _endpoint: Option<&Endpoint>) -> Result<Option<Value>> {
        let name = data["name"].as_str().unwrap_or("stranger");
        Ok(Some(json!({ "greeting": format!("hello {}", name) })))
    }
}

struct Sum;

#[async_trait]
impl ScriptHandler for Sum {
    async fn call(&self, data: &Value, _endpoint: &Endpoint, _request: &InboundRequest) -> Result<ScriptOutput> {
        let a = data["a"].as_str().and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
        let b = data["b"].as_i64().unwrap_or(0);
        Ok(ScriptOutput::Response(HandlerResponse::new(201, json!({ "sum": a + b }))))
    }
}

struct Exploding;

#[async_trait]
impl ScriptHandler for Exploding {
    async fn call(&self, _data: &Value, _endpoint: &Endpoint, _request: &InboundRequest) -> Result<ScriptOutput> {
        Err(Error::Handler("secret connection string leaked".into()))
    }
}

struct Maintenance;

#[async_trait]
impl DispatchInterceptor for Maintenance {
    async fn before(&self, request: &InboundRequest, _endpoint: &Endpoint) -> Option<HandlerResponse> {
        request
            .header("x-maintenance")
            .map(|_| HandlerResponse::error(503, "Down for maintenance"))
    }

    async fn after(&self, _request: &InboundRequest, _endpoint: &Endpoint, response: HandlerResponse) -> HandlerResponse {
        response.with_header("x-served-by", "custom-endpoints")
    }
}

async fn app() -> axum::Router {
    let extensions = Arc::new(Extensions::new());
    extensions.on_action("greet", Arc::new(Greeter));
    extensions.scripts.register("sum", Arc::new(Sum));
    extensions.scripts.register("explode", Arc::new(Exploding));
    extensions.add_interceptor(Arc::new(Maintenance));
    build_router(setup_state_with(extensions).await)
}

async fn create(app: &axum::Router, definition: Value) -> Value {
    let (status, body) = send(app, admin_request("POST", "/api/admin/endpoints", Some(definition))).await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    body
}

#[tokio::test]
async fn action_hooks_answer_with_path_params() {
    let app = app().await;
    create(
        &app,
        json!({
            "name": "Greet",
            "slug": "greet",
            "route": "{name}",
            "method": "GET",
            "handler_type": "action",
            "handler_config": {"action": "greet"}
        }),
    )
    .await;

    let req = Request::builder()
        .uri("/api/custom/greet/ada")
        .body(Body::empty())
        .unwrap();
    let resp = tower::ServiceExt::oneshot(app.clone(), req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-served-by"], "custom-endpoints");

    let req = Request::builder()
        .uri("/api/custom/greet/ada")
        .body(Body::empty())
        .unwrap();
    let (_, body) = send(&app, req).await;
    assert_eq!(body, json!({"greeting": "hello ada"}));
}

#[tokio::test]
async fn scripts_merge_query_and_body() {
    let app = app().await;
    create(
        &app,
        json!({
            "name": "Sum",
            "slug": "sum",
            "method": "POST",
            "handler_type": "script",
            "handler_config": {"script": "sum"}
        }),
    )
    .await;

    let (status, body) = send(&app, json_request("POST", "/api/custom/sum?a=2", &json!({"b": 3}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["sum"], 5);
}

#[tokio::test]
async fn handler_failures_are_redacted() {
    let app = app().await;
    create(
        &app,
        json!({
            "name": "Explode",
            "slug": "explode",
            "method": "POST",
            "handler_type": "script",
            "handler_config": {"script": "explode"}
        }),
    )
    .await;

    let (status, body) = send(&app, json_request("POST", "/api/custom/explode", &json!({}))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Internal server error");
    assert!(body.get("message").is_none());

    let (status, _) = send(
        &app,
        admin_request("PUT", "/api/admin/settings/debug_mode", Some(json!({"value": true}))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(&app, json_request("POST", "/api/custom/explode", &json!({}))).await;
    assert!(body["message"].as_str().unwrap().contains("secret connection string"));
}

#[tokio::test]
async fn interceptors_can_short_circuit() {
    let app = app().await;
    create(
        &app,
        json!({
            "name": "Sum",
            "slug": "sum",
            "method": "POST",
            "handler_type": "script",
            "handler_config": {"script": "sum"}
        }),
    )
    .await;

    let req = Request::builder()
        .method("POST")
        .uri("/api/custom/sum")
        .header("x-maintenance", "1")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "Down for maintenance");
}

#[tokio::test]
async fn api_key_permission_guards_the_handler() {
    let app = app().await;
    create(
        &app,
        json!({
            "name": "Greet",
            "slug": "private-greet",
            "method": "POST",
            "handler_type": "action",
            "handler_config": {"action": "greet"},
            "permission_type": "api_key",
            "permission_config": {"keys": ["k-123"]}
        }),
    )
    .await;

    let (status, body) = send(&app, json_request("POST", "/api/custom/private-greet", &json!({}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Unauthorized");

    let req = Request::builder()
        .method("POST")
        .uri("/api/custom/private-greet")
        .header("x-api-key", "wrong")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
        &app,
        json_request("POST", "/api/custom/private-greet?api_key=k-123", &json!({"name": "bo"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["greeting"], "hello bo");
}

#[tokio::test]
async fn malformed_permission_rules_fail_as_server_errors() {
    let app = app().await;
    create(
        &app,
        json!({
            "name": "Greet",
            "slug": "misconfigured",
            "method": "POST",
            "handler_type": "action",
            "handler_config": {"action": "greet"},
            "permission_type": "api_key",
            "permission_config": {"keys": "k-123"}
        }),
    )
    .await;

    let (status, body) = send(
        &app,
        json_request("POST", "/api/custom/misconfigured?api_key=k-123", &json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Internal server error");
    assert!(body.get("message").is_none());
}

#[tokio::test]
async fn inbound_rate_limit_returns_429() {
    let app = app().await;
    create(
        &app,
        json!({
            "name": "Greet",
            "slug": "limited",
            "method": "POST",
            "handler_type": "action",
            "handler_config": {"action": "greet"},
            "rate_limit_requests": 2,
            "rate_limit_window": 60
        }),
    )
    .await;

    for _ in 0..2 {
        let (status, _) = send(&app, json_request("POST", "/api/custom/limited", &json!({}))).await;
        assert_eq!(status, StatusCode::OK);
    }
    let req = json_request("POST", "/api/custom/limited", &json!({}));
    let resp = tower::ServiceExt::oneshot(app.clone(), req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(resp.headers().contains_key("retry-after"));
}

#[tokio::test]
async fn cached_get_responses_are_marked() {
    let app = app().await;
    create(
        &app,
        json!({
            "name": "Greet",
            "slug": "cached",
            "method": "GET",
            "handler_type": "action",
            "handler_config": {"action": "greet"},
            "cache_ttl": 60
        }),
    )
    .await;

    let get = || {
        Request::builder()
            .uri("/api/custom/cached?name=ada")
            .body(Body::empty())
            .unwrap()
    };
    let first = tower::ServiceExt::oneshot(app.clone(), get()).await.unwrap();
    assert!(first.headers().get("x-cache").is_none());
    let second = tower::ServiceExt::oneshot(app.clone(), get()).await.unwrap();
    assert_eq!(second.headers()["x-cache"], "HIT");
}

#[tokio::test]
async fn etl_endpoints_report_job_outcome() {
    let app = app().await;
    let (_, template) = send(
        &app,
        admin_request(
            "POST",
            "/api/admin/templates",
            Some(json!({
                "name": "Echo",
                "transform_config": {"field_mappings": {"sku": "product.sku"}}
            })),
        ),
    )
    .await;
    create(
        &app,
        json!({
            "name": "Import",
            "slug": "import",
            "method": "POST",
            "handler_type": "etl",
            "handler_config": {"template_id": template["id"]}
        }),
    )
    .await;

    let (status, body) = send(
        &app,
        json_request("POST", "/api/custom/import", &json!({"product": {"sku": "A-1"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "completed");
}
