#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use custom_endpoints::{
    build_router,
    config::Config,
    database::{ensure_schema, memory::MemoryStore, store::Store},
    middleware::auth::Claims,
    services::extensions::Extensions,
    AppState,
};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::Value;
use tower::ServiceExt;

pub const JWT_SECRET: &str = "test_secret_key";

pub fn test_config() -> Config {
    Config {
        jwt_secret: JWT_SECRET.to_string(),
        export_dir: std::env::temp_dir()
            .join("custom-endpoints-tests")
            .to_string_lossy()
            .into_owned(),
        ..Config::default()
    }
}

pub async fn setup_state_with(extensions: Arc<Extensions>) -> AppState {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    ensure_schema(store.as_ref()).await.expect("schema");
    AppState::with_extensions(test_config(), store, extensions).expect("state")
}

pub async fn setup_state() -> AppState {
    setup_state_with(Arc::new(Extensions::new())).await
}

pub async fn setup_app() -> (Router, AppState) {
    let state = setup_state().await;
    (build_router(state.clone()), state)
}

pub fn token_with_role(role: Option<&str>) -> String {
    let claims = Claims {
        sub: "operator".into(),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        role: role.map(str::to_string),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("token")
}

pub fn admin_token() -> String {
    token_with_role(Some("admin"))
}

pub fn admin_request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", admin_token()));
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Sends one request and decodes the JSON body (`Null` when empty).
pub async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, body)
}
