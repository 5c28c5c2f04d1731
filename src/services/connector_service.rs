//! Outbound HTTP to configured external services: auth, retry with
//! exponential backoff, per-service rate limiting and health tracking.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use chrono::Utc;
use reqwest::{header, Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use tokio::sync::RwLock;

use crate::database::{store::Store, table::Table};
use crate::dto::dispatch_dto::{HandlerResponse, InboundRequest};
use crate::dto::service_dto::{CreateServicePayload, UpdateServicePayload};
use crate::error::{Error, Result};
use crate::middleware::rate_limit::{Decision, RateLimiter};
use crate::models::external_service::{AuthType, ContentType, ExternalService, HealthStatus};
use crate::services::{event_log_service::EventLogService, settings_service::SettingsService};

const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);
const USER_AGENT: &str = concat!("custom-endpoints/", env!("CARGO_PKG_VERSION"));

/// Headers never copied from an inbound request onto a forwarded one.
const HOP_BY_HOP: [&str; 6] = [
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
];

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub headers: BTreeMap<String, String>,
    pub query: Vec<(String, String)>,
    pub timeout: Option<u64>,
    pub content_type: Option<ContentType>,
}

/// Outcome of one logical call. `status_code == 0` means no response was
/// received at all.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceResponse {
    pub success: bool,
    pub status_code: u16,
    pub body: JsonValue,
    pub headers: BTreeMap<String, String>,
    pub error: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForwardConfig {
    pub service_id: i64,
    #[serde(default)]
    pub target_path: String,
    /// Overrides the inbound method.
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "crate::models::default_true")]
    pub forward_headers: bool,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub service_id: i64,
    pub status: HealthStatus,
    pub status_code: u16,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

/// Auth settings resolved from a service's `auth_type` and `auth_config`.
#[derive(Debug, Clone, PartialEq)]
enum AuthConfig {
    None,
    ApiKey {
        header_name: String,
        key: String,
    },
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    OAuth2 {
        token_url: String,
        client_id: String,
        client_secret: String,
        scope: Option<String>,
    },
    Custom {
        headers: BTreeMap<String, String>,
    },
}

fn config_str(config: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| config.get(*k).and_then(JsonValue::as_str))
        .map(str::to_string)
}

impl AuthConfig {
    fn resolve(service: &ExternalService) -> Result<Self> {
        let config = &service.auth_config;
        let missing = |field: &str| {
            Error::BadRequest(format!(
                "service '{}' auth config is missing '{}'",
                service.name, field
            ))
        };

        Ok(match service.auth_type {
            AuthType::None => AuthConfig::None,
            AuthType::ApiKey => AuthConfig::ApiKey {
                header_name: config_str(config, &["header_name", "header"])
                    .unwrap_or_else(|| "X-API-Key".to_string()),
                key: config_str(config, &["api_key", "key"]).ok_or_else(|| missing("api_key"))?,
            },
            AuthType::Bearer => AuthConfig::Bearer {
                token: config_str(config, &["token"]).ok_or_else(|| missing("token"))?,
            },
            AuthType::Basic => AuthConfig::Basic {
                username: config_str(config, &["username"]).ok_or_else(|| missing("username"))?,
                password: config_str(config, &["password"]).unwrap_or_default(),
            },
            AuthType::OAuth2 => AuthConfig::OAuth2 {
                token_url: config_str(config, &["token_url"]).ok_or_else(|| missing("token_url"))?,
                client_id: config_str(config, &["client_id"]).ok_or_else(|| missing("client_id"))?,
                client_secret: config_str(config, &["client_secret"]).unwrap_or_default(),
                scope: config_str(config, &["scope"]),
            },
            AuthType::Custom => AuthConfig::Custom {
                headers: config
                    .get("headers")
                    .and_then(JsonValue::as_object)
                    .map(string_map)
                    .unwrap_or_default(),
            },
        })
    }
}

fn string_map(map: &Map<String, JsonValue>) -> BTreeMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), scalar_to_string(v)))
        .collect()
}

fn scalar_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Request body, rebuilt for every attempt.
#[derive(Debug, Clone)]
enum Payload {
    Empty,
    Json(JsonValue),
    Form(Vec<(String, String)>),
    Multipart(Vec<(String, String)>),
    Raw {
        body: Bytes,
        content_type: Option<String>,
    },
}

impl Payload {
    fn from_data(data: Option<&JsonValue>, content_type: ContentType) -> Self {
        let Some(data) = data.filter(|d| !d.is_null()) else {
            return Payload::Empty;
        };
        let fields = || match data {
            JsonValue::Object(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), scalar_to_string(v)))
                .collect(),
            other => vec![("data".to_string(), scalar_to_string(other))],
        };
        match content_type {
            ContentType::Json => Payload::Json(data.clone()),
            ContentType::Form => Payload::Form(fields()),
            ContentType::Multipart => Payload::Multipart(fields()),
        }
    }

    fn apply(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Payload::Empty => builder,
            Payload::Json(value) => builder.json(value),
            Payload::Form(fields) => builder.form(fields),
            Payload::Multipart(fields) => {
                let form = fields
                    .iter()
                    .fold(reqwest::multipart::Form::new(), |form, (k, v)| {
                        form.text(k.clone(), v.clone())
                    });
                builder.multipart(form)
            }
            Payload::Raw { body, content_type } => {
                let builder = match content_type {
                    Some(ct) => builder.header(header::CONTENT_TYPE, ct.as_str()),
                    None => builder,
                };
                builder.body(body.clone())
            }
        }
    }
}

/// Single attempt result before retry bookkeeping.
struct Attempt {
    status_code: u16,
    body: JsonValue,
    headers: BTreeMap<String, String>,
    error: Option<String>,
}

impl Attempt {
    fn success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

#[derive(Clone)]
pub struct ConnectorService {
    services: Table<ExternalService>,
    settings: SettingsService,
    event_log: EventLogService,
    client: Client,
    limiter: RateLimiter,
    cache: Arc<RwLock<HashMap<i64, ExternalService>>>,
    tokens: Arc<RwLock<HashMap<i64, CachedToken>>>,
}

impl ConnectorService {
    pub fn new(
        store: Arc<dyn Store>,
        settings: SettingsService,
        event_log: EventLogService,
        client: Client,
    ) -> Self {
        Self {
            services: Table::new(store),
            settings,
            event_log,
            client,
            limiter: RateLimiter::new(),
            cache: Arc::new(RwLock::new(HashMap::new())),
            tokens: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn services(&self) -> &Table<ExternalService> {
        &self.services
    }

    pub async fn service(&self, service_id: i64) -> Result<ExternalService> {
        let use_cache = self.settings.get_bool("connector_cache_enabled").await;
        if use_cache {
            if let Some(service) = self.cache.read().await.get(&service_id) {
                return Ok(service.clone());
            }
        }
        let service = self.services.get(service_id).await?;
        if use_cache {
            self.cache.write().await.insert(service_id, service.clone());
        }
        Ok(service)
    }

    pub async fn create_service(&self, payload: CreateServicePayload) -> Result<ExternalService> {
        let now = Utc::now();
        let defaults: ExternalService = serde_json::from_value(json!({
            "name": payload.name,
            "base_url": payload.base_url,
            "created_at": now,
            "updated_at": now,
        }))?;
        let service = ExternalService {
            auth_type: payload.auth_type,
            auth_config: payload.auth_config,
            default_headers: payload.default_headers,
            content_type: payload.content_type,
            timeout: payload.timeout.unwrap_or(defaults.timeout),
            retry_config: payload.retry_config.unwrap_or_default(),
            rate_limit_config: payload.rate_limit_config.unwrap_or_default(),
            health_check_path: payload
                .health_check_path
                .unwrap_or_else(|| defaults.health_check_path.clone()),
            expected_status: payload.expected_status.unwrap_or(defaults.expected_status),
            is_active: payload.is_active.unwrap_or(true),
            ..defaults
        };
        AuthConfig::resolve(&service)?;
        let service = self.services.insert(&service).await?;
        tracing::info!(service_id = service.id, name = %service.name, "external service created");
        Ok(service)
    }

    pub async fn update_service(&self, service_id: i64, payload: UpdateServicePayload) -> Result<ExternalService> {
        let mut service = self.services.get(service_id).await?;
        if let Some(name) = payload.name {
            service.name = name;
        }
        if let Some(base_url) = payload.base_url {
            service.base_url = base_url;
        }
        if let Some(auth_type) = payload.auth_type {
            service.auth_type = auth_type;
        }
        if let Some(auth_config) = payload.auth_config {
            service.auth_config = auth_config;
        }
        if let Some(headers) = payload.default_headers {
            service.default_headers = headers;
        }
        if let Some(content_type) = payload.content_type {
            service.content_type = content_type;
        }
        if let Some(timeout) = payload.timeout {
            service.timeout = timeout;
        }
        if let Some(retry) = payload.retry_config {
            service.retry_config = retry;
        }
        if let Some(limits) = payload.rate_limit_config {
            service.rate_limit_config = limits;
        }
        if let Some(path) = payload.health_check_path {
            service.health_check_path = path;
        }
        if let Some(expected) = payload.expected_status {
            service.expected_status = expected;
        }
        if let Some(active) = payload.is_active {
            service.is_active = active;
        }
        service.updated_at = Utc::now();
        AuthConfig::resolve(&service)?;

        let service = self.services.save(&service).await?;
        self.invalidate_cache(Some(service_id)).await;
        Ok(service)
    }

    pub async fn delete_service(&self, service_id: i64) -> Result<()> {
        self.services.get(service_id).await?;
        self.services.delete(service_id).await?;
        self.invalidate_cache(Some(service_id)).await;
        tracing::info!(service_id, "external service deleted");
        Ok(())
    }

    /// Drops cached config and tokens for one service, or for all of them.
    pub async fn invalidate_cache(&self, service_id: Option<i64>) {
        match service_id {
            Some(id) => {
                self.cache.write().await.remove(&id);
                self.tokens.write().await.remove(&id);
                self.limiter.reset(&rate_key(id));
            }
            None => {
                self.cache.write().await.clear();
                self.tokens.write().await.clear();
            }
        }
    }

    pub async fn send(
        &self,
        service_id: i64,
        path: &str,
        data: Option<&JsonValue>,
        method: &str,
        options: &SendOptions,
    ) -> Result<ServiceResponse> {
        let service = self.service(service_id).await?;
        let content_type = options.content_type.unwrap_or(service.content_type);
        let method = parse_method(method)?;

        let (payload, mut query) = if method == Method::GET || method == Method::DELETE {
            (Payload::Empty, query_pairs(data))
        } else {
            (Payload::from_data(data, content_type), Vec::new())
        };
        query.extend(options.query.iter().cloned());

        self.execute(&service, method, path, payload, &query, options)
            .await
    }

    /// Reverse-proxies `request` to a service. Status and body are passed
    /// through verbatim.
    pub async fn forward(
        &self,
        request: &InboundRequest,
        config: &ForwardConfig,
    ) -> Result<HandlerResponse> {
        let service = self.service(config.service_id).await?;
        let method = parse_method(config.method.as_deref().unwrap_or(&request.method))?;

        let mut headers = BTreeMap::new();
        if config.forward_headers {
            for (name, value) in &request.headers {
                if HOP_BY_HOP.contains(&name.as_str()) || name == "content-type" {
                    continue;
                }
                // The service's own credentials take precedence.
                if name == "authorization" && service.auth_type != AuthType::None {
                    continue;
                }
                headers.insert(name.clone(), value.clone());
            }
        }
        headers.extend(config.headers.clone());

        let options = SendOptions {
            headers,
            timeout: config.timeout,
            ..Default::default()
        };
        let query: Vec<(String, String)> = request
            .query
            .iter()
            .map(|(k, v)| (k.clone(), scalar_to_string(v)))
            .collect();
        let payload = if request.body.is_empty() {
            Payload::Empty
        } else {
            Payload::Raw {
                body: request.body.clone(),
                content_type: request.header("content-type").map(str::to_string),
            }
        };

        let outcome = self
            .execute(&service, method, &config.target_path, payload, &query, &options)
            .await?;

        if outcome.status_code == 0 {
            return Ok(HandlerResponse::error(
                502,
                outcome.error.unwrap_or_else(|| "upstream unreachable".to_string()),
            ));
        }

        let mut response = HandlerResponse::new(outcome.status_code, outcome.body);
        if let Some(ct) = outcome.headers.get("content-type") {
            response = response.with_header("content-type", ct);
        }
        Ok(response)
    }

    async fn execute(
        &self,
        service: &ExternalService,
        method: Method,
        path: &str,
        payload: Payload,
        query: &[(String, String)],
        options: &SendOptions,
    ) -> Result<ServiceResponse> {
        if !service.is_active {
            return Err(Error::BadRequest(format!(
                "service '{}' is not active",
                service.name
            )));
        }

        let limits = &service.rate_limit_config;
        if let Decision::Limited { retry_after } = self.limiter.check(
            &rate_key(service.id),
            limits.max_requests,
            Duration::from_secs(limits.time_window),
        ) {
            tracing::warn!(
                service_id = service.id,
                retry_after_secs = retry_after.as_secs(),
                "outbound rate limit reached"
            );
            return Err(Error::RateLimited(format!(
                "rate limit for service '{}' exceeded, retry in {}s",
                service.name,
                retry_after.as_secs().max(1)
            )));
        }

        let url = service.url_for(path);
        let headers = self.build_headers(service, options).await?;
        let timeout = Duration::from_secs(options.timeout.unwrap_or(service.timeout).max(1));
        let retry = &service.retry_config;
        let started = Instant::now();
        let mut attempt_no = 0;

        let last = loop {
            attempt_no += 1;
            let mut builder = self
                .client
                .request(method.clone(), &url)
                .timeout(timeout)
                .query(query);
            for (name, value) in &headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            builder = payload.apply(builder);

            tracing::debug!(url = %url, method = %method, attempt = attempt_no, "sending request");
            let attempt = run_attempt(builder).await;

            if !attempt.success()
                && attempt_no <= retry.max_retries
                && retry.should_retry(attempt.status_code)
            {
                let backoff = retry.backoff(attempt_no);
                tracing::warn!(
                    url = %url,
                    status = attempt.status_code,
                    attempt = attempt_no,
                    wait_ms = backoff.as_millis() as u64,
                    "transient failure, retrying with backoff"
                );
                tokio::time::sleep(backoff).await;
                continue;
            }
            break attempt;
        };

        let response = ServiceResponse {
            success: last.success(),
            status_code: last.status_code,
            body: last.body,
            headers: last.headers,
            error: last.error,
            attempts: attempt_no,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        self.track_health(service, response.status_code).await;
        if !response.success {
            self.event_log
                .warning(
                    "connector",
                    &format!("request to service '{}' failed", service.name),
                    json!({
                        "service_id": service.id,
                        "url": url,
                        "status_code": response.status_code,
                        "attempts": response.attempts,
                        "error": response.error,
                    }),
                )
                .await;
        }
        Ok(response)
    }

    /// Defaults, then service headers, then auth, then per-call overrides.
    async fn build_headers(
        &self,
        service: &ExternalService,
        options: &SendOptions,
    ) -> Result<BTreeMap<String, String>> {
        let mut headers = BTreeMap::new();
        headers.insert("accept".to_string(), "application/json".to_string());
        headers.insert("user-agent".to_string(), USER_AGENT.to_string());
        for (name, value) in string_map(&service.default_headers) {
            headers.insert(name.to_ascii_lowercase(), value);
        }
        for (name, value) in self.auth_headers(service).await? {
            headers.insert(name.to_ascii_lowercase(), value);
        }
        for (name, value) in &options.headers {
            headers.insert(name.to_ascii_lowercase(), value.clone());
        }
        Ok(headers)
    }

    async fn auth_headers(&self, service: &ExternalService) -> Result<Vec<(String, String)>> {
        Ok(match AuthConfig::resolve(service)? {
            AuthConfig::None => Vec::new(),
            AuthConfig::ApiKey { header_name, key } => vec![(header_name, key)],
            AuthConfig::Bearer { token } => {
                vec![("authorization".into(), format!("Bearer {}", token))]
            }
            AuthConfig::Basic { username, password } => {
                let encoded = BASE64.encode(format!("{}:{}", username, password));
                vec![("authorization".into(), format!("Basic {}", encoded))]
            }
            AuthConfig::OAuth2 {
                token_url,
                client_id,
                client_secret,
                scope,
            } => {
                let token = self
                    .oauth_token(service.id, &token_url, &client_id, &client_secret, scope)
                    .await?;
                vec![("authorization".into(), format!("Bearer {}", token))]
            }
            AuthConfig::Custom { headers } => headers.into_iter().collect(),
        })
    }

    /// Client-credentials token, cached until shortly before it expires.
    async fn oauth_token(
        &self,
        service_id: i64,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        scope: Option<String>,
    ) -> Result<String> {
        if let Some(cached) = self.tokens.read().await.get(&service_id) {
            if cached.expires_at > Instant::now() {
                return Ok(cached.access_token.clone());
            }
        }

        let mut params = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", client_id.to_string()),
            ("client_secret", client_secret.to_string()),
        ];
        if let Some(scope) = scope {
            params.push(("scope", scope));
        }

        let response = self
            .client
            .post(token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("oauth2 token request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "oauth2 token endpoint answered {}",
                response.status()
            )));
        }

        let body: JsonValue = response.json().await?;
        let access_token = body
            .get("access_token")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| Error::Transport("oauth2 response has no access_token".into()))?
            .to_string();
        let expires_in = body
            .get("expires_in")
            .and_then(JsonValue::as_u64)
            .unwrap_or(3600);
        let lifetime = Duration::from_secs(expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);

        self.tokens.write().await.insert(
            service_id,
            CachedToken {
                access_token: access_token.clone(),
                expires_at: Instant::now() + lifetime,
            },
        );
        tracing::debug!(service_id, expires_in, "cached oauth2 token");
        Ok(access_token)
    }

    /// Real traffic updates health too: 2xx is healthy, no response or 5xx
    /// is unhealthy. Other codes say nothing about reachability.
    async fn track_health(&self, service: &ExternalService, status_code: u16) {
        let observed = match status_code {
            200..=299 => HealthStatus::Healthy,
            0 | 500..=599 => HealthStatus::Unhealthy,
            _ => return,
        };
        let current = self
            .cache
            .read()
            .await
            .get(&service.id)
            .map(|s| s.health_status)
            .unwrap_or(service.health_status);
        if current == observed {
            return;
        }
        if let Err(e) = self.persist_health(service.id, observed).await {
            tracing::warn!(service_id = service.id, error = %e, "failed to record health status");
        }
    }

    async fn persist_health(&self, service_id: i64, status: HealthStatus) -> Result<ExternalService> {
        let mut fields = Map::new();
        fields.insert("health_status".into(), serde_json::to_value(status)?);
        fields.insert("last_health_check".into(), json!(Utc::now()));
        let updated = self.services.update(service_id, fields).await?;
        if let Some(cached) = self.cache.write().await.get_mut(&service_id) {
            cached.health_status = updated.health_status;
            cached.last_health_check = updated.last_health_check;
        }
        Ok(updated)
    }

    async fn probe(&self, service: &ExternalService) -> Result<(Attempt, u64)> {
        let headers = self.build_headers(service, &SendOptions::default()).await?;
        let mut builder = self
            .client
            .get(service.url_for(&service.health_check_path))
            .timeout(Duration::from_secs(service.timeout.max(1)));
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let started = Instant::now();
        let attempt = run_attempt(builder).await;
        Ok((attempt, started.elapsed().as_millis() as u64))
    }

    /// GET against the health path: the expected code is healthy, any other
    /// 2xx-4xx is degraded, anything else unhealthy.
    pub async fn health_check(&self, service_id: i64) -> Result<HealthReport> {
        let service = self.service(service_id).await?;
        let (attempt, elapsed) = self.probe(&service).await?;
        let status = classify_health(attempt.status_code, service.expected_status);
        self.persist_health(service.id, status).await?;

        tracing::info!(
            service_id,
            status_code = attempt.status_code,
            health = ?status,
            "health check finished"
        );
        Ok(HealthReport {
            service_id,
            status,
            status_code: attempt.status_code,
            response_time_ms: elapsed,
            error: attempt.error,
        })
    }

    /// Like [`health_check`](Self::health_check) without recording the
    /// outcome, for validating a configuration.
    pub async fn test_connection(&self, service_id: i64) -> Result<HealthReport> {
        let service = self.services.get(service_id).await?;
        let (attempt, elapsed) = self.probe(&service).await?;
        Ok(HealthReport {
            service_id,
            status: classify_health(attempt.status_code, service.expected_status),
            status_code: attempt.status_code,
            response_time_ms: elapsed,
            error: attempt.error,
        })
    }
}

fn rate_key(service_id: i64) -> String {
    format!("service:{}", service_id)
}

fn parse_method(method: &str) -> Result<Method> {
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| Error::BadRequest(format!("invalid HTTP method '{}'", method)))
}

fn query_pairs(data: Option<&JsonValue>) -> Vec<(String, String)> {
    match data {
        Some(JsonValue::Object(map)) => map
            .iter()
            .map(|(k, v)| (k.clone(), scalar_to_string(v)))
            .collect(),
        _ => Vec::new(),
    }
}

pub fn classify_health(status_code: u16, expected: u16) -> HealthStatus {
    if status_code == expected {
        HealthStatus::Healthy
    } else if (200..500).contains(&status_code) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

async fn run_attempt(builder: reqwest::RequestBuilder) -> Attempt {
    match builder.send().await {
        Ok(response) => {
            let status_code = response.status().as_u16();
            let headers: BTreeMap<String, String> = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            let text = response.text().await.unwrap_or_default();
            let body = if text.is_empty() {
                JsonValue::Null
            } else {
                serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
            };
            let error = if (200..300).contains(&status_code) {
                None
            } else {
                Some(format!("upstream answered {}", status_code))
            };
            Attempt {
                status_code,
                body,
                headers,
                error,
            }
        }
        Err(e) => Attempt {
            status_code: 0,
            body: JsonValue::Null,
            headers: BTreeMap::new(),
            error: Some(e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(auth_type: AuthType, auth_config: JsonValue) -> ExternalService {
        serde_json::from_value(json!({
            "name": "crm",
            "base_url": "http://localhost",
            "auth_type": auth_type,
            "auth_config": auth_config,
            "last_health_check": null,
            "created_at": Utc::now(),
            "updated_at": Utc::now(),
        }))
        .unwrap()
    }

    #[test]
    fn health_classification() {
        assert_eq!(classify_health(200, 200), HealthStatus::Healthy);
        assert_eq!(classify_health(204, 200), HealthStatus::Degraded);
        assert_eq!(classify_health(404, 200), HealthStatus::Degraded);
        assert_eq!(classify_health(503, 200), HealthStatus::Unhealthy);
        assert_eq!(classify_health(0, 200), HealthStatus::Unhealthy);
    }

    #[test]
    fn auth_config_resolution() {
        let svc = service(AuthType::ApiKey, json!({"api_key": "k"}));
        assert_eq!(
            AuthConfig::resolve(&svc).unwrap(),
            AuthConfig::ApiKey {
                header_name: "X-API-Key".into(),
                key: "k".into()
            }
        );

        let svc = service(AuthType::Bearer, json!({}));
        assert!(matches!(AuthConfig::resolve(&svc), Err(Error::BadRequest(_))));
    }

    #[test]
    fn form_payload_stringifies_scalars() {
        let payload = Payload::from_data(Some(&json!({"a": 1, "b": "x"})), ContentType::Form);
        let Payload::Form(fields) = payload else {
            panic!("expected form payload");
        };
        assert!(fields.contains(&("a".to_string(), "1".to_string())));
        assert!(fields.contains(&("b".to_string(), "x".to_string())));
    }
}
