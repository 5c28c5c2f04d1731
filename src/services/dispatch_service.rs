//! Runs one inbound call against its endpoint definition.
//!
//! Order: `before` interceptors, inbound rate limit, permission check, the
//! handler strategy (inside a failure boundary), response cache, `after`
//! interceptors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::dto::dispatch_dto::{HandlerResponse, InboundRequest};
use crate::error::{Error, Result};
use crate::middleware::rate_limit::{Decision, RateLimiter};
use crate::models::endpoint::{Endpoint, HandlerType, HttpMethod};
use crate::services::{
    connector_service::{ConnectorService, ForwardConfig},
    etl::EtlEngine,
    event_log_service::EventLogService,
    extensions::{Extensions, ScriptOutput},
    permission_service::PermissionService,
    settings_service::SettingsService,
    webhook_service::WebhookService,
};

#[derive(Debug, Deserialize)]
struct ActionConfig {
    action: String,
    /// Static body returned when no hook overrides the outcome.
    response: Option<JsonValue>,
    #[serde(default = "default_status")]
    status: u16,
}

#[derive(Debug, Deserialize)]
struct ScriptConfig {
    script: String,
}

#[derive(Debug, Deserialize)]
struct EtlConfig {
    template_id: i64,
}

fn default_status() -> u16 {
    200
}

fn handler_config<T: for<'de> Deserialize<'de>>(endpoint: &Endpoint) -> Result<T> {
    serde_json::from_value(endpoint.handler_config.clone())
        .map_err(|e| Error::BadRequest(format!("invalid handler configuration: {}", e)))
}

/// A hook outcome shaped `{status, body, headers}` is used as the response;
/// anything else becomes a 200 JSON body.
fn response_from_value(value: JsonValue) -> HandlerResponse {
    let is_envelope = value
        .as_object()
        .map(|o| o.contains_key("status") && o.contains_key("body"))
        .unwrap_or(false);
    if is_envelope {
        if let Ok(response) = serde_json::from_value::<HandlerResponse>(value.clone()) {
            return response;
        }
    }
    HandlerResponse::ok(value)
}

/// Stale responses are swept when a new key arrives past this many entries.
const CACHE_SWEEP_THRESHOLD: usize = 512;

struct CachedResponse {
    stored_at: Instant,
    ttl: Duration,
    response: HandlerResponse,
}

impl CachedResponse {
    fn is_fresh(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) < self.ttl
    }
}

fn store_cached(cache: &mut HashMap<String, CachedResponse>, key: String, entry: CachedResponse) {
    if cache.len() >= CACHE_SWEEP_THRESHOLD && !cache.contains_key(&key) {
        let now = entry.stored_at;
        cache.retain(|_, cached| cached.is_fresh(now));
    }
    cache.insert(key, entry);
}

#[derive(Clone)]
pub struct DispatchService {
    extensions: Arc<Extensions>,
    permissions: PermissionService,
    webhooks: WebhookService,
    etl: EtlEngine,
    connector: ConnectorService,
    settings: SettingsService,
    event_log: EventLogService,
    config: Arc<Config>,
    limiter: RateLimiter,
    cache: Arc<Mutex<HashMap<String, CachedResponse>>>,
}

impl DispatchService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        extensions: Arc<Extensions>,
        permissions: PermissionService,
        webhooks: WebhookService,
        etl: EtlEngine,
        connector: ConnectorService,
        settings: SettingsService,
        event_log: EventLogService,
        config: Arc<Config>,
    ) -> Self {
        Self {
            extensions,
            permissions,
            webhooks,
            etl,
            connector,
            settings,
            event_log,
            config,
            limiter: RateLimiter::new(),
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn dispatch(&self, request: &InboundRequest, endpoint: &Endpoint) -> HandlerResponse {
        let interceptors = self.extensions.interceptors();
        for interceptor in &interceptors {
            if let Some(response) = interceptor.before(request, endpoint).await {
                tracing::debug!(endpoint_id = endpoint.id, "dispatch short-circuited");
                return response;
            }
        }

        let mut response = self.guarded(request, endpoint).await;

        for interceptor in &interceptors {
            response = interceptor.after(request, endpoint, response).await;
        }
        response
    }

    async fn guarded(&self, request: &InboundRequest, endpoint: &Endpoint) -> HandlerResponse {
        if endpoint.rate_limit_requests > 0 {
            let key = format!(
                "endpoint:{}:{}",
                endpoint.id,
                request.client_ip().unwrap_or_else(|| "unknown".into())
            );
            let window = Duration::from_secs(endpoint.rate_limit_window.max(1));
            if let Decision::Limited { retry_after } =
                self.limiter.check(&key, endpoint.rate_limit_requests, window)
            {
                let secs = retry_after.as_secs().max(1);
                return HandlerResponse::error(429, "Too many requests")
                    .with_header("retry-after", &secs.to_string());
            }
        }

        match self.permissions.check(request, endpoint).await {
            Ok(()) => {}
            Err(e @ (Error::Unauthorized(_) | Error::Forbidden(_))) => {
                tracing::info!(endpoint_id = endpoint.id, error = %e, "permission denied");
                let status = e.status_code().as_u16();
                let message = if status == 401 { "Unauthorized" } else { "Forbidden" };
                return HandlerResponse::error(status, message);
            }
            // A malformed rule is a server-side failure.
            Err(e) => return self.failure(endpoint, e).await,
        }

        let cache_key = self.cache_key(request, endpoint);
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cached(key).await {
                return hit.with_header("x-cache", "HIT");
            }
        }

        let response = match self.run_strategy(request, endpoint).await {
            Ok(response) => response,
            Err(e) => self.failure(endpoint, e).await,
        };

        if let Some(key) = cache_key {
            if response.is_success() {
                store_cached(
                    &mut *self.cache.lock().await,
                    key,
                    CachedResponse {
                        stored_at: Instant::now(),
                        ttl: Duration::from_secs(endpoint.cache_ttl),
                        response: response.clone(),
                    },
                );
            }
        }
        response
    }

    fn cache_key(&self, request: &InboundRequest, endpoint: &Endpoint) -> Option<String> {
        if endpoint.cache_ttl == 0 || endpoint.method != HttpMethod::Get {
            return None;
        }
        let mut query: Vec<String> = request
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        query.sort();
        Some(format!(
            "{}:{}?{}",
            endpoint.id,
            request.path.trim_matches('/'),
            query.join("&")
        ))
    }

    async fn cached(&self, key: &str) -> Option<HandlerResponse> {
        let mut cache = self.cache.lock().await;
        let fresh = cache.get(key).map(|entry| entry.is_fresh(Instant::now()))?;
        if fresh {
            cache.get(key).map(|entry| entry.response.clone())
        } else {
            cache.remove(key);
            None
        }
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }

    /// Client errors keep their message. Anything else is a 500 whose detail
    /// is only shown in debug mode.
    async fn failure(&self, endpoint: &Endpoint, error: Error) -> HandlerResponse {
        let status = error.status_code().as_u16();
        if error.is_client_error() {
            return HandlerResponse::error(status, client_message(&error));
        }

        tracing::error!(endpoint_id = endpoint.id, error = %error, "handler failed");
        self.event_log
            .error(
                "dispatch",
                &format!("handler for endpoint '{}' failed", endpoint.slug),
                json!({ "endpoint_id": endpoint.id, "error": error.to_string() }),
            )
            .await;

        let status = if status == 502 { 502 } else { 500 };
        let mut body = json!({ "error": "Internal server error" });
        if self.config.debug || self.settings.get_bool("debug_mode").await {
            body["message"] = json!(error.to_string());
        }
        HandlerResponse::new(status, body)
    }

    async fn run_strategy(&self, request: &InboundRequest, endpoint: &Endpoint) -> Result<HandlerResponse> {
        match endpoint.handler_type {
            HandlerType::Webhook => self.webhooks.receive(request, endpoint).await,
            HandlerType::Etl => {
                let config: EtlConfig = handler_config(endpoint)?;
                self.etl.process(request, config.template_id, endpoint).await
            }
            // Stateless strategies may be retried on server-side failure.
            HandlerType::Action | HandlerType::Script | HandlerType::Forward => {
                let mut attempt = 0;
                loop {
                    match self.stateless(request, endpoint).await {
                        Err(e) if !e.is_client_error() && attempt < endpoint.retry_count => {
                            attempt += 1;
                            tracing::warn!(endpoint_id = endpoint.id, attempt, error = %e, "retrying handler");
                        }
                        other => return other,
                    }
                }
            }
        }
    }

    async fn stateless(&self, request: &InboundRequest, endpoint: &Endpoint) -> Result<HandlerResponse> {
        match endpoint.handler_type {
            HandlerType::Action => {
                let config: ActionConfig = handler_config(endpoint)?;
                let data = request.params();
                let outcome = self
                    .extensions
                    .fire_action(&config.action, &data, Some(endpoint))
                    .await?;
                Ok(match (outcome, config.response) {
                    (Some(value), _) => response_from_value(value),
                    (None, Some(body)) => HandlerResponse::new(config.status, body),
                    (None, None) => HandlerResponse::new(
                        config.status,
                        json!({ "success": true, "message": "Action executed" }),
                    ),
                })
            }
            HandlerType::Script => {
                let config: ScriptConfig = handler_config(endpoint)?;
                let handler = self.extensions.scripts.get(&config.script).map_err(|_| {
                    Error::BadRequest(format!("script '{}' is not registered", config.script))
                })?;
                let data = request.params();
                match handler.call(&data, endpoint, request).await? {
                    ScriptOutput::Response(response) => Ok(response),
                    ScriptOutput::Data(value) => Ok(HandlerResponse::ok(value)),
                }
            }
            HandlerType::Forward => {
                let mut config: ForwardConfig = handler_config(endpoint)?;
                config.timeout = config.timeout.or(Some(endpoint.timeout));
                self.connector.forward(request, &config).await
            }
            HandlerType::Webhook | HandlerType::Etl => Err(Error::Internal(format!(
                "{:?} endpoints are not stateless",
                endpoint.handler_type
            ))),
        }
    }
}

fn client_message(error: &Error) -> String {
    match error {
        Error::BadRequest(m)
        | Error::Unauthorized(m)
        | Error::Forbidden(m)
        | Error::NotFound(m)
        | Error::RateLimited(m) => m.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_cache_entries_are_swept_on_insert() {
        let start = Instant::now();
        let entry = |at: Instant, ttl: u64| CachedResponse {
            stored_at: at,
            ttl: Duration::from_secs(ttl),
            response: HandlerResponse::ok(json!({})),
        };
        let mut cache = HashMap::new();
        for i in 0..CACHE_SWEEP_THRESHOLD - 1 {
            store_cached(&mut cache, format!("short:{}", i), entry(start, 5));
        }
        store_cached(&mut cache, "long".into(), entry(start, 600));
        assert_eq!(cache.len(), CACHE_SWEEP_THRESHOLD);

        store_cached(&mut cache, "new".into(), entry(start + Duration::from_secs(10), 60));
        assert_eq!(cache.len(), 2);
        assert!(cache.contains_key("long"));
        assert!(cache.contains_key("new"));
    }

    #[test]
    fn hook_envelopes_become_responses() {
        let response = response_from_value(json!({"status": 202, "body": {"queued": true}}));
        assert_eq!(response.status, 202);
        assert_eq!(response.body, json!({"queued": true}));

        let plain = response_from_value(json!({"status": "ok"}));
        assert_eq!(plain.status, 200);
        assert_eq!(plain.body, json!({"status": "ok"}));
    }

    #[test]
    fn client_errors_keep_their_text() {
        assert_eq!(client_message(&Error::BadRequest("bad".into())), "bad");
        assert_eq!(client_message(&Error::NotFound("gone".into())), "gone");
    }
}
