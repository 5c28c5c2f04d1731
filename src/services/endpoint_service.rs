//! Operator-defined endpoints and the route table compiled from them.

use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use serde_json::{json, Map, Value as JsonValue};
use tokio::sync::RwLock;

use crate::database::{store::Store, table::Table};
use crate::dto::endpoint_dto::{CreateEndpointPayload, EndpointListQuery, UpdateEndpointPayload};
use crate::error::{Error, Result};
use crate::models::endpoint::{Endpoint, HandlerType, HttpMethod, PermissionType};
use crate::services::event_bus::{EventBus, SystemEvent};
use crate::utils::token::{generate_credential, API_KEY_PREFIX, SECRET_PREFIX};

pub struct CompiledRoute {
    pub endpoint: Endpoint,
    pattern: Regex,
    param_count: usize,
}

impl CompiledRoute {
    fn captures(&self, path: &str) -> Option<Map<String, JsonValue>> {
        let caps = self.pattern.captures(path)?;
        Some(
            self.pattern
                .capture_names()
                .flatten()
                .filter_map(|name| {
                    caps.name(name)
                        .map(|m| (name.to_string(), JsonValue::String(m.as_str().to_string())))
                })
                .collect(),
        )
    }
}

/// Turns `custom/orders/{order_id}` into `^custom/orders/(?P<order_id>[^/]+)$`.
pub fn compile_pattern(path: &str) -> Result<(Regex, usize)> {
    let placeholder = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| Error::Internal(e.to_string()))?;
    let mut expr = String::from("^");
    let mut last = 0;
    let mut params = 0;
    for caps in placeholder.captures_iter(path) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        expr.push_str(&regex::escape(&path[last..whole.start()]));
        expr.push_str(&format!("(?P<{}>[^/]+)", name.as_str()));
        last = whole.end();
        params += 1;
    }
    expr.push_str(&regex::escape(&path[last..]));
    expr.push('$');
    let regex = Regex::new(&expr)
        .map_err(|e| Error::BadRequest(format!("invalid route pattern '{}': {}", path, e)))?;
    Ok((regex, params))
}

#[derive(Default)]
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
}

impl RouteTable {
    /// Compiles every active definition. Literal routes are tried before
    /// parameterised ones; broken patterns are skipped with a warning.
    pub fn register_all(definitions: Vec<Endpoint>) -> Self {
        let mut routes: Vec<CompiledRoute> = definitions
            .into_iter()
            .filter(|e| e.is_active)
            .filter_map(|endpoint| match compile_pattern(&endpoint.full_path()) {
                Ok((pattern, param_count)) => Some(CompiledRoute {
                    endpoint,
                    pattern,
                    param_count,
                }),
                Err(e) => {
                    tracing::warn!(endpoint_id = endpoint.id, error = %e, "skipping endpoint");
                    None
                }
            })
            .collect();
        routes.sort_by(|a, b| {
            a.param_count
                .cmp(&b.param_count)
                .then_with(|| b.endpoint.full_path().len().cmp(&a.endpoint.full_path().len()))
        });
        Self { routes }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// `path` is relative to the API base, e.g. `custom/orders/7`.
    pub fn resolve(&self, method: HttpMethod, path: &str) -> Option<(Endpoint, Map<String, JsonValue>)> {
        let path = path.trim_matches('/');
        self.routes
            .iter()
            .filter(|r| r.endpoint.method == method)
            .find_map(|r| r.captures(path).map(|params| (r.endpoint.clone(), params)))
    }

    /// Whether any method is bound to `path`.
    pub fn path_exists(&self, path: &str) -> bool {
        let path = path.trim_matches('/');
        self.routes.iter().any(|r| r.pattern.is_match(path))
    }
}

fn parse_enum<T: std::str::FromStr<Err = String>>(raw: &str) -> Result<T> {
    raw.parse().map_err(Error::BadRequest)
}

fn validate_slug(slug: &str) -> Result<()> {
    let ok = !slug.is_empty()
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::BadRequest(
            "slug may only contain lowercase letters, digits, '-' and '_'".into(),
        ))
    }
}

/// Checks the handler configuration that dispatch cannot do without.
fn validate_handler_config(handler_type: HandlerType, config: &JsonValue) -> Result<()> {
    let has = |key: &str| config.get(key).map(|v| !v.is_null()).unwrap_or(false);
    let missing = match handler_type {
        HandlerType::Webhook => None,
        HandlerType::Action => (!has("action")).then_some("action"),
        HandlerType::Script => (!has("script")).then_some("script"),
        HandlerType::Forward => (!has("service_id")).then_some("service_id"),
        HandlerType::Etl => (!has("template_id")).then_some("template_id"),
    };
    match missing {
        Some(key) => Err(Error::BadRequest(format!(
            "handler_config.{} is required for this handler type",
            key
        ))),
        None => Ok(()),
    }
}

#[derive(Clone)]
pub struct EndpointService {
    endpoints: Table<Endpoint>,
    events: Arc<EventBus>,
    routes: Arc<RwLock<Option<Arc<RouteTable>>>>,
}

impl EndpointService {
    pub fn new(store: Arc<dyn Store>, events: Arc<EventBus>) -> Self {
        Self {
            endpoints: Table::new(store),
            events,
            routes: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn list(&self, query: &EndpointListQuery) -> Result<Vec<Endpoint>> {
        let handler_type = query
            .handler_type
            .as_deref()
            .map(parse_enum::<HandlerType>)
            .transpose()?;
        let mut endpoints: Vec<Endpoint> = self
            .endpoints
            .all()
            .await?
            .into_iter()
            .filter(|e| handler_type.map(|t| e.handler_type == t).unwrap_or(true))
            .filter(|e| query.active.map(|a| e.is_active == a).unwrap_or(true))
            .collect();
        endpoints.sort_by_key(|e| e.id);
        Ok(endpoints)
    }

    pub async fn get(&self, id: i64) -> Result<Endpoint> {
        self.endpoints.get(id).await
    }

    pub async fn find_by_slug(&self, slug: &str) -> Result<Vec<Endpoint>> {
        self.endpoints.find_by("slug", json!(slug)).await
    }

    async fn ensure_unique(&self, candidate: &Endpoint) -> Result<()> {
        if !candidate.is_active {
            return Ok(());
        }
        let path = candidate.full_path();
        let clash = self
            .find_by_slug(&candidate.slug)
            .await?
            .into_iter()
            .any(|e| {
                e.id != candidate.id
                    && e.is_active
                    && e.method == candidate.method
                    && e.full_path() == path
            });
        if clash {
            return Err(Error::BadRequest(format!(
                "an active {} endpoint already serves /{}",
                candidate.method, path
            )));
        }
        Ok(())
    }

    fn check(endpoint: &Endpoint) -> Result<()> {
        validate_slug(&endpoint.slug)?;
        validate_handler_config(endpoint.handler_type, &endpoint.handler_config)?;
        compile_pattern(&endpoint.full_path())?;
        Ok(())
    }

    pub async fn create(&self, payload: CreateEndpointPayload) -> Result<Endpoint> {
        let now = Utc::now();
        let endpoint = Endpoint {
            id: 0,
            name: payload.name,
            slug: payload.slug,
            route: payload.route.trim_matches('/').to_string(),
            method: parse_enum(&payload.method)?,
            handler_type: parse_enum(&payload.handler_type)?,
            handler_config: payload.handler_config,
            permission_type: parse_enum::<PermissionType>(&payload.permission_type)?,
            permission_config: payload.permission_config,
            is_active: payload.is_active.unwrap_or(true),
            description: payload.description,
            rate_limit_requests: payload.rate_limit_requests,
            rate_limit_window: payload.rate_limit_window,
            cache_ttl: payload.cache_ttl,
            timeout: payload.timeout,
            retry_count: payload.retry_count,
            created_at: now,
            updated_at: now,
        };
        Self::check(&endpoint)?;
        self.ensure_unique(&endpoint).await?;

        let endpoint = self.endpoints.insert(&endpoint).await?;
        self.invalidate().await;
        self.events.publish(SystemEvent::EndpointCreated {
            endpoint_id: endpoint.id,
        });
        tracing::info!(endpoint_id = endpoint.id, path = %endpoint.full_path(), "endpoint created");
        Ok(endpoint)
    }

    pub async fn update(&self, id: i64, payload: UpdateEndpointPayload) -> Result<Endpoint> {
        let mut endpoint = self.endpoints.get(id).await?;
        if let Some(name) = payload.name {
            endpoint.name = name;
        }
        if let Some(slug) = payload.slug {
            endpoint.slug = slug;
        }
        if let Some(route) = payload.route {
            endpoint.route = route.trim_matches('/').to_string();
        }
        if let Some(method) = payload.method {
            endpoint.method = parse_enum(&method)?;
        }
        if let Some(handler_type) = payload.handler_type {
            endpoint.handler_type = parse_enum(&handler_type)?;
        }
        if let Some(config) = payload.handler_config {
            endpoint.handler_config = config;
        }
        if let Some(permission_type) = payload.permission_type {
            endpoint.permission_type = parse_enum(&permission_type)?;
        }
        if let Some(config) = payload.permission_config {
            endpoint.permission_config = config;
        }
        if let Some(active) = payload.is_active {
            endpoint.is_active = active;
        }
        if payload.description.is_some() {
            endpoint.description = payload.description;
        }
        if let Some(v) = payload.rate_limit_requests {
            endpoint.rate_limit_requests = v;
        }
        if let Some(v) = payload.rate_limit_window {
            endpoint.rate_limit_window = v;
        }
        if let Some(v) = payload.cache_ttl {
            endpoint.cache_ttl = v;
        }
        if let Some(v) = payload.timeout {
            endpoint.timeout = v;
        }
        if let Some(v) = payload.retry_count {
            endpoint.retry_count = v;
        }
        endpoint.updated_at = Utc::now();

        Self::check(&endpoint)?;
        self.ensure_unique(&endpoint).await?;

        let endpoint = self.endpoints.save(&endpoint).await?;
        self.invalidate().await;
        self.events.publish(SystemEvent::EndpointUpdated { endpoint_id: id });
        Ok(endpoint)
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        self.endpoints.get(id).await?;
        self.endpoints.delete(id).await?;
        self.invalidate().await;
        self.events.publish(SystemEvent::EndpointDeleted { endpoint_id: id });
        tracing::info!(endpoint_id = id, "endpoint deleted");
        Ok(())
    }

    /// Issues a fresh credential for signature or api-key endpoints. A new
    /// signature secret replaces the old one; a new api key is appended so
    /// existing callers keep working until the old key is removed.
    pub async fn rotate_credential(&self, id: i64) -> Result<String> {
        let mut endpoint = self.endpoints.get(id).await?;
        let mut config = match endpoint.permission_config.take() {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        };
        let credential = match endpoint.permission_type {
            PermissionType::Signature => {
                let secret = generate_credential(SECRET_PREFIX, 40);
                config.insert("secret".into(), json!(secret));
                secret
            }
            PermissionType::ApiKey => {
                let key = generate_credential(API_KEY_PREFIX, 32);
                let mut keys = match config.remove("keys") {
                    Some(JsonValue::Array(keys)) => keys,
                    _ => Vec::new(),
                };
                keys.push(json!(key));
                config.insert("keys".into(), JsonValue::Array(keys));
                key
            }
            other => {
                return Err(Error::BadRequest(format!(
                    "{:?} endpoints have no rotatable credential",
                    other
                )))
            }
        };
        endpoint.permission_config = JsonValue::Object(config);
        endpoint.updated_at = Utc::now();
        self.endpoints.save(&endpoint).await?;
        self.invalidate().await;
        self.events.publish(SystemEvent::EndpointUpdated { endpoint_id: id });
        tracing::info!(endpoint_id = id, "endpoint credential rotated");
        Ok(credential)
    }

    pub async fn invalidate(&self) {
        *self.routes.write().await = None;
    }

    /// The compiled route table, rebuilt lazily after any write.
    pub async fn route_table(&self) -> Result<Arc<RouteTable>> {
        if let Some(table) = self.routes.read().await.as_ref() {
            return Ok(table.clone());
        }
        let mut slot = self.routes.write().await;
        if let Some(table) = slot.as_ref() {
            return Ok(table.clone());
        }
        let table = Arc::new(RouteTable::register_all(self.endpoints.all().await?));
        tracing::debug!(routes = table.len(), "compiled endpoint routes");
        *slot = Some(table.clone());
        Ok(table)
    }

    pub async fn resolve(
        &self,
        method: &str,
        path: &str,
    ) -> Result<Option<(Endpoint, Map<String, JsonValue>)>> {
        let Ok(method) = method.parse::<HttpMethod>() else {
            return Ok(None);
        };
        Ok(self.route_table().await?.resolve(method, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{ensure_schema, memory::MemoryStore};

    fn payload(slug: &str, route: &str, method: &str) -> CreateEndpointPayload {
        serde_json::from_value(json!({
            "name": slug,
            "slug": slug,
            "route": route,
            "method": method,
            "handler_type": "webhook",
        }))
        .unwrap()
    }

    async fn service() -> EndpointService {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        ensure_schema(store.as_ref()).await.unwrap();
        EndpointService::new(store, Arc::new(EventBus::default()))
    }

    #[test]
    fn patterns_capture_named_params() {
        let (re, params) = compile_pattern("custom/orders/{order_id}/items/{item}").unwrap();
        assert_eq!(params, 2);
        let caps = re.captures("custom/orders/7/items/abc").unwrap();
        assert_eq!(&caps["order_id"], "7");
        assert_eq!(&caps["item"], "abc");
        assert!(!re.is_match("custom/orders/7/items"));
        assert!(!re.is_match("custom/orders/7/items/a/b"));
    }

    #[test]
    fn literal_dots_are_escaped() {
        let (re, _) = compile_pattern("custom/feed.xml").unwrap();
        assert!(re.is_match("custom/feed.xml"));
        assert!(!re.is_match("custom/feedxxml"));
    }

    #[tokio::test]
    async fn resolves_by_method_and_path() {
        let svc = service().await;
        svc.create(payload("orders", "", "POST")).await.unwrap();
        svc.create(payload("orders", "{id}", "GET")).await.unwrap();
        svc.create(payload("orders", "latest", "GET")).await.unwrap();

        let (ep, params) = svc.resolve("POST", "/custom/orders").await.unwrap().unwrap();
        assert_eq!(ep.method, HttpMethod::Post);
        assert!(params.is_empty());

        let (ep, _) = svc.resolve("GET", "custom/orders/latest").await.unwrap().unwrap();
        assert_eq!(ep.route, "latest");

        let (_, params) = svc.resolve("GET", "custom/orders/42").await.unwrap().unwrap();
        assert_eq!(params["id"], "42");

        assert!(svc.resolve("DELETE", "custom/orders").await.unwrap().is_none());
        assert!(svc.resolve("GET", "custom/unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_active_routes_are_rejected() {
        let svc = service().await;
        svc.create(payload("orders", "", "POST")).await.unwrap();
        let err = svc.create(payload("orders", "/", "POST")).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));

        let mut inactive = payload("orders", "", "POST");
        inactive.is_active = Some(false);
        assert!(svc.create(inactive).await.is_ok());
    }

    #[tokio::test]
    async fn writes_invalidate_route_table() {
        let svc = service().await;
        let ep = svc.create(payload("orders", "", "POST")).await.unwrap();
        assert!(svc.resolve("POST", "custom/orders").await.unwrap().is_some());

        svc.update(
            ep.id,
            UpdateEndpointPayload {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(svc.resolve("POST", "custom/orders").await.unwrap().is_none());

        svc.delete(ep.id).await.unwrap();
        assert!(matches!(svc.get(ep.id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn handler_config_requirements() {
        let svc = service().await;
        let mut p = payload("sync", "", "POST");
        p.handler_type = "etl".into();
        assert!(matches!(svc.create(p).await, Err(Error::BadRequest(_))));

        let mut p = payload("Bad Slug", "", "POST");
        p.handler_type = "webhook".into();
        assert!(svc.create(p).await.is_err());

        let p = payload("orders", "", "TRACE");
        assert!(svc.create(p).await.is_err());
    }

    #[tokio::test]
    async fn api_keys_accumulate_on_rotation() {
        let svc = service().await;
        let mut p = payload("orders", "", "POST");
        p.permission_type = "api_key".into();
        p.permission_config = json!({ "keys": ["old"] });
        let ep = svc.create(p).await.unwrap();

        let key = svc.rotate_credential(ep.id).await.unwrap();
        let keys = svc.get(ep.id).await.unwrap().permission_config["keys"].clone();
        assert_eq!(keys, json!(["old", key]));

        let public = svc.create(payload("open", "", "GET")).await.unwrap();
        assert!(matches!(
            svc.rotate_credential(public.id).await,
            Err(Error::BadRequest(_))
        ));
    }
}
