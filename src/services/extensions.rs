//! Typed extension points. Collaborators register implementations at startup,
//! before the first request is dispatched.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};

use crate::dto::dispatch_dto::{HandlerResponse, InboundRequest};
use crate::error::{Error, Result};
use crate::models::{endpoint::Endpoint, scheduled_task::ScheduledTask, webhook_log::WebhookLog};

/// Named handlers keyed by a stable string.
pub struct Registry<T: ?Sized> {
    kind: &'static str,
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, key: impl Into<String>, handler: Arc<T>) {
        let key = key.into();
        tracing::debug!(kind = self.kind, key = %key, "registering handler");
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key, handler);
        }
    }

    pub fn get(&self, key: &str) -> Result<Arc<T>> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(key).cloned())
            .ok_or_else(|| Error::NotFound(format!("{} '{}' is not registered", self.kind, key)))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(key))
            .unwrap_or(false)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

pub enum ScriptOutput {
    Response(HandlerResponse),
    /// Wrapped as a 200 JSON response.
    Data(JsonValue),
}

#[async_trait]
pub trait ScriptHandler: Send + Sync {
    async fn call(
        &self,
        data: &JsonValue,
        endpoint: &Endpoint,
        request: &InboundRequest,
    ) -> Result<ScriptOutput>;
}

/// A named value transformation usable from ETL field mappings.
pub trait Transformer: Send + Sync {
    fn transform(&self, value: JsonValue, params: &Map<String, JsonValue>) -> JsonValue;
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: &ScheduledTask) -> Result<JsonValue>;
}

/// Runs around every dispatch, in registration order.
#[async_trait]
pub trait DispatchInterceptor: Send + Sync {
    /// Returning a response skips the handler and the remaining interceptors.
    async fn before(
        &self,
        _request: &InboundRequest,
        _endpoint: &Endpoint,
    ) -> Option<HandlerResponse> {
        None
    }

    async fn after(
        &self,
        _request: &InboundRequest,
        _endpoint: &Endpoint,
        response: HandlerResponse,
    ) -> HandlerResponse {
        response
    }
}

#[async_trait]
pub trait ActionHook: Send + Sync {
    /// `Some` overrides the default outcome of the action.
    async fn fire(
        &self,
        action: &str,
        data: &JsonValue,
        endpoint: Option<&Endpoint>,
    ) -> Result<Option<JsonValue>>;
}

pub trait WebhookResponseFilter: Send + Sync {
    fn filter(&self, body: JsonValue, log: &WebhookLog, endpoint: &Endpoint) -> JsonValue;
}

#[async_trait]
pub trait CustomPermission: Send + Sync {
    /// `None` defers to the next hook.
    async fn check(&self, request: &InboundRequest, endpoint: &Endpoint) -> Option<bool>;
}

#[async_trait]
pub trait CustomTaskHook: Send + Sync {
    /// `None` when the hook does not handle this task.
    async fn run(&self, task: &ScheduledTask) -> Option<Result<JsonValue>>;
}

pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str, endpoint: &Endpoint) -> bool;
}

pub struct Extensions {
    pub scripts: Registry<dyn ScriptHandler>,
    pub transformers: Registry<dyn Transformer>,
    pub task_handlers: Registry<dyn TaskHandler>,
    interceptors: RwLock<Vec<Arc<dyn DispatchInterceptor>>>,
    actions: RwLock<HashMap<String, Vec<Arc<dyn ActionHook>>>>,
    webhook_filters: RwLock<Vec<Arc<dyn WebhookResponseFilter>>>,
    permission_hooks: RwLock<Vec<Arc<dyn CustomPermission>>>,
    task_hooks: RwLock<Vec<Arc<dyn CustomTaskHook>>>,
    token_validator: RwLock<Option<Arc<dyn TokenValidator>>>,
}

impl Default for Extensions {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot<T: Clone>(lock: &RwLock<Vec<T>>) -> Vec<T> {
    lock.read().map(|items| items.clone()).unwrap_or_default()
}

fn push<T>(lock: &RwLock<Vec<T>>, item: T) {
    if let Ok(mut items) = lock.write() {
        items.push(item);
    }
}

impl Extensions {
    pub fn new() -> Self {
        Self {
            scripts: Registry::new("script handler"),
            transformers: Registry::new("transformer"),
            task_handlers: Registry::new("task handler"),
            interceptors: RwLock::new(Vec::new()),
            actions: RwLock::new(HashMap::new()),
            webhook_filters: RwLock::new(Vec::new()),
            permission_hooks: RwLock::new(Vec::new()),
            task_hooks: RwLock::new(Vec::new()),
            token_validator: RwLock::new(None),
        }
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn DispatchInterceptor>) {
        push(&self.interceptors, interceptor);
    }

    pub fn interceptors(&self) -> Vec<Arc<dyn DispatchInterceptor>> {
        snapshot(&self.interceptors)
    }

    pub fn on_action(&self, action: impl Into<String>, hook: Arc<dyn ActionHook>) {
        if let Ok(mut actions) = self.actions.write() {
            actions.entry(action.into()).or_default().push(hook);
        }
    }

    /// Fires every hook listening on `action`; the last override wins.
    pub async fn fire_action(
        &self,
        action: &str,
        data: &JsonValue,
        endpoint: Option<&Endpoint>,
    ) -> Result<Option<JsonValue>> {
        let hooks = self
            .actions
            .read()
            .ok()
            .and_then(|actions| actions.get(action).cloned())
            .unwrap_or_default();
        if hooks.is_empty() {
            tracing::debug!(action, "action fired with no listeners");
        }

        let mut outcome = None;
        for hook in hooks {
            if let Some(value) = hook.fire(action, data, endpoint).await? {
                outcome = Some(value);
            }
        }
        Ok(outcome)
    }

    pub fn add_webhook_filter(&self, filter: Arc<dyn WebhookResponseFilter>) {
        push(&self.webhook_filters, filter);
    }

    pub fn filter_webhook_response(
        &self,
        body: JsonValue,
        log: &WebhookLog,
        endpoint: &Endpoint,
    ) -> JsonValue {
        snapshot(&self.webhook_filters)
            .into_iter()
            .fold(body, |body, filter| filter.filter(body, log, endpoint))
    }

    pub fn add_permission_hook(&self, hook: Arc<dyn CustomPermission>) {
        push(&self.permission_hooks, hook);
    }

    /// Denies unless some hook explicitly allows.
    pub async fn check_custom_permission(
        &self,
        request: &InboundRequest,
        endpoint: &Endpoint,
    ) -> bool {
        for hook in snapshot(&self.permission_hooks) {
            if let Some(decision) = hook.check(request, endpoint).await {
                return decision;
            }
        }
        false
    }

    pub fn add_task_hook(&self, hook: Arc<dyn CustomTaskHook>) {
        push(&self.task_hooks, hook);
    }

    pub async fn run_task_hooks(&self, task: &ScheduledTask) -> Option<Result<JsonValue>> {
        for hook in snapshot(&self.task_hooks) {
            if let Some(result) = hook.run(task).await {
                return Some(result);
            }
        }
        None
    }

    pub fn set_token_validator(&self, validator: Arc<dyn TokenValidator>) {
        if let Ok(mut slot) = self.token_validator.write() {
            *slot = Some(validator);
        }
    }

    pub fn token_validator(&self) -> Option<Arc<dyn TokenValidator>> {
        self.token_validator.read().ok().and_then(|slot| slot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    impl Transformer for Upper {
        fn transform(&self, value: JsonValue, _params: &Map<String, JsonValue>) -> JsonValue {
            match value {
                JsonValue::String(s) => JsonValue::String(s.to_uppercase()),
                other => other,
            }
        }
    }

    struct Echo(&'static str);

    #[async_trait]
    impl ActionHook for Echo {
        async fn fire(
            &self,
            _action: &str,
            _data: &JsonValue,
            _endpoint: Option<&Endpoint>,
        ) -> Result<Option<JsonValue>> {
            Ok(Some(json!(self.0)))
        }
    }

    #[test]
    fn missing_registry_key_is_not_found() {
        let ext = Extensions::new();
        assert!(matches!(ext.transformers.get("nope"), Err(Error::NotFound(_))));
        ext.transformers.register("upper", Arc::new(Upper));
        let t = ext.transformers.get("upper").expect("registered");
        assert_eq!(t.transform(json!("a"), &Map::new()), json!("A"));
        assert_eq!(ext.transformers.keys(), vec!["upper".to_string()]);
    }

    #[tokio::test]
    async fn last_action_override_wins() {
        let ext = Extensions::new();
        assert_eq!(ext.fire_action("x", &json!({}), None).await.unwrap(), None);
        ext.on_action("x", Arc::new(Echo("first")));
        ext.on_action("x", Arc::new(Echo("second")));
        assert_eq!(
            ext.fire_action("x", &json!({}), None).await.unwrap(),
            Some(json!("second"))
        );
    }
}
