use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use validator::Validate;

use crate::models::endpoint::Endpoint;

fn default_window() -> u64 {
    60
}

fn default_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateEndpointPayload {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(min = 1, max = 100))]
    pub slug: String,
    #[serde(default)]
    pub route: String,
    /// GET, POST, PUT, PATCH or DELETE.
    pub method: String,
    /// webhook, action, script, forward or etl.
    pub handler_type: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub handler_config: JsonValue,
    /// public, signature, api_key, token, ip_whitelist or custom.
    #[serde(default = "default_permission")]
    pub permission_type: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub permission_config: JsonValue,
    pub is_active: Option<bool>,
    pub description: Option<String>,
    #[serde(default)]
    pub rate_limit_requests: u32,
    #[serde(default = "default_window")]
    #[validate(range(min = 1))]
    pub rate_limit_window: u64,
    #[serde(default)]
    pub cache_ttl: u64,
    #[serde(default = "default_timeout")]
    #[validate(range(min = 1, max = 300))]
    pub timeout: u64,
    #[serde(default)]
    #[validate(range(max = 10))]
    pub retry_count: u32,
}

fn default_permission() -> String {
    "public".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct UpdateEndpointPayload {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub slug: Option<String>,
    pub route: Option<String>,
    pub method: Option<String>,
    pub handler_type: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub handler_config: Option<JsonValue>,
    pub permission_type: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub permission_config: Option<JsonValue>,
    pub is_active: Option<bool>,
    pub description: Option<String>,
    pub rate_limit_requests: Option<u32>,
    #[validate(range(min = 1))]
    pub rate_limit_window: Option<u64>,
    pub cache_ttl: Option<u64>,
    #[validate(range(min = 1, max = 300))]
    pub timeout: Option<u64>,
    #[validate(range(max = 10))]
    pub retry_count: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointListQuery {
    pub handler_type: Option<String>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointResponse {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    /// Path relative to the API base.
    pub url: String,
}

impl From<Endpoint> for EndpointResponse {
    fn from(endpoint: Endpoint) -> Self {
        Self {
            url: format!("/{}", endpoint.full_path()),
            endpoint,
        }
    }
}
