use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use utoipa::ToSchema;
use validator::Validate;

use crate::models::external_service::{
    AuthType, ContentType, ExternalService, RateLimitConfig, RetryConfig,
};

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateServicePayload {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(url)]
    pub base_url: String,
    #[serde(default)]
    #[schema(value_type = String)]
    pub auth_type: AuthType,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub auth_config: JsonValue,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub default_headers: Map<String, JsonValue>,
    #[serde(default)]
    #[schema(value_type = String)]
    pub content_type: ContentType,
    #[validate(range(min = 1, max = 300))]
    pub timeout: Option<u64>,
    #[schema(value_type = Option<Object>)]
    pub retry_config: Option<RetryConfig>,
    #[schema(value_type = Option<Object>)]
    pub rate_limit_config: Option<RateLimitConfig>,
    pub health_check_path: Option<String>,
    #[validate(range(min = 100, max = 599))]
    pub expected_status: Option<u16>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct UpdateServicePayload {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    #[validate(url)]
    pub base_url: Option<String>,
    #[schema(value_type = Option<String>)]
    pub auth_type: Option<AuthType>,
    #[schema(value_type = Option<Object>)]
    pub auth_config: Option<JsonValue>,
    #[schema(value_type = Option<Object>)]
    pub default_headers: Option<Map<String, JsonValue>>,
    #[schema(value_type = Option<String>)]
    pub content_type: Option<ContentType>,
    #[validate(range(min = 1, max = 300))]
    pub timeout: Option<u64>,
    #[schema(value_type = Option<Object>)]
    pub retry_config: Option<RetryConfig>,
    #[schema(value_type = Option<Object>)]
    pub rate_limit_config: Option<RateLimitConfig>,
    pub health_check_path: Option<String>,
    #[validate(range(min = 100, max = 599))]
    pub expected_status: Option<u16>,
    pub is_active: Option<bool>,
}

/// Ad-hoc call through a configured service.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct SendPayload {
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[schema(value_type = Option<Object>)]
    pub data: Option<JsonValue>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// An external service as shown by the admin API, with credentials masked.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceView {
    #[serde(flatten)]
    pub service: ExternalService,
}

const MASK: &str = "********";

fn mask(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), mask(v)))
                .collect(),
        ),
        JsonValue::String(s) if !s.is_empty() => JsonValue::String(MASK.to_string()),
        other => other.clone(),
    }
}

impl From<ExternalService> for ServiceView {
    fn from(mut service: ExternalService) -> Self {
        service.auth_config = mask(&service.auth_config);
        Self { service }
    }
}
