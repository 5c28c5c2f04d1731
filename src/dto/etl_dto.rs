use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateTemplatePayload {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub extract_config: JsonValue,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub transform_config: JsonValue,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub load_config: JsonValue,
    pub external_service_id: Option<i64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct UpdateTemplatePayload {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    pub description: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub extract_config: Option<JsonValue>,
    #[schema(value_type = Option<Object>)]
    pub transform_config: Option<JsonValue>,
    #[schema(value_type = Option<Object>)]
    pub load_config: Option<JsonValue>,
    pub external_service_id: Option<i64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PreviewPayload {
    #[schema(value_type = Object)]
    pub sample: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RunTemplatePayload {
    #[serde(default)]
    #[schema(value_type = Object)]
    pub input: JsonValue,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobListQuery {
    pub template_id: Option<i64>,
    /// pending, extracting, transforming, loading, completed or failed.
    pub status: Option<String>,
    pub limit: Option<usize>,
}
