use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use utoipa::ToSchema;
use validator::Validate;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookLogQuery {
    pub endpoint_id: Option<i64>,
    /// pending, received, processed, queued or failed.
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventLogListQuery {
    pub level: Option<String>,
    pub category: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CleanupPayload {
    /// Rows older than this many days are deleted.
    #[validate(range(min = 1, max = 3650))]
    pub days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SettingValuePayload {
    #[schema(value_type = Object)]
    pub value: JsonValue,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsExportQuery {
    pub group: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SettingsImportPayload {
    #[schema(value_type = Object)]
    pub settings: Map<String, JsonValue>,
}
