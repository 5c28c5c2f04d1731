use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateTaskPayload {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub description: Option<String>,
    /// etl, cleanup, health_check, webhook_retry or custom.
    pub task_type: String,
    /// Registered handler key; defaults to the task name.
    #[validate(length(min = 1, max = 255))]
    pub handler: Option<String>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub config: JsonValue,
    /// once, every_minute, every_five_minutes, every_fifteen_minutes,
    /// every_thirty_minutes, hourly, twicedaily, daily, weekly or monthly.
    #[validate(length(min = 1))]
    pub frequency: String,
    #[serde(default)]
    #[validate(range(min = -100, max = 100))]
    pub priority: i32,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct UpdateTaskPayload {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    pub description: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub config: Option<JsonValue>,
    pub frequency: Option<String>,
    #[validate(range(min = -100, max = 100))]
    pub priority: Option<i32>,
    pub is_active: Option<bool>,
    /// Pauses or resumes the task.
    pub paused: Option<bool>,
}
