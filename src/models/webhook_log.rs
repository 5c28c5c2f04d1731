use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::database::table::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Pending,
    Received,
    Processed,
    Queued,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookLog {
    #[serde(default)]
    pub id: i64,
    pub endpoint_id: i64,
    pub source_ip: Option<String>,
    pub source_identifier: Option<String>,
    pub request_method: String,
    #[serde(default)]
    pub request_headers: JsonValue,
    #[serde(default)]
    pub request_payload: JsonValue,
    #[serde(default)]
    pub raw_body: String,
    pub content_type: Option<String>,
    pub status: WebhookStatus,
    pub response_code: Option<u16>,
    pub response_body: Option<JsonValue>,
    pub error_message: Option<String>,
    /// Rejected calls (bad signature, malformed body) are never replayed.
    #[serde(default)]
    pub retryable: bool,
    #[serde(default)]
    pub retry_count: u32,
    pub etl_job_id: Option<i64>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Record for WebhookLog {
    const TABLE: &'static str = "webhook_logs";

    fn id(&self) -> i64 {
        self.id
    }
}
