use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use super::default_true;
use crate::database::table::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    None,
    ApiKey,
    Bearer,
    Basic,
    #[serde(rename = "oauth2")]
    OAuth2,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    Json,
    Form,
    Multipart,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_retryable_codes() -> Vec<u16> {
    vec![408, 429, 500, 502, 503, 504]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt, so a call makes at most
    /// `max_retries + 1` attempts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retryable_codes")]
    pub retryable_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            retryable_codes: default_retryable_codes(),
        }
    }
}

impl RetryConfig {
    /// `base_delay * 2^(attempt-1)` for the 1-based attempt that just failed.
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        std::time::Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << exponent))
    }

    pub fn should_retry(&self, status_code: u16) -> bool {
        status_code == 0 || self.retryable_codes.contains(&status_code)
    }
}

fn default_window() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Zero disables limiting.
    #[serde(default)]
    pub max_requests: u32,
    #[serde(default = "default_window")]
    pub time_window: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 0,
            time_window: default_window(),
        }
    }
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_expected_status() -> u16 {
    200
}

fn default_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalService {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub auth_config: JsonValue,
    #[serde(default)]
    pub default_headers: Map<String, JsonValue>,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub retry_config: RetryConfig,
    #[serde(default)]
    pub rate_limit_config: RateLimitConfig,
    #[serde(default = "default_health_path")]
    pub health_check_path: String,
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
    #[serde(default)]
    pub health_status: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record for ExternalService {
    const TABLE: &'static str = "external_services";

    fn id(&self) -> i64 {
        self.id
    }
}

impl ExternalService {
    pub fn url_for(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", base, path)
        }
    }
}
