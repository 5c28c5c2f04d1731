use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::default_true;
use crate::database::table::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(format!("unsupported HTTP method: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerType {
    Webhook,
    Action,
    Script,
    Forward,
    Etl,
}

impl FromStr for HandlerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(JsonValue::String(s.to_string()))
            .map_err(|_| format!("unknown handler type: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionType {
    Public,
    Signature,
    ApiKey,
    Token,
    IpWhitelist,
    Custom,
}

impl FromStr for PermissionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(JsonValue::String(s.to_string()))
            .map_err(|_| format!("unknown permission type: {}", s))
    }
}

fn default_window() -> u64 {
    60
}

fn default_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub slug: String,
    /// Pattern appended after the slug, e.g. `orders/{order_id}`.
    #[serde(default)]
    pub route: String,
    pub method: HttpMethod,
    pub handler_type: HandlerType,
    #[serde(default)]
    pub handler_config: JsonValue,
    pub permission_type: PermissionType,
    #[serde(default)]
    pub permission_config: JsonValue,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub description: Option<String>,
    /// Zero disables the inbound limit.
    #[serde(default)]
    pub rate_limit_requests: u32,
    #[serde(default = "default_window")]
    pub rate_limit_window: u64,
    #[serde(default)]
    pub cache_ttl: u64,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record for Endpoint {
    const TABLE: &'static str = "endpoints";

    fn id(&self) -> i64 {
        self.id
    }
}

impl Endpoint {
    /// Path relative to the API base, `custom/<slug>[/<route>]`.
    pub fn full_path(&self) -> String {
        let route = self.route.trim_matches('/');
        if route.is_empty() {
            format!("custom/{}", self.slug)
        } else {
            format!("custom/{}/{}", self.slug, route)
        }
    }
}
