use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value as JsonValue};
use tokio::sync::RwLock;

use crate::database::{store::Store, table::Table};
use crate::error::{Error, Result};
use crate::models::setting::Setting;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettingKind {
    Bool,
    Int { min: i64, max: i64 },
    Float,
    Choice(&'static [&'static str]),
    Array,
}

#[derive(Debug, Clone, Copy)]
pub struct SettingSpec {
    pub key: &'static str,
    pub group: &'static str,
    pub kind: SettingKind,
    default: fn() -> JsonValue,
}

impl SettingSpec {
    pub fn default_value(&self) -> JsonValue {
        (self.default)()
    }

    /// Normalizes `value` to the declared kind. Numeric and boolean strings
    /// are accepted since form posts deliver everything as text.
    pub fn coerce(&self, value: &JsonValue) -> Result<JsonValue> {
        let invalid = |expected: &str| {
            Error::BadRequest(format!(
                "setting '{}' expects {}, got {}",
                self.key, expected, value
            ))
        };

        match self.kind {
            SettingKind::Bool => match value {
                JsonValue::Bool(b) => Ok(json!(b)),
                JsonValue::String(s) => match s.as_str() {
                    "true" | "1" | "yes" | "on" => Ok(json!(true)),
                    "false" | "0" | "no" | "off" | "" => Ok(json!(false)),
                    _ => Err(invalid("a boolean")),
                },
                JsonValue::Number(n) => Ok(json!(n.as_i64().unwrap_or(0) != 0)),
                _ => Err(invalid("a boolean")),
            },
            SettingKind::Int { min, max } => {
                let parsed = match value {
                    JsonValue::Number(n) => n.as_i64(),
                    JsonValue::String(s) => s.trim().parse().ok(),
                    _ => None,
                };
                let n = parsed.ok_or_else(|| invalid("an integer"))?;
                if n < min || n > max {
                    return Err(invalid(&format!("an integer in {}..={}", min, max)));
                }
                Ok(json!(n))
            }
            SettingKind::Float => {
                let parsed = match value {
                    JsonValue::Number(n) => n.as_f64(),
                    JsonValue::String(s) => s.trim().parse().ok(),
                    _ => None,
                };
                parsed.map(|f| json!(f)).ok_or_else(|| invalid("a number"))
            }
            SettingKind::Choice(options) => match value.as_str() {
                Some(s) if options.contains(&s) => Ok(json!(s)),
                _ => Err(invalid(&format!("one of {}", options.join(", ")))),
            },
            SettingKind::Array => match value {
                JsonValue::Array(items) => Ok(JsonValue::Array(items.clone())),
                _ => Err(invalid("an array")),
            },
        }
    }
}

const LOG_LEVELS: &[&str] = &["debug", "info", "warning", "error", "critical"];

pub static SCHEMA: &[SettingSpec] = &[
    SettingSpec {
        key: "debug_mode",
        group: "general",
        kind: SettingKind::Bool,
        default: || json!(false),
    },
    SettingSpec {
        key: "default_timeout",
        group: "general",
        kind: SettingKind::Int { min: 1, max: 300 },
        default: || json!(30),
    },
    SettingSpec {
        key: "allowed_ip_headers",
        group: "general",
        kind: SettingKind::Array,
        default: || json!(["cf-connecting-ip", "x-forwarded-for", "x-real-ip"]),
    },
    SettingSpec {
        key: "log_level",
        group: "logging",
        kind: SettingKind::Choice(LOG_LEVELS),
        default: || json!("info"),
    },
    SettingSpec {
        key: "log_buffer_size",
        group: "logging",
        kind: SettingKind::Int { min: 1, max: 1000 },
        default: || json!(50),
    },
    SettingSpec {
        key: "webhook_log_retention_days",
        group: "retention",
        kind: SettingKind::Int { min: 1, max: 3650 },
        default: || json!(30),
    },
    SettingSpec {
        key: "event_log_retention_days",
        group: "retention",
        kind: SettingKind::Int { min: 1, max: 3650 },
        default: || json!(30),
    },
    SettingSpec {
        key: "etl_job_retention_days",
        group: "retention",
        kind: SettingKind::Int { min: 1, max: 3650 },
        default: || json!(30),
    },
    SettingSpec {
        key: "webhook_max_retries",
        group: "webhooks",
        kind: SettingKind::Int { min: 0, max: 20 },
        default: || json!(3),
    },
    SettingSpec {
        key: "scheduler_batch_size",
        group: "scheduler",
        kind: SettingKind::Int { min: 1, max: 100 },
        default: || json!(10),
    },
    SettingSpec {
        key: "connector_cache_enabled",
        group: "connector",
        kind: SettingKind::Bool,
        default: || json!(true),
    },
];

pub fn spec_for(key: &str) -> Result<&'static SettingSpec> {
    SCHEMA
        .iter()
        .find(|spec| spec.key == key)
        .ok_or_else(|| Error::NotFound(format!("unknown setting '{}'", key)))
}

/// Typed key/value settings persisted in the `settings` table.
#[derive(Clone)]
pub struct SettingsService {
    settings: Table<Setting>,
    cache: Arc<RwLock<Option<HashMap<String, JsonValue>>>>,
}

impl SettingsService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            settings: Table::new(store),
            cache: Arc::new(RwLock::new(None)),
        }
    }

    async fn stored(&self) -> Result<HashMap<String, JsonValue>> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            return Ok(cached.clone());
        }
        let rows: HashMap<String, JsonValue> = self
            .settings
            .all()
            .await?
            .into_iter()
            .map(|row| (row.key, row.value))
            .collect();
        *self.cache.write().await = Some(rows.clone());
        Ok(rows)
    }

    async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    /// Stored value, or the schema default.
    pub async fn get(&self, key: &str) -> Result<JsonValue> {
        let spec = spec_for(key)?;
        let stored = self.stored().await?;
        Ok(stored
            .get(key)
            .cloned()
            .unwrap_or_else(|| spec.default_value()))
    }

    /// Like [`get`](Self::get) but falls back to the default when the store
    /// is unreachable. Used on hot paths that must not fail.
    pub async fn get_or_default(&self, key: &str) -> JsonValue {
        match self.get(key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, error = %e, "falling back to default setting");
                spec_for(key)
                    .map(|spec| spec.default_value())
                    .unwrap_or(JsonValue::Null)
            }
        }
    }

    pub async fn get_bool(&self, key: &str) -> bool {
        self.get_or_default(key).await.as_bool().unwrap_or(false)
    }

    pub async fn get_int(&self, key: &str) -> i64 {
        self.get_or_default(key).await.as_i64().unwrap_or(0)
    }

    pub async fn get_float(&self, key: &str) -> f64 {
        self.get_or_default(key).await.as_f64().unwrap_or(0.0)
    }

    pub async fn get_string(&self, key: &str) -> String {
        match self.get_or_default(key).await {
            JsonValue::String(s) => s,
            JsonValue::Null => String::new(),
            other => other.to_string(),
        }
    }

    pub async fn get_array(&self, key: &str) -> Vec<JsonValue> {
        match self.get_or_default(key).await {
            JsonValue::Array(items) => items,
            _ => Vec::new(),
        }
    }

    pub async fn set(&self, key: &str, value: &JsonValue) -> Result<JsonValue> {
        let value = spec_for(key)?.coerce(value)?;
        self.write(key, value.clone()).await?;
        tracing::info!(key, %value, "setting updated");
        Ok(value)
    }

    async fn write(&self, key: &str, value: JsonValue) -> Result<()> {
        let existing = self.settings.find_one_by("key", json!(key)).await?;
        match existing {
            Some(row) => {
                let mut fields = Map::new();
                fields.insert("value".into(), value);
                fields.insert("updated_at".into(), json!(Utc::now()));
                self.settings.update(row.id, fields).await?;
            }
            None => {
                self.settings
                    .insert(&Setting {
                        id: 0,
                        key: key.to_string(),
                        value,
                        updated_at: Utc::now(),
                    })
                    .await?;
            }
        }
        self.invalidate().await;
        Ok(())
    }

    /// Removes the stored value so the default applies again.
    pub async fn delete(&self, key: &str) -> Result<()> {
        spec_for(key)?;
        if let Some(row) = self.settings.find_one_by("key", json!(key)).await? {
            self.settings.delete(row.id).await?;
        }
        self.invalidate().await;
        Ok(())
    }

    pub async fn all(&self) -> Result<Map<String, JsonValue>> {
        self.export(None).await
    }

    /// Effective values, optionally limited to one group.
    pub async fn export(&self, group: Option<&str>) -> Result<Map<String, JsonValue>> {
        let stored = self.stored().await?;
        Ok(SCHEMA
            .iter()
            .filter(|spec| group.map(|g| g == spec.group).unwrap_or(true))
            .map(|spec| {
                let value = stored
                    .get(spec.key)
                    .cloned()
                    .unwrap_or_else(|| spec.default_value());
                (spec.key.to_string(), value)
            })
            .collect())
    }

    /// Validates every entry before writing any of them.
    pub async fn import(&self, values: &Map<String, JsonValue>) -> Result<usize> {
        let mut validated = Vec::with_capacity(values.len());
        for (key, value) in values {
            let spec = spec_for(key).map_err(|_| Error::BadRequest(format!("unknown setting '{}'", key)))?;
            validated.push((spec.key, spec.coerce(value)?));
        }
        for (key, value) in &validated {
            self.write(key, value.clone()).await?;
        }
        tracing::info!(count = validated.len(), "settings imported");
        Ok(validated.len())
    }
}
