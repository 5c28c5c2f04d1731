use std::cmp::Ordering;

use chrono::{
    format::{Item, StrftimeItems},
    Utc,
};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use super::path::{get_nested, is_empty, set_nested};
use super::transformations::{apply_step, format_datetime, TransformStep};
use crate::error::{Error, Result};
use crate::models::etl::EtlStage;
use crate::services::extensions::Extensions;

/// Target field definition: a bare source path or a detailed mapping.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FieldMapping {
    Path(String),
    Detailed {
        source: String,
        #[serde(default)]
        transformations: Vec<JsonValue>,
        #[serde(default)]
        default: Option<JsonValue>,
    },
}

fn default_separator() -> String {
    "_".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    Key,
    #[default]
    Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Whole-record transforms applied after field mappings.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordTransform {
    Flatten {
        #[serde(default = "default_separator")]
        separator: String,
    },
    Unflatten {
        #[serde(default = "default_separator")]
        separator: String,
    },
    FilterEmpty,
    FilterNull,
    Sort {
        #[serde(default)]
        by: SortBy,
        #[serde(default)]
        order: SortOrder,
    },
    RenameKeys {
        #[serde(default)]
        mapping: Map<String, JsonValue>,
    },
    RemoveKeys {
        #[serde(default)]
        keys: Vec<String>,
    },
    KeepKeys {
        #[serde(default)]
        keys: Vec<String>,
    },
}

fn default_join() -> String {
    " ".to_string()
}

fn default_timestamp_format() -> String {
    "%Y-%m-%dT%H:%M:%S%:z".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComputedField {
    Concat {
        fields: Vec<String>,
        #[serde(default = "default_join")]
        separator: String,
    },
    Sum {
        fields: Vec<String>,
    },
    Avg {
        fields: Vec<String>,
    },
    /// Non-empty named fields, or every field when none are named.
    Count {
        #[serde(default)]
        fields: Vec<String>,
    },
    Timestamp {
        #[serde(default = "default_timestamp_format")]
        format: String,
    },
    Uuid,
    Template {
        template: String,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransformConfig {
    #[serde(default)]
    pub field_mappings: Map<String, JsonValue>,
    #[serde(default)]
    pub transformations: Vec<JsonValue>,
    #[serde(default)]
    pub static_fields: Map<String, JsonValue>,
    #[serde(default)]
    pub computed_fields: Map<String, JsonValue>,
}

/// Parsed, ready-to-run form of a template's transform config.
#[derive(Debug, Clone, Default)]
pub struct TransformPlan {
    mappings: Vec<(String, FieldMapping)>,
    record_transforms: Vec<RecordTransform>,
    static_fields: Map<String, JsonValue>,
    computed: Vec<(String, ComputedField)>,
}

fn stage_error(message: String) -> Error {
    Error::pipeline(EtlStage::Transform, message)
}

impl TransformPlan {
    pub fn parse(raw: &JsonValue) -> Result<Self> {
        if is_empty(raw) {
            return Ok(Self::default());
        }
        let config: TransformConfig = serde_json::from_value(raw.clone())
            .map_err(|e| stage_error(format!("invalid transform config: {}", e)))?;

        let mappings = config
            .field_mappings
            .into_iter()
            .map(|(target, raw)| {
                serde_json::from_value::<FieldMapping>(raw)
                    .map(|m| (target.clone(), m))
                    .map_err(|_| stage_error(format!("invalid mapping for field '{}'", target)))
            })
            .collect::<Result<Vec<_>>>()?;

        let record_transforms = config
            .transformations
            .into_iter()
            .map(|raw| {
                // Bare names are shorthand for `{"type": name}`.
                let raw = match raw {
                    JsonValue::String(name) => serde_json::json!({ "type": name }),
                    other => other,
                };
                serde_json::from_value::<RecordTransform>(raw)
                    .map_err(|e| stage_error(format!("invalid record transformation: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let computed = config
            .computed_fields
            .into_iter()
            .map(|(target, raw)| {
                let field = serde_json::from_value::<ComputedField>(raw)
                    .map_err(|e| stage_error(format!("invalid computed field '{}': {}", target, e)))?;
                if let ComputedField::Timestamp { format } = &field {
                    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
                        return Err(stage_error(format!(
                            "invalid timestamp format '{}' for computed field '{}'",
                            format, target
                        )));
                    }
                }
                Ok((target, field))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            mappings,
            record_transforms,
            static_fields: config.static_fields,
            computed,
        })
    }

    /// Transforms one record, or each record of a list.
    pub fn apply(&self, data: &JsonValue, extensions: &Extensions) -> JsonValue {
        match data {
            JsonValue::Array(items) => JsonValue::Array(
                items
                    .iter()
                    .map(|item| self.apply_record(item, extensions))
                    .collect(),
            ),
            other => self.apply_record(other, extensions),
        }
    }

    fn apply_record(&self, data: &JsonValue, extensions: &Extensions) -> JsonValue {
        let mut record = if self.mappings.is_empty() {
            match data {
                JsonValue::Object(map) => map.clone(),
                // Scalars have nothing to transform record-wise.
                other => return other.clone(),
            }
        } else {
            self.map_fields(data, extensions)
        };

        for transform in &self.record_transforms {
            record = apply_record_transform(record, transform);
        }

        for (key, value) in &self.static_fields {
            record.insert(key.clone(), value.clone());
        }

        for (target, computed) in &self.computed {
            let value = compute(computed, &record);
            record.insert(target.clone(), value);
        }

        JsonValue::Object(record)
    }

    fn map_fields(&self, data: &JsonValue, extensions: &Extensions) -> Map<String, JsonValue> {
        let mut out = Map::new();
        for (target, mapping) in &self.mappings {
            let value = match mapping {
                FieldMapping::Path(source) => get_nested(data, source).cloned().unwrap_or(JsonValue::Null),
                FieldMapping::Detailed {
                    source,
                    transformations,
                    default,
                } => {
                    let mut value = get_nested(data, source).cloned().unwrap_or(JsonValue::Null);
                    if is_empty(&value) {
                        if let Some(default) = default {
                            value = default.clone();
                        }
                    }
                    for raw in transformations {
                        match TransformStep::from_json(raw) {
                            Some(step) => value = apply_step(value, &step, extensions),
                            None => tracing::warn!(field = %target, "ignoring malformed transformation"),
                        }
                    }
                    value
                }
            };
            out.insert(target.clone(), value);
        }
        out
    }
}

/// Map-valued fields are expanded into `parent<sep>child` keys. Lists and
/// empty maps are kept as they are so `unflatten` can restore them.
pub fn flatten(record: &Map<String, JsonValue>, separator: &str) -> Map<String, JsonValue> {
    fn walk(prefix: &str, map: &Map<String, JsonValue>, separator: &str, out: &mut Map<String, JsonValue>) {
        for (key, value) in map {
            let name = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{}{}{}", prefix, separator, key)
            };
            match value {
                JsonValue::Object(child) if !child.is_empty() => walk(&name, child, separator, out),
                other => {
                    out.insert(name, other.clone());
                }
            }
        }
    }
    let mut out = Map::new();
    walk("", record, separator, &mut out);
    out
}

pub fn unflatten(record: &Map<String, JsonValue>, separator: &str) -> Map<String, JsonValue> {
    let mut out = Map::new();
    for (key, value) in record {
        if separator.is_empty() || !key.contains(separator) {
            out.insert(key.clone(), value.clone());
        } else {
            set_nested(&mut out, key, separator, value.clone());
        }
    }
    out
}

fn compare_values(a: &JsonValue, b: &JsonValue) -> Ordering {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        (JsonValue::Null, JsonValue::Null) => Ordering::Equal,
        (JsonValue::Null, _) => Ordering::Less,
        (_, JsonValue::Null) => Ordering::Greater,
        _ => a.to_string().cmp(&b.to_string()),
    }
}

fn apply_record_transform(record: Map<String, JsonValue>, transform: &RecordTransform) -> Map<String, JsonValue> {
    match transform {
        RecordTransform::Flatten { separator } => flatten(&record, separator),
        RecordTransform::Unflatten { separator } => unflatten(&record, separator),
        RecordTransform::FilterEmpty => record.into_iter().filter(|(_, v)| !is_empty(v)).collect(),
        RecordTransform::FilterNull => record.into_iter().filter(|(_, v)| !v.is_null()).collect(),
        RecordTransform::Sort { by, order } => {
            let mut entries: Vec<(String, JsonValue)> = record.into_iter().collect();
            entries.sort_by(|(ka, va), (kb, vb)| {
                let ordering = match by {
                    SortBy::Key => ka.cmp(kb),
                    SortBy::Value => compare_values(va, vb),
                };
                match order {
                    SortOrder::Asc => ordering,
                    SortOrder::Desc => ordering.reverse(),
                }
            });
            entries.into_iter().collect()
        }
        RecordTransform::RenameKeys { mapping } => record
            .into_iter()
            .map(|(key, value)| match mapping.get(&key).and_then(JsonValue::as_str) {
                Some(renamed) => (renamed.to_string(), value),
                None => (key, value),
            })
            .collect(),
        RecordTransform::RemoveKeys { keys } => record
            .into_iter()
            .filter(|(k, _)| !keys.contains(k))
            .collect(),
        RecordTransform::KeepKeys { keys } => record
            .into_iter()
            .filter(|(k, _)| keys.contains(k))
            .collect(),
    }
}

fn numbers<'a>(record: &'a Map<String, JsonValue>, fields: &'a [String]) -> impl Iterator<Item = f64> + 'a {
    fields.iter().filter_map(move |f| match record.get(f) {
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn number_value(f: f64) -> JsonValue {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        JsonValue::from(f as i64)
    } else {
        serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    }
}

fn text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

fn compute(field: &ComputedField, record: &Map<String, JsonValue>) -> JsonValue {
    match field {
        ComputedField::Concat { fields, separator } => JsonValue::String(
            fields
                .iter()
                .filter_map(|f| record.get(f))
                .filter(|v| !is_empty(v))
                .map(text)
                .collect::<Vec<_>>()
                .join(separator),
        ),
        ComputedField::Sum { fields } => number_value(numbers(record, fields).sum()),
        ComputedField::Avg { fields } => {
            let values: Vec<f64> = numbers(record, fields).collect();
            if values.is_empty() {
                JsonValue::Null
            } else {
                number_value(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        ComputedField::Count { fields } => {
            let count = if fields.is_empty() {
                record.len()
            } else {
                fields
                    .iter()
                    .filter(|f| record.get(*f).map(|v| !is_empty(v)).unwrap_or(false))
                    .count()
            };
            JsonValue::from(count)
        }
        ComputedField::Timestamp { format } => match format_datetime(&Utc::now(), format) {
            Some(stamp) => JsonValue::String(stamp),
            None => {
                tracing::warn!(format = %format, "invalid timestamp format");
                JsonValue::Null
            }
        },
        ComputedField::Uuid => JsonValue::String(Uuid::new_v4().to_string()),
        ComputedField::Template { template } => {
            let data = JsonValue::Object(record.clone());
            match Regex::new(r"\{\{\s*([^}\s]+)\s*\}\}") {
                Ok(re) => JsonValue::String(
                    re.replace_all(template, |caps: &regex::Captures| {
                        get_nested(&data, &caps[1]).map(text).unwrap_or_default()
                    })
                    .into_owned(),
                ),
                Err(_) => JsonValue::String(template.clone()),
            }
        }
    }
}
