use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};

use super::path::{get_nested, is_empty};
use crate::error::{Error, Result};
use crate::models::etl::EtlStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    #[serde(alias = "eq", alias = "==")]
    Equals,
    #[serde(alias = "ne", alias = "!=")]
    NotEquals,
    Contains,
    NotContains,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Lte,
    In,
    NotIn,
    Regex,
    Empty,
    NotEmpty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Filter {
    pub field: String,
    #[serde(default = "default_operator")]
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: JsonValue,
}

fn default_operator() -> FilterOperator {
    FilterOperator::Equals
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractConfig {
    /// Either `{"target": "source.path"}` or a list of paths kept under
    /// their own name.
    #[serde(default)]
    pub paths: JsonValue,
    pub root: Option<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl ExtractConfig {
    pub fn parse(raw: &JsonValue) -> Result<Option<Self>> {
        if is_empty(raw) {
            return Ok(None);
        }
        serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|e| Error::pipeline(EtlStage::Extract, format!("invalid extract config: {}", e)))
    }

    fn named_paths(&self) -> Result<Vec<(String, String)>> {
        match &self.paths {
            JsonValue::Null => Ok(Vec::new()),
            JsonValue::Object(map) => map
                .iter()
                .map(|(name, path)| match path.as_str() {
                    Some(p) => Ok((name.clone(), p.to_string())),
                    None => Err(Error::pipeline(
                        EtlStage::Extract,
                        format!("path for '{}' must be a string", name),
                    )),
                })
                .collect(),
            JsonValue::Array(items) => Ok(items
                .iter()
                .filter_map(JsonValue::as_str)
                .map(|p| (p.to_string(), p.to_string()))
                .collect()),
            _ => Err(Error::pipeline(
                EtlStage::Extract,
                "paths must be an object or a list",
            )),
        }
    }
}

fn as_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        JsonValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn as_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

/// Loose equality: `7` equals `"7"`.
fn loosely_equal(a: &JsonValue, b: &JsonValue) -> bool {
    if a == b {
        return true;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) if !a.is_boolean() && !b.is_boolean() => x == y,
        _ => as_text(a) == as_text(b) && !a.is_object() && !a.is_array(),
    }
}

fn contains(haystack: &JsonValue, needle: &JsonValue) -> bool {
    match haystack {
        JsonValue::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        JsonValue::Object(map) => needle.as_str().map(|k| map.contains_key(k)).unwrap_or(false),
        JsonValue::Null => false,
        other => as_text(other).contains(&as_text(needle)),
    }
}

fn compare(actual: &JsonValue, expected: &JsonValue, accept: fn(std::cmp::Ordering) -> bool) -> bool {
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(b)) => a.partial_cmp(&b).map(accept).unwrap_or(false),
        _ if actual.is_string() && expected.is_string() => accept(as_text(actual).cmp(&as_text(expected))),
        _ => false,
    }
}

impl Filter {
    pub fn matches(&self, data: &JsonValue) -> Result<bool> {
        let actual = get_nested(data, &self.field).unwrap_or(&JsonValue::Null);
        let expected = &self.value;
        Ok(match self.operator {
            FilterOperator::Equals => loosely_equal(actual, expected),
            FilterOperator::NotEquals => !loosely_equal(actual, expected),
            FilterOperator::Contains => contains(actual, expected),
            FilterOperator::NotContains => !contains(actual, expected),
            FilterOperator::Gt => compare(actual, expected, |o| o.is_gt()),
            FilterOperator::Gte => compare(actual, expected, |o| o.is_ge()),
            FilterOperator::Lt => compare(actual, expected, |o| o.is_lt()),
            FilterOperator::Lte => compare(actual, expected, |o| o.is_le()),
            FilterOperator::In => contains(expected, actual) && expected.is_array(),
            FilterOperator::NotIn => !(expected.is_array() && contains(expected, actual)),
            FilterOperator::Regex => {
                let pattern = expected.as_str().unwrap_or_default();
                let re = Regex::new(pattern).map_err(|e| {
                    Error::pipeline(EtlStage::Extract, format!("invalid filter regex: {}", e))
                })?;
                !actual.is_null() && re.is_match(&as_text(actual))
            }
            FilterOperator::Empty => is_empty(actual),
            FilterOperator::NotEmpty => !is_empty(actual),
        })
    }
}

/// Runs the extract phase. A failing filter yields an empty object, which
/// the engine treats as "nothing to load".
pub fn extract(input: &JsonValue, config: Option<&ExtractConfig>) -> Result<JsonValue> {
    let Some(config) = config else {
        return Ok(input.clone());
    };

    for filter in &config.filters {
        if !filter.matches(input)? {
            tracing::debug!(field = %filter.field, operator = ?filter.operator, "extract filter rejected input");
            return Ok(JsonValue::Object(Map::new()));
        }
    }

    let named = config.named_paths()?;
    if named.is_empty() && config.root.is_none() {
        return Ok(input.clone());
    }

    let mut result = Map::new();
    for (name, path) in named {
        if let Some(value) = get_nested(input, &path) {
            result.insert(name, value.clone());
        }
    }

    if let Some(root) = config.root.as_deref() {
        match get_nested(input, root) {
            Some(JsonValue::Object(map)) => {
                for (key, value) in map {
                    result.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
            // A list root without named paths becomes the record set.
            Some(list @ JsonValue::Array(_)) if result.is_empty() => return Ok(list.clone()),
            Some(other) if !other.is_null() => {
                result.entry("value".to_string()).or_insert_with(|| other.clone());
            }
            _ => {}
        }
    }

    Ok(JsonValue::Object(result))
}
