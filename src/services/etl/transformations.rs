//! Named value transformations applied by field mappings.

use std::fmt::Write as _;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use md5::Md5;
use regex::Regex;
use serde_json::{json, Map, Value as JsonValue};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use crate::services::extensions::Extensions;

/// One step of a mapping pipeline: a name plus its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformStep {
    pub name: String,
    pub params: Map<String, JsonValue>,
}

impl TransformStep {
    /// Accepts `"trim"`, `{"type": "replace", "search": "a", "replace": "b"}`
    /// or `{"name": "replace", "params": {...}}`.
    pub fn from_json(raw: &JsonValue) -> Option<Self> {
        match raw {
            JsonValue::String(name) => Some(Self {
                name: name.clone(),
                params: Map::new(),
            }),
            JsonValue::Object(map) => {
                let name = map
                    .get("type")
                    .or_else(|| map.get("name"))
                    .and_then(JsonValue::as_str)?
                    .to_string();
                let params = match map.get("params") {
                    Some(JsonValue::Object(params)) => params.clone(),
                    _ => map
                        .iter()
                        .filter(|(k, _)| k.as_str() != "type" && k.as_str() != "name")
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                };
                Some(Self { name, params })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Uppercase,
    Lowercase,
    Ucfirst,
    Ucwords,
    Trim,
    Ltrim,
    Rtrim,
    Int,
    Float,
    String,
    Bool,
    JsonEncode,
    JsonDecode,
    DateFormat,
    Replace,
    RegexReplace,
    Substr,
    Concat,
    Split,
    Join,
    Map,
    Multiply,
    Divide,
    Round,
    Abs,
    Hash,
    Base64Encode,
    Base64Decode,
    UrlEncode,
    UrlDecode,
    HtmlEncode,
    HtmlDecode,
    StripTags,
    Default,
}

impl FromStr for Builtin {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "uppercase" | "upper" => Builtin::Uppercase,
            "lowercase" | "lower" => Builtin::Lowercase,
            "ucfirst" | "capitalize" => Builtin::Ucfirst,
            "ucwords" | "title" => Builtin::Ucwords,
            "trim" => Builtin::Trim,
            "ltrim" => Builtin::Ltrim,
            "rtrim" => Builtin::Rtrim,
            "int" | "integer" | "intval" => Builtin::Int,
            "float" | "number" | "floatval" => Builtin::Float,
            "string" | "strval" => Builtin::String,
            "bool" | "boolean" | "boolval" => Builtin::Bool,
            "json_encode" => Builtin::JsonEncode,
            "json_decode" => Builtin::JsonDecode,
            "date_format" | "date" => Builtin::DateFormat,
            "replace" | "str_replace" => Builtin::Replace,
            "regex_replace" | "preg_replace" => Builtin::RegexReplace,
            "substr" | "substring" => Builtin::Substr,
            "concat" => Builtin::Concat,
            "split" | "explode" => Builtin::Split,
            "join" | "implode" => Builtin::Join,
            "map" | "lookup" => Builtin::Map,
            "multiply" => Builtin::Multiply,
            "divide" => Builtin::Divide,
            "round" => Builtin::Round,
            "abs" => Builtin::Abs,
            "hash" | "md5" | "sha1" | "sha256" => Builtin::Hash,
            "base64_encode" => Builtin::Base64Encode,
            "base64_decode" => Builtin::Base64Decode,
            "url_encode" | "urlencode" => Builtin::UrlEncode,
            "url_decode" | "urldecode" => Builtin::UrlDecode,
            "html_encode" | "htmlspecialchars" => Builtin::HtmlEncode,
            "html_decode" => Builtin::HtmlDecode,
            "strip_tags" => Builtin::StripTags,
            "default" => Builtin::Default,
            _ => return Err(()),
        })
    }
}

fn text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

fn number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        JsonValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn param_str<'a>(params: &'a Map<String, JsonValue>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| params.get(*k).and_then(JsonValue::as_str))
}

fn param_f64(params: &Map<String, JsonValue>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| params.get(*k).and_then(number))
}

/// Whole numbers come back as JSON integers.
fn float_value(f: f64) -> JsonValue {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 {
        json!(f as i64)
    } else {
        serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    }
}

fn map_strings(value: JsonValue, f: impl Fn(&str) -> String) -> JsonValue {
    match value {
        JsonValue::String(s) => JsonValue::String(f(&s)),
        JsonValue::Array(items) => JsonValue::Array(
            items
                .into_iter()
                .map(|item| match item {
                    JsonValue::String(s) => JsonValue::String(f(&s)),
                    other => other,
                })
                .collect(),
        ),
        other => other,
    }
}

fn ucfirst(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn parse_datetime(raw: &JsonValue, input_format: Option<&str>) -> Option<DateTime<Utc>> {
    if let Some(secs) = raw.as_i64() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    let s = raw.as_str()?.trim();
    if let Some(fmt) = input_format {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc());
        }
        return NaiveDate::parse_from_str(s, fmt)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%d/%m/%Y %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%d.%m.%Y", "%m/%d/%Y"] {
        if let Some(dt) = NaiveDate::parse_from_str(s, fmt)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
        {
            return Some(dt.and_utc());
        }
    }
    s.parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

fn hash(value: &str, algorithm: &str) -> Option<String> {
    let bytes = value.as_bytes();
    Some(match algorithm.to_ascii_lowercase().as_str() {
        "md5" => hex::encode(Md5::digest(bytes)),
        "sha1" => hex::encode(Sha1::digest(bytes)),
        "sha256" => hex::encode(Sha256::digest(bytes)),
        "sha512" => hex::encode(Sha512::digest(bytes)),
        _ => return None,
    })
}

/// `None` when `format` holds a specifier chrono cannot render.
pub fn format_datetime(dt: &DateTime<Utc>, format: &str) -> Option<String> {
    let mut out = String::new();
    write!(out, "{}", dt.format(format)).ok()?;
    Some(out)
}

fn url_decode(s: &str) -> String {
    let escaped = s.replace('&', "%26");
    url::form_urlencoded::parse(format!("v={}", escaped).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}

fn html_encode(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#039;")
}

fn html_decode(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

impl Builtin {
    pub fn apply(self, value: JsonValue, params: &Map<String, JsonValue>) -> JsonValue {
        match self {
            Builtin::Uppercase => map_strings(value, str::to_uppercase),
            Builtin::Lowercase => map_strings(value, str::to_lowercase),
            Builtin::Ucfirst => map_strings(value, ucfirst),
            Builtin::Ucwords => map_strings(value, |s| {
                s.split(' ').map(ucfirst).collect::<Vec<_>>().join(" ")
            }),
            Builtin::Trim => map_strings(value, |s| s.trim().to_string()),
            Builtin::Ltrim => map_strings(value, |s| s.trim_start().to_string()),
            Builtin::Rtrim => map_strings(value, |s| s.trim_end().to_string()),
            Builtin::Int => number(&value)
                .map(|f| json!(f.trunc() as i64))
                .unwrap_or(json!(0)),
            Builtin::Float => number(&value)
                .and_then(serde_json::Number::from_f64)
                .map(JsonValue::Number)
                .unwrap_or(json!(0.0)),
            Builtin::String => JsonValue::String(text(&value)),
            Builtin::Bool => JsonValue::Bool(match &value {
                JsonValue::Bool(b) => *b,
                JsonValue::Null => false,
                JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
                JsonValue::String(s) => !matches!(
                    s.trim().to_ascii_lowercase().as_str(),
                    "" | "0" | "false" | "no" | "off"
                ),
                JsonValue::Array(items) => !items.is_empty(),
                JsonValue::Object(map) => !map.is_empty(),
            }),
            Builtin::JsonEncode => JsonValue::String(value.to_string()),
            Builtin::JsonDecode => match &value {
                JsonValue::String(s) => serde_json::from_str(s).unwrap_or(value),
                _ => value,
            },
            Builtin::DateFormat => {
                let format = param_str(params, &["format", "output_format"]).unwrap_or("%Y-%m-%d");
                let input_format = param_str(params, &["input_format", "from"]);
                match parse_datetime(&value, input_format) {
                    Some(dt) => match format_datetime(&dt, format) {
                        Some(formatted) => JsonValue::String(formatted),
                        None => {
                            tracing::warn!(format, "invalid date format, value passed through");
                            value
                        }
                    },
                    None => value,
                }
            }
            Builtin::Replace => {
                let search = param_str(params, &["search", "from"]).unwrap_or_default();
                let replace = param_str(params, &["replace", "to"]).unwrap_or_default();
                if search.is_empty() {
                    return value;
                }
                map_strings(value, |s| s.replace(search, replace))
            }
            Builtin::RegexReplace => {
                let pattern = param_str(params, &["pattern"]).unwrap_or_default();
                let replacement = param_str(params, &["replacement", "replace"]).unwrap_or_default();
                match Regex::new(pattern) {
                    Ok(re) => map_strings(value, |s| re.replace_all(s, replacement).into_owned()),
                    Err(e) => {
                        tracing::warn!(pattern, error = %e, "invalid regex_replace pattern");
                        value
                    }
                }
            }
            Builtin::Substr => {
                let s: Vec<char> = text(&value).chars().collect();
                let len = s.len() as i64;
                let start = param_f64(params, &["start"]).unwrap_or(0.0) as i64;
                let start = if start < 0 { (len + start).max(0) } else { start.min(len) };
                let end = match param_f64(params, &["length"]) {
                    Some(l) if l < 0.0 => (len + l as i64).max(start),
                    Some(l) => (start + l as i64).min(len),
                    None => len,
                };
                JsonValue::String(s[start as usize..end as usize].iter().collect())
            }
            Builtin::Concat => {
                let prefix = param_str(params, &["prefix"]).unwrap_or_default();
                let suffix = param_str(params, &["suffix"]).unwrap_or_default();
                JsonValue::String(format!("{}{}{}", prefix, text(&value), suffix))
            }
            Builtin::Split => {
                let separator = param_str(params, &["separator", "delimiter"]).unwrap_or(",");
                match value {
                    JsonValue::String(s) if !s.is_empty() => JsonValue::Array(
                        s.split(separator)
                            .map(|p| JsonValue::String(p.trim().to_string()))
                            .collect(),
                    ),
                    JsonValue::String(_) => JsonValue::Array(Vec::new()),
                    other => other,
                }
            }
            Builtin::Join => {
                let separator = param_str(params, &["separator", "glue"]).unwrap_or(",");
                match value {
                    JsonValue::Array(items) => JsonValue::String(
                        items.iter().map(text).collect::<Vec<_>>().join(separator),
                    ),
                    other => other,
                }
            }
            Builtin::Map => {
                let table = params
                    .get("values")
                    .or_else(|| params.get("map"))
                    .and_then(JsonValue::as_object);
                match table.and_then(|t| t.get(&text(&value))) {
                    Some(mapped) => mapped.clone(),
                    None => params.get("default").cloned().unwrap_or(value),
                }
            }
            Builtin::Multiply => match (number(&value), param_f64(params, &["factor", "by", "value"])) {
                (Some(v), Some(f)) => float_value(v * f),
                _ => value,
            },
            Builtin::Divide => match (number(&value), param_f64(params, &["divisor", "by", "value"])) {
                (Some(_), Some(d)) if d == 0.0 => JsonValue::Null,
                (Some(v), Some(d)) => float_value(v / d),
                _ => value,
            },
            Builtin::Round => {
                let precision = param_f64(params, &["precision", "decimals"]).unwrap_or(0.0) as i32;
                match number(&value) {
                    Some(v) => {
                        let factor = 10f64.powi(precision);
                        float_value((v * factor).round() / factor)
                    }
                    None => value,
                }
            }
            Builtin::Abs => number(&value).map(|v| float_value(v.abs())).unwrap_or(value),
            Builtin::Hash => {
                let algorithm = param_str(params, &["algorithm", "algo"]).unwrap_or("sha256");
                match hash(&text(&value), algorithm) {
                    Some(digest) => JsonValue::String(digest),
                    None => {
                        tracing::warn!(algorithm, "unsupported hash algorithm, value passed through");
                        value
                    }
                }
            }
            Builtin::Base64Encode => JsonValue::String(BASE64.encode(text(&value))),
            Builtin::Base64Decode => match BASE64.decode(text(&value).trim()) {
                Ok(bytes) => JsonValue::String(String::from_utf8_lossy(&bytes).into_owned()),
                Err(_) => value,
            },
            Builtin::UrlEncode => JsonValue::String(
                url::form_urlencoded::byte_serialize(text(&value).as_bytes()).collect(),
            ),
            Builtin::UrlDecode => map_strings(value, url_decode),
            Builtin::HtmlEncode => map_strings(value, html_encode),
            Builtin::HtmlDecode => map_strings(value, html_decode),
            Builtin::StripTags => match Regex::new(r"<[^>]*>") {
                Ok(re) => map_strings(value, |s| re.replace_all(s, "").into_owned()),
                Err(_) => value,
            },
            Builtin::Default => {
                if super::path::is_empty(&value) {
                    params.get("value").cloned().unwrap_or(value)
                } else {
                    value
                }
            }
        }
    }
}

/// Registered transformers win over built-ins. Unknown names leave the
/// value untouched.
pub fn apply_step(value: JsonValue, step: &TransformStep, extensions: &Extensions) -> JsonValue {
    if let Ok(custom) = extensions.transformers.get(&step.name) {
        return custom.transform(value, &step.params);
    }
    match step.name.parse::<Builtin>() {
        Ok(builtin) => {
            let mut params = step.params.clone();
            // `md5`/`sha1`/`sha256` as names imply the algorithm.
            if builtin == Builtin::Hash && !params.contains_key("algorithm") {
                params.insert("algorithm".into(), json!(step.name));
            }
            builtin.apply(value, &params)
        }
        Err(()) => {
            tracing::debug!(name = %step.name, "unknown transformation, value passed through");
            value
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn run(name: &str, value: JsonValue, params: JsonValue) -> JsonValue {
        let JsonValue::Object(params) = params else {
            panic!("params must be an object");
        };
        apply_step(
            value,
            &TransformStep {
                name: name.into(),
                params,
            },
            &Extensions::new(),
        )
    }

    #[test]
    fn hash_names_pick_their_algorithm() {
        assert_eq!(run("md5", json!("abc"), json!({})), json!("900150983cd24fb0d6963f7d28e17f72"));
        assert_eq!(
            run("sha1", json!("abc"), json!({})),
            json!("a9993e364706816aba3e25717850c26c9cd0d89d")
        );
        assert_eq!(
            run("hash", json!("abc"), json!({})),
            json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        assert_eq!(run("hash", json!("abc"), json!({"algorithm": "crc32"})), json!("abc"));
    }

    #[test]
    fn invalid_date_formats_leave_the_value_alone() {
        assert_eq!(
            run("date_format", json!("2024-01-01"), json!({"format": "%Q"})),
            json!("2024-01-01")
        );
        assert_eq!(
            run("date_format", json!("2024-01-31"), json!({"format": "%d/%m/%Y"})),
            json!("31/01/2024")
        );
    }

    #[test]
    fn string_primitives() {
        assert_eq!(run("uppercase", json!("ada"), json!({})), json!("ADA"));
        assert_eq!(run("ucwords", json!("ada love lace"), json!({})), json!("Ada Love Lace"));
        assert_eq!(run("trim", json!("  x "), json!({})), json!("x"));
        assert_eq!(
            run("replace", json!("a-b-c"), json!({"search": "-", "replace": "+"})),
            json!("a+b+c")
        );
        assert_eq!(
            run("regex_replace", json!("a1b22"), json!({"pattern": "\\d+", "replacement": "#"})),
            json!("a#b#")
        );
        assert_eq!(run("substr", json!("abcdef"), json!({"start": 1, "length": 3})), json!("bcd"));
        assert_eq!(run("substr", json!("abcdef"), json!({"start": -2})), json!("ef"));
        assert_eq!(run("split", json!("a, b"), json!({})), json!(["a", "b"]));
        assert_eq!(run("join", json!(["a", 1]), json!({"separator": "|"})), json!("a|1"));
        assert_eq!(run("strip_tags", json!("<b>hi</b>"), json!({})), json!("hi"));
        assert_eq!(run("html_encode", json!("<a & b>"), json!({})), json!("&lt;a &amp; b&gt;"));
        assert_eq!(run("url_decode", json!("a%20b%26c"), json!({})), json!("a b&c"));
    }

    #[test]
    fn numeric_primitives() {
        assert_eq!(run("int", json!("42.9"), json!({})), json!(42));
        assert_eq!(run("multiply", json!("2.5"), json!({"factor": 4})), json!(10));
        assert_eq!(run("divide", json!(10), json!({"divisor": 0})), JsonValue::Null);
        assert_eq!(run("round", json!(3.14159), json!({"precision": 2})), json!(3.14));
        assert_eq!(run("bool", json!("off"), json!({})), json!(false));
    }

    #[test]
    fn dates_and_lookups() {
        assert_eq!(
            run("date_format", json!("2024-03-05T10:00:00Z"), json!({"format": "%d/%m/%Y"})),
            json!("05/03/2024")
        );
        assert_eq!(
            run(
                "date_format",
                json!("05.03.2024"),
                json!({"input_format": "%d.%m.%Y", "format": "%Y-%m-%d"})
            ),
            json!("2024-03-05")
        );
        assert_eq!(
            run("map", json!("1"), json!({"values": {"1": "active"}, "default": "unknown"})),
            json!("active")
        );
        assert_eq!(
            run("map", json!("9"), json!({"values": {"1": "active"}, "default": "unknown"})),
            json!("unknown")
        );
    }

    #[test]
    fn unknown_names_pass_through() {
        assert_eq!(run("frobnicate", json!("x"), json!({})), json!("x"));
    }

    struct Shout;

    impl crate::services::extensions::Transformer for Shout {
        fn transform(&self, value: JsonValue, _params: &Map<String, JsonValue>) -> JsonValue {
            json!(format!("{}!", text(&value)))
        }
    }

    #[test]
    fn custom_transformers_take_priority() {
        let extensions = Extensions::new();
        extensions.transformers.register("uppercase", Arc::new(Shout));
        let step = TransformStep::from_json(&json!("uppercase")).unwrap();
        assert_eq!(apply_step(json!("hi"), &step, &extensions), json!("hi!"));
    }

    #[test]
    fn step_forms() {
        let step = TransformStep::from_json(&json!({"type": "replace", "search": "a"})).unwrap();
        assert_eq!(step.name, "replace");
        assert_eq!(step.params.get("search"), Some(&json!("a")));

        let step =
            TransformStep::from_json(&json!({"name": "round", "params": {"precision": 1}})).unwrap();
        assert_eq!(step.params.get("precision"), Some(&json!(1)));
    }
}
