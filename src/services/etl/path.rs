//! Dot-notation lookups into nested JSON, with `[n]` array indexes.

use serde_json::{Map, Value as JsonValue};

#[derive(Debug, Clone, PartialEq)]
enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

fn segments(path: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    for part in path.split('.').filter(|p| !p.is_empty()) {
        let (key, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            out.push(Segment::Key(key));
        }
        while let Some(close) = rest.find(']') {
            let inner = rest[1..close].trim();
            match inner.parse() {
                Ok(index) => out.push(Segment::Index(index)),
                Err(_) => out.push(Segment::Key(inner)),
            }
            rest = &rest[close + 1..];
            if !rest.starts_with('[') {
                break;
            }
        }
    }
    out
}

/// Resolves `path` against `data`. Missing segments give `None`.
pub fn get_nested<'a>(data: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    segments(path)
        .into_iter()
        .try_fold(data, |current, segment| match (segment, current) {
            (Segment::Key(key), JsonValue::Object(map)) => map.get(key),
            (Segment::Key(key), JsonValue::Array(items)) => {
                key.parse::<usize>().ok().and_then(|i| items.get(i))
            }
            (Segment::Index(i), JsonValue::Array(items)) => items.get(i),
            _ => None,
        })
}

/// Like [`get_nested`] but yields `null` for missing paths.
pub fn lookup(data: &JsonValue, path: &str) -> JsonValue {
    get_nested(data, path).cloned().unwrap_or(JsonValue::Null)
}

/// Writes `value` at a dot path, creating intermediate objects.
pub fn set_nested(target: &mut Map<String, JsonValue>, path: &str, separator: &str, value: JsonValue) {
    let mut parts: Vec<&str> = path.split(separator).filter(|p| !p.is_empty()).collect();
    let Some(last) = parts.pop() else {
        return;
    };
    let mut current = target;
    for part in parts {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
        if !entry.is_object() {
            *entry = JsonValue::Object(Map::new());
        }
        let JsonValue::Object(next) = entry else {
            return;
        };
        current = next;
    }
    current.insert(last.to_string(), value);
}

/// Null, empty string, empty array and empty object.
pub fn is_empty(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bracket_indexes_resolve() {
        let data = json!({"a": {"b": [{"c": 1}, {"c": 2}]}});
        assert_eq!(get_nested(&data, "a.b[0].c"), Some(&json!(1)));
        assert_eq!(get_nested(&data, "a.b[1].c"), Some(&json!(2)));
        assert_eq!(get_nested(&data, "a.b.1.c"), Some(&json!(2)));
    }

    #[test]
    fn missing_segments_are_null() {
        let data = json!({"a": {"b": [{"c": 1}]}});
        assert_eq!(lookup(&data, "a.x.c"), JsonValue::Null);
        assert_eq!(lookup(&data, "a.b[5].c"), JsonValue::Null);
        assert_eq!(lookup(&data, "a.b[0].c.d"), JsonValue::Null);
        assert_eq!(lookup(&json!("scalar"), "a"), JsonValue::Null);
    }

    #[test]
    fn nested_indexes() {
        let data = json!({"grid": [[1, 2], [3, 4]]});
        assert_eq!(lookup(&data, "grid[1][0]"), json!(3));
    }

    #[test]
    fn set_nested_builds_objects() {
        let mut map = Map::new();
        set_nested(&mut map, "a_b_c", "_", json!(1));
        set_nested(&mut map, "a_d", "_", json!(2));
        assert_eq!(JsonValue::Object(map), json!({"a": {"b": {"c": 1}, "d": 2}}));
    }
}
