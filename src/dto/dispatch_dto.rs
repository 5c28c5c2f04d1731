use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

use crate::utils::ip;

/// Transport-neutral view of an inbound call to a custom endpoint.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    /// Lowercased header names.
    pub headers: HashMap<String, String>,
    pub query: Map<String, JsonValue>,
    pub path_params: Map<String, JsonValue>,
    pub body: Bytes,
    pub remote_addr: Option<IpAddr>,
    /// Headers trusted for the caller address, in order. Empty means the
    /// built-in list.
    pub ip_headers: Vec<String>,
}

impl InboundRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Media type without parameters, lowercased.
    pub fn content_type(&self) -> Option<String> {
        self.header("content-type").map(|ct| {
            ct.split(';')
                .next()
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase()
        })
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json_body(&self) -> Option<JsonValue> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }

    pub fn form_body(&self) -> Map<String, JsonValue> {
        url::form_urlencoded::parse(&self.body)
            .map(|(k, v)| (k.into_owned(), JsonValue::String(v.into_owned())))
            .collect()
    }

    pub fn client_ip(&self) -> Option<String> {
        if self.ip_headers.is_empty() {
            ip::client_ip(&self.headers, &ip::CLIENT_IP_HEADERS[..], self.remote_addr)
        } else {
            ip::client_ip(&self.headers, &self.ip_headers, self.remote_addr)
        }
    }

    /// Query parameters, then body fields, then path parameters; later
    /// sources win on key collisions.
    pub fn params(&self) -> JsonValue {
        let mut merged = self.query.clone();
        let body_fields = match self.content_type().as_deref() {
            Some("application/x-www-form-urlencoded") => self.form_body(),
            _ => match self.json_body() {
                Some(JsonValue::Object(map)) => map,
                _ => Map::new(),
            },
        };
        merged.extend(body_fields);
        merged.extend(self.path_params.clone());
        JsonValue::Object(merged)
    }
}

/// What a handler strategy answers with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerResponse {
    pub status: u16,
    pub body: JsonValue,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl HandlerResponse {
    pub fn new(status: u16, body: JsonValue) -> Self {
        Self {
            status,
            body,
            headers: BTreeMap::new(),
        }
    }

    pub fn ok(body: JsonValue) -> Self {
        Self::new(200, body)
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::new(status, json!({ "error": message.into() }))
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl IntoResponse for HandlerResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let declared_type = self.headers.get("content-type").cloned();

        let mut response = match (&self.body, declared_type.as_deref()) {
            (JsonValue::String(text), Some(ct)) if !ct.contains("json") => {
                (status, text.clone()).into_response()
            }
            _ => (status, Json(self.body)).into_response(),
        };

        for (name, value) in &self.headers {
            let Ok(name) = header::HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            if let Ok(value) = HeaderValue::from_str(value) {
                response.headers_mut().insert(name, value);
            }
        }
        response
    }
}
