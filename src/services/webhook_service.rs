//! Inbound webhook receiver. Every call is logged before it is validated so
//! rejected and malformed deliveries stay auditable.

use std::sync::Arc;

use chrono::{Duration, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

use crate::database::{
    store::Store,
    table::{fields, Table},
};
use crate::dto::dispatch_dto::{HandlerResponse, InboundRequest};
use crate::dto::log_dto::WebhookLogQuery;
use crate::error::{Error, Result};
use crate::models::{
    endpoint::Endpoint,
    etl::JobStatus,
    webhook_log::{WebhookLog, WebhookStatus},
};
use crate::services::{
    etl::EtlEngine,
    event_bus::{EventBus, SystemEvent},
    event_log_service::EventLogService,
    extensions::Extensions,
};
use crate::utils::crypto::{self, DigestFormat, SignatureAlgorithm};

pub const REDACTED: &str = "[REDACTED]";
const SENSITIVE_HEADERS: [&str; 6] = [
    "authorization",
    "api-key",
    "x-api-key",
    "cookie",
    "webhook-secret",
    "x-webhook-secret",
];

fn default_signature_header() -> String {
    "x-webhook-signature".to_string()
}

fn default_message() -> String {
    "Webhook received".to_string()
}

fn default_response_code() -> u16 {
    200
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub require_signature: bool,
    #[serde(default = "default_signature_header")]
    pub signature_header: String,
    pub secret: Option<String>,
    #[serde(default)]
    pub signature_algorithm: SignatureAlgorithm,
    #[serde(default)]
    pub signature_format: DigestFormat,
    /// Header whose value identifies the sender, e.g. `x-github-delivery`.
    pub source_identifier_header: Option<String>,
    pub etl_template_id: Option<i64>,
    #[serde(default)]
    pub process_immediately: bool,
    #[serde(default = "default_message")]
    pub response_message: String,
    #[serde(default)]
    pub include_payload: bool,
    #[serde(default = "default_response_code")]
    pub response_code: u16,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            require_signature: false,
            signature_header: default_signature_header(),
            secret: None,
            signature_algorithm: SignatureAlgorithm::default(),
            signature_format: DigestFormat::default(),
            source_identifier_header: None,
            etl_template_id: None,
            process_immediately: false,
            response_message: default_message(),
            include_payload: false,
            response_code: default_response_code(),
        }
    }
}

impl WebhookConfig {
    pub fn parse(raw: &JsonValue) -> Result<Self> {
        if raw.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(raw.clone())
            .map_err(|e| Error::BadRequest(format!("invalid webhook configuration: {}", e)))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrySummary {
    pub retried: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub fn redact_headers(headers: &std::collections::HashMap<String, String>) -> JsonValue {
    let mut sorted: Vec<(&String, &String)> = headers.iter().collect();
    sorted.sort();
    let map: Map<String, JsonValue> = sorted
        .into_iter()
        .map(|(name, value)| {
            let value = if SENSITIVE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                REDACTED.to_string()
            } else {
                value.clone()
            };
            (name.clone(), JsonValue::String(value))
        })
        .collect();
    JsonValue::Object(map)
}

fn attributes(start: &BytesStart<'_>) -> Map<String, JsonValue> {
    start
        .attributes()
        .flatten()
        .map(|attr| {
            let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
            let value = attr
                .unescape_value()
                .map(|v| v.into_owned())
                .unwrap_or_default();
            (key, JsonValue::String(value))
        })
        .collect()
}

fn insert_child(parent: &mut Map<String, JsonValue>, name: String, value: JsonValue) {
    match parent.get_mut(&name) {
        Some(JsonValue::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = JsonValue::Array(vec![first, value]);
        }
        None => {
            parent.insert(name, value);
        }
    }
}

struct Frame {
    name: String,
    children: Map<String, JsonValue>,
    text: String,
}

impl Frame {
    fn into_value(self) -> JsonValue {
        let text = self.text.trim().to_string();
        if self.children.is_empty() {
            return if text.is_empty() {
                JsonValue::Null
            } else {
                JsonValue::String(text)
            };
        }
        let mut children = self.children;
        if !text.is_empty() {
            children.insert("#text".into(), JsonValue::String(text));
        }
        JsonValue::Object(children)
    }
}

/// Parses an XML document into nested maps. Repeated elements become lists
/// and attributes are kept under `@name` keys.
pub fn parse_xml(body: &str) -> Result<JsonValue> {
    let mut reader = Reader::from_str(body);
    let mut stack: Vec<Frame> = vec![Frame {
        name: String::new(),
        children: Map::new(),
        text: String::new(),
    }];

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(Frame {
                name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                children: attributes(&e),
                text: String::new(),
            }),
            Ok(Event::Empty(e)) => {
                let frame = Frame {
                    name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                    children: attributes(&e),
                    text: String::new(),
                };
                if let Some(parent) = stack.last_mut() {
                    let name = frame.name.clone();
                    insert_child(&mut parent.children, name, frame.into_value());
                }
            }
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| Error::BadRequest(format!("malformed XML: {}", e)))?;
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text);
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Ok(Event::End(_)) => {
                if stack.len() < 2 {
                    return Err(Error::BadRequest("malformed XML: unbalanced end tag".into()));
                }
                if let Some(frame) = stack.pop() {
                    let name = frame.name.clone();
                    if let Some(parent) = stack.last_mut() {
                        insert_child(&mut parent.children, name, frame.into_value());
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::BadRequest(format!("malformed XML: {}", e))),
        }
    }

    if stack.len() != 1 {
        return Err(Error::BadRequest("malformed XML: unclosed element".into()));
    }
    let root = stack.pop().map(|f| f.children).unwrap_or_default();
    if root.is_empty() {
        return Err(Error::BadRequest("malformed XML: no root element".into()));
    }
    Ok(JsonValue::Object(root))
}

/// Decodes the payload according to its declared content type.
pub fn extract_payload(request: &InboundRequest) -> Result<JsonValue> {
    let content_type = request.content_type().unwrap_or_default();
    if content_type.contains("json") {
        if request.body.is_empty() {
            return Ok(JsonValue::Object(Map::new()));
        }
        return serde_json::from_slice(&request.body)
            .map_err(|e| Error::BadRequest(format!("malformed JSON payload: {}", e)));
    }
    if content_type == "application/x-www-form-urlencoded" {
        return Ok(JsonValue::Object(request.form_body()));
    }
    if content_type.contains("xml") {
        return parse_xml(&request.body_text());
    }
    Ok(request.params())
}

#[derive(Clone)]
pub struct WebhookService {
    logs: Table<WebhookLog>,
    endpoints: Table<Endpoint>,
    etl: EtlEngine,
    extensions: Arc<Extensions>,
    events: Arc<EventBus>,
    event_log: EventLogService,
}

impl WebhookService {
    pub fn new(
        store: Arc<dyn Store>,
        etl: EtlEngine,
        extensions: Arc<Extensions>,
        events: Arc<EventBus>,
        event_log: EventLogService,
    ) -> Self {
        Self {
            logs: Table::new(store.clone()),
            endpoints: Table::new(store),
            etl,
            extensions,
            events,
            event_log,
        }
    }

    pub fn logs(&self) -> &Table<WebhookLog> {
        &self.logs
    }

    /// Newest first.
    pub async fn list(&self, query: &WebhookLogQuery) -> Result<Vec<WebhookLog>> {
        let status: Option<WebhookStatus> = query
            .status
            .as_deref()
            .map(|s| {
                serde_json::from_value(json!(s))
                    .map_err(|_| Error::BadRequest(format!("unknown webhook status: {}", s)))
            })
            .transpose()?;
        let logs = match query.endpoint_id {
            Some(id) => self.logs.find_by("endpoint_id", json!(id)).await?,
            None => self.logs.all().await?,
        };
        let mut logs: Vec<WebhookLog> = logs
            .into_iter()
            .filter(|l| status.map(|s| l.status == s).unwrap_or(true))
            .collect();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        logs.truncate(query.limit.unwrap_or(100));
        Ok(logs)
    }

    pub async fn receive(&self, request: &InboundRequest, endpoint: &Endpoint) -> Result<HandlerResponse> {
        let config = WebhookConfig::parse(&endpoint.handler_config);
        let source_identifier = config
            .as_ref()
            .ok()
            .and_then(|c| c.source_identifier_header.as_deref())
            .and_then(|h| request.header(h))
            .map(str::to_string);

        let log = self
            .logs
            .insert(&WebhookLog {
                id: 0,
                endpoint_id: endpoint.id,
                source_ip: request.client_ip(),
                source_identifier,
                request_method: request.method.clone(),
                request_headers: redact_headers(&request.headers),
                request_payload: JsonValue::Null,
                raw_body: request.body_text(),
                content_type: request.content_type(),
                status: WebhookStatus::Pending,
                response_code: None,
                response_body: None,
                error_message: None,
                retryable: true,
                retry_count: 0,
                etl_job_id: None,
                processed_at: None,
                created_at: Utc::now(),
            })
            .await?;

        let config = match config {
            Ok(config) => config,
            Err(e) => return Err(self.reject(&log, endpoint, e).await),
        };

        if config.require_signature {
            if let Err(e) = verify(request, &config) {
                return Err(self.reject(&log, endpoint, e).await);
            }
        }

        let payload = match extract_payload(request) {
            Ok(payload) => payload,
            Err(e) => return Err(self.reject(&log, endpoint, e).await),
        };

        let log = self
            .logs
            .update(
                log.id,
                fields([
                    ("status", json!(WebhookStatus::Received)),
                    ("request_payload", payload.clone()),
                ]),
            )
            .await?;

        let log = match self.hand_off(&log, endpoint, &config).await {
            Ok(log) => log,
            Err(e) => {
                self.mark_failed(&log, &e.to_string(), e.status_code().as_u16(), true)
                    .await?;
                self.publish(&log, WebhookStatus::Failed);
                return Err(e);
            }
        };

        let mut body = json!({
            "success": true,
            "message": config.response_message,
            "log_id": log.id,
        });
        if let Some(job_id) = log.etl_job_id {
            body["etl_job_id"] = json!(job_id);
        }
        if config.include_payload {
            body["payload"] = payload;
        }
        let body = self.extensions.filter_webhook_response(body, &log, endpoint);

        let log = self
            .logs
            .update(
                log.id,
                fields([
                    ("response_code", json!(config.response_code)),
                    ("response_body", body.clone()),
                    ("processed_at", json!(Utc::now())),
                ]),
            )
            .await?;
        self.publish(&log, log.status);
        tracing::info!(log_id = log.id, endpoint_id = endpoint.id, status = ?log.status, "webhook received");

        Ok(HandlerResponse::new(config.response_code, body))
    }

    /// Queues (and optionally runs) the configured ETL template, otherwise
    /// marks the delivery processed.
    async fn hand_off(&self, log: &WebhookLog, endpoint: &Endpoint, config: &WebhookConfig) -> Result<WebhookLog> {
        let Some(template_id) = config.etl_template_id else {
            return self
                .logs
                .update(log.id, fields([("status", json!(WebhookStatus::Processed))]))
                .await;
        };

        let job = self
            .etl
            .create_job(
                template_id,
                log.request_payload.clone(),
                Some(log.id),
                Some(endpoint.id),
            )
            .await?;
        let mut log = self
            .logs
            .update(
                log.id,
                fields([
                    ("status", json!(WebhookStatus::Queued)),
                    ("etl_job_id", json!(job.id)),
                ]),
            )
            .await?;

        if config.process_immediately {
            let job = self.etl.run_job(job.id).await?;
            log = match job.status {
                JobStatus::Completed => {
                    self.logs
                        .update(log.id, fields([("status", json!(WebhookStatus::Processed))]))
                        .await?
                }
                // The job keeps its own retry state.
                _ => {
                    self.logs
                        .update(
                            log.id,
                            fields([
                                ("status", json!(WebhookStatus::Failed)),
                                ("retryable", json!(false)),
                                ("error_message", json!(format!("ETL job {} failed", job.id))),
                            ]),
                        )
                        .await?
                }
            };
        }
        Ok(log)
    }

    async fn mark_failed(&self, log: &WebhookLog, message: &str, code: u16, retryable: bool) -> Result<WebhookLog> {
        self.logs
            .update(
                log.id,
                fields([
                    ("status", json!(WebhookStatus::Failed)),
                    ("error_message", json!(message)),
                    ("response_code", json!(code)),
                    ("retryable", json!(retryable)),
                    ("processed_at", json!(Utc::now())),
                ]),
            )
            .await
    }

    /// Records a validation failure. Such deliveries are never retried.
    async fn reject(&self, log: &WebhookLog, endpoint: &Endpoint, error: Error) -> Error {
        let code = error.status_code().as_u16();
        if let Err(e) = self.mark_failed(log, &error.to_string(), code, false).await {
            tracing::error!(log_id = log.id, error = %e, "failed to record webhook rejection");
        }
        self.publish(log, WebhookStatus::Failed);
        self.event_log
            .warning(
                "webhook",
                &format!("webhook rejected on endpoint '{}'", endpoint.slug),
                json!({ "log_id": log.id, "endpoint_id": endpoint.id, "error": error.to_string() }),
            )
            .await;
        error
    }

    fn publish(&self, log: &WebhookLog, status: WebhookStatus) {
        self.events.publish(SystemEvent::WebhookReceived {
            log_id: log.id,
            endpoint_id: log.endpoint_id,
            status,
        });
    }

    /// Replays one failed delivery from its stored payload.
    pub async fn retry(&self, log_id: i64, max_retries: u32) -> Result<WebhookLog> {
        let log = self.logs.get(log_id).await?;
        if log.status != WebhookStatus::Failed || !log.retryable {
            return Err(Error::BadRequest(format!("webhook log {} is not retryable", log_id)));
        }
        if log.retry_count >= max_retries {
            return Err(Error::BadRequest(format!(
                "webhook log {} reached the retry limit of {}",
                log_id, max_retries
            )));
        }

        let log = self
            .logs
            .update(
                log.id,
                fields([
                    ("retry_count", json!(log.retry_count + 1)),
                    ("status", json!(WebhookStatus::Received)),
                    ("error_message", JsonValue::Null),
                ]),
            )
            .await?;

        let endpoint = match self.endpoints.get(log.endpoint_id).await {
            Ok(endpoint) => endpoint,
            Err(Error::NotFound(_)) => {
                return self
                    .mark_failed(&log, "endpoint no longer exists", 404, false)
                    .await;
            }
            Err(e) => return Err(e),
        };
        let config = WebhookConfig::parse(&endpoint.handler_config)?;

        match self.hand_off(&log, &endpoint, &config).await {
            Ok(log) => {
                self.publish(&log, log.status);
                Ok(log)
            }
            Err(e) => {
                let failed = self
                    .mark_failed(&log, &e.to_string(), e.status_code().as_u16(), true)
                    .await?;
                self.publish(&failed, WebhookStatus::Failed);
                Ok(failed)
            }
        }
    }

    /// Replays failed, retryable deliveries still under the retry cap.
    pub async fn retry_failed(&self, max_retries: u32, limit: usize) -> Result<RetrySummary> {
        let mut candidates: Vec<WebhookLog> = self
            .logs
            .find_by("status", json!(WebhookStatus::Failed))
            .await?
            .into_iter()
            .filter(|log| log.retryable && log.retry_count < max_retries)
            .collect();
        candidates.sort_by_key(|log| (log.created_at, log.id));

        let mut summary = RetrySummary::default();
        for log in candidates.into_iter().take(limit) {
            summary.retried += 1;
            match self.retry(log.id, max_retries).await {
                Ok(log) if log.status != WebhookStatus::Failed => summary.succeeded += 1,
                Ok(_) => summary.failed += 1,
                Err(e) => {
                    tracing::warn!(log_id = log.id, error = %e, "webhook retry failed");
                    summary.failed += 1;
                }
            }
        }
        if summary.retried > 0 {
            tracing::info!(?summary, "webhook retry pass finished");
        }
        Ok(summary)
    }

    pub async fn cleanup(&self, days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(days);
        let mut deleted = 0;
        for log in self.logs.all().await? {
            if log.created_at < cutoff {
                self.logs.delete(log.id).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

fn verify(request: &InboundRequest, config: &WebhookConfig) -> Result<()> {
    let Some(secret) = config.secret.as_deref().filter(|s| !s.is_empty()) else {
        return Err(Error::Unauthorized("webhook secret is not configured".into()));
    };
    let Some(provided) = request.header(&config.signature_header) else {
        return Err(Error::Unauthorized("missing webhook signature".into()));
    };
    if crypto::verify_signature(
        config.signature_algorithm,
        config.signature_format,
        secret,
        &request.body,
        provided,
    ) {
        Ok(())
    } else {
        Err(Error::Unauthorized("invalid webhook signature".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn sensitive_headers_are_redacted() {
        let mut headers = HashMap::new();
        headers.insert("authorization".to_string(), "Bearer abc".to_string());
        headers.insert("cookie".to_string(), "sid=1".to_string());
        headers.insert("x-api-key".to_string(), "k".to_string());
        headers.insert("user-agent".to_string(), "curl".to_string());
        let redacted = redact_headers(&headers);
        assert_eq!(redacted["authorization"], REDACTED);
        assert_eq!(redacted["cookie"], REDACTED);
        assert_eq!(redacted["x-api-key"], REDACTED);
        assert_eq!(redacted["user-agent"], "curl");
    }

    #[test]
    fn xml_becomes_nested_map() {
        let xml = r#"<order id="7"><item>a</item><item>b</item><total currency="EUR">12.5</total><note/></order>"#;
        let parsed = parse_xml(xml).unwrap();
        assert_eq!(parsed["order"]["@id"], "7");
        assert_eq!(parsed["order"]["item"], json!(["a", "b"]));
        assert_eq!(parsed["order"]["total"]["#text"], "12.5");
        assert_eq!(parsed["order"]["total"]["@currency"], "EUR");
        assert_eq!(parsed["order"]["note"], JsonValue::Null);
    }

    #[test]
    fn malformed_xml_is_rejected() {
        assert!(parse_xml("<a><b></a>").is_err());
        assert!(parse_xml("").is_err());
    }

    #[test]
    fn config_defaults() {
        let config = WebhookConfig::parse(&json!({})).unwrap();
        assert!(!config.require_signature);
        assert_eq!(config.signature_header, "x-webhook-signature");
        assert_eq!(config.response_code, 200);
        assert!(WebhookConfig::parse(&json!({"etl_template_id": "x"})).is_err());
    }

    #[test]
    fn signature_verification() {
        let mut headers = HashMap::new();
        let body = br#"{"id":7}"#;
        let signature = crypto::sign(SignatureAlgorithm::Sha256, DigestFormat::Hex, "s", body);
        headers.insert("x-webhook-signature".to_string(), format!("sha256={}", signature));
        let request = InboundRequest {
            headers,
            body: bytes::Bytes::from_static(body),
            ..Default::default()
        };
        let config = WebhookConfig::parse(&json!({"require_signature": true, "secret": "s"})).unwrap();
        assert!(verify(&request, &config).is_ok());

        let wrong = WebhookConfig::parse(&json!({"require_signature": true, "secret": "t"})).unwrap();
        assert!(matches!(verify(&request, &wrong), Err(Error::Unauthorized(_))));

        let unset = WebhookConfig::parse(&json!({"require_signature": true})).unwrap();
        assert!(verify(&request, &unset).is_err());
    }
}
