use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};

use super::path::{get_nested, is_empty};
use crate::config::Config;
use crate::database::store::{Store, TableSchema};
use crate::database::table::Record;
use crate::error::{Error, Result};
use crate::models::{
    endpoint::Endpoint,
    etl::{EtlJob, EtlStage, EtlTemplate},
    event_log::EventLogEntry,
    external_service::ExternalService,
    scheduled_task::ScheduledTask,
    setting::Setting,
    webhook_log::WebhookLog,
};
use crate::services::connector_service::{ConnectorService, SendOptions};
use crate::services::extensions::Extensions;

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseOperation {
    #[default]
    Insert,
    Update,
    Upsert,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    #[default]
    Json,
    Csv,
}

impl FileFormat {
    fn extension(self) -> &'static str {
        match self {
            FileFormat::Json => "json",
            FileFormat::Csv => "csv",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "destination", rename_all = "snake_case")]
pub enum LoadConfig {
    ExternalService {
        /// Falls back to the template's service.
        service_id: Option<i64>,
        #[serde(default, alias = "path")]
        endpoint: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        headers: std::collections::BTreeMap<String, String>,
    },
    Database {
        table: String,
        #[serde(default)]
        operation: DatabaseOperation,
        key_field: Option<String>,
        #[serde(default)]
        create_if_missing: bool,
    },
    Action {
        action: String,
    },
    File {
        #[serde(default)]
        format: FileFormat,
        filename: Option<String>,
    },
}

impl LoadConfig {
    pub fn parse(raw: &JsonValue) -> Result<Option<Self>> {
        if is_empty(raw) {
            return Ok(None);
        }
        if let Some(destination) = raw.get("destination").and_then(JsonValue::as_str) {
            const KNOWN: [&str; 4] = ["external_service", "database", "action", "file"];
            if !KNOWN.contains(&destination) {
                return Err(Error::pipeline(
                    EtlStage::Load,
                    format!("unknown load destination '{}'", destination),
                ));
            }
        }
        serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|e| Error::pipeline(EtlStage::Load, format!("invalid load config: {}", e)))
    }
}

pub struct LoadContext<'a> {
    pub template: &'a EtlTemplate,
    pub job_id: i64,
    pub connector: &'a ConnectorService,
    pub store: &'a Arc<dyn Store>,
    pub extensions: &'a Extensions,
    pub config: &'a Config,
}

fn stage_error(message: impl Into<String>) -> Error {
    Error::pipeline(EtlStage::Load, message)
}

fn records(data: &JsonValue) -> Vec<Map<String, JsonValue>> {
    match data {
        JsonValue::Array(items) => items
            .iter()
            .filter_map(|item| item.as_object().cloned())
            .collect(),
        JsonValue::Object(map) => vec![map.clone()],
        _ => Vec::new(),
    }
}

/// Runs the load phase. The returned value always carries `destination` and
/// `success`; a `success: false` result fails the job.
pub async fn load(
    data: &JsonValue,
    config: Option<&LoadConfig>,
    ctx: &LoadContext<'_>,
) -> Result<JsonValue> {
    let Some(config) = config else {
        return Ok(json!({ "destination": "none", "success": true, "data": data }));
    };

    match config {
        LoadConfig::ExternalService {
            service_id,
            endpoint,
            method,
            headers,
        } => {
            let service_id = service_id
                .or(ctx.template.external_service_id)
                .ok_or_else(|| stage_error("no external service configured"))?;
            let options = SendOptions {
                headers: headers.clone(),
                ..Default::default()
            };
            let response = ctx
                .connector
                .send(service_id, endpoint, Some(data), method, &options)
                .await
                .map_err(|e| stage_error(e.to_string()))?;
            Ok(json!({
                "destination": "external_service",
                "success": response.success,
                "service_id": service_id,
                "status_code": response.status_code,
                "attempts": response.attempts,
                "response": response.body,
                "error": response.error,
            }))
        }
        LoadConfig::Database {
            table,
            operation,
            key_field,
            create_if_missing,
        } => {
            load_database(ctx.store.as_ref(), data, table, *operation, key_field.as_deref(), *create_if_missing)
                .await
        }
        LoadConfig::Action { action } => {
            let outcome = ctx
                .extensions
                .fire_action(action, data, None)
                .await
                .map_err(|e| stage_error(e.to_string()))?;
            let success = outcome
                .as_ref()
                .and_then(|v| v.get("success"))
                .and_then(JsonValue::as_bool)
                .unwrap_or(true);
            Ok(json!({
                "destination": "action",
                "action": action,
                "success": success,
                "result": outcome,
            }))
        }
        LoadConfig::File { format, filename } => {
            write_export(data, *format, filename.as_deref(), ctx).await
        }
    }
}

const RESERVED_TABLES: [&str; 8] = [
    Endpoint::TABLE,
    WebhookLog::TABLE,
    EtlTemplate::TABLE,
    EtlJob::TABLE,
    ExternalService::TABLE,
    ScheduledTask::TABLE,
    EventLogEntry::TABLE,
    Setting::TABLE,
];

async fn load_database(
    store: &dyn Store,
    data: &JsonValue,
    table: &str,
    operation: DatabaseOperation,
    key_field: Option<&str>,
    create_if_missing: bool,
) -> Result<JsonValue> {
    if RESERVED_TABLES.contains(&table) {
        return Err(stage_error(format!("table '{}' is managed internally", table)));
    }
    let rows = records(data);

    if !store.table_exists(table).await {
        if !create_if_missing {
            return Err(stage_error(format!("table '{}' does not exist", table)));
        }
        let columns: Vec<&str> = rows
            .first()
            .map(|r| r.keys().map(String::as_str).collect())
            .unwrap_or_default();
        let mut schema = TableSchema::new(&columns);
        if let Some(key) = key_field {
            schema = schema.with_index(key);
        }
        store
            .create_table(table, &schema)
            .await
            .into_data()
            .map_err(|e| stage_error(e.to_string()))?;
        tracing::info!(table, "created load destination table");
    }

    let (mut inserted, mut updated, mut skipped) = (0u64, 0u64, 0u64);
    for row in rows {
        let matches = match (operation, key_field) {
            (DatabaseOperation::Insert, _) => Vec::new(),
            (_, None) => return Err(stage_error("key_field is required for update")),
            (_, Some(key)) => {
                let Some(value) = get_nested(&JsonValue::Object(row.clone()), key).cloned() else {
                    skipped += 1;
                    continue;
                };
                let found = store
                    .get_rows_data(table, Some(key), Some(&value), true)
                    .await
                    .into_data()
                    .map_err(|e| stage_error(e.to_string()))?;
                found
                    .as_array()
                    .map(|rows| rows.iter().filter_map(|r| r.get("id").and_then(JsonValue::as_i64)).collect())
                    .unwrap_or_default()
            }
        };

        if matches.is_empty() {
            if operation == DatabaseOperation::Update {
                skipped += 1;
                continue;
            }
            store
                .insert_row(table, row)
                .await
                .into_data()
                .map_err(|e| stage_error(e.to_string()))?;
            inserted += 1;
            continue;
        }

        for id in matches {
            store
                .update_row(table, id, row.clone())
                .await
                .into_data()
                .map_err(|e| stage_error(e.to_string()))?;
            updated += 1;
        }
    }

    Ok(json!({
        "destination": "database",
        "success": true,
        "table": table,
        "inserted": inserted,
        "updated": updated,
        "skipped": skipped,
    }))
}

fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    cleaned.trim_start_matches('.').to_string()
}

fn csv_cell(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn render_csv(data: &JsonValue) -> Result<Vec<u8>> {
    let rows = records(data);
    let mut headers: Vec<String> = Vec::new();
    for row in &rows {
        for key in row.keys() {
            if !headers.contains(key) {
                headers.push(key.clone());
            }
        }
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    let write_err = |e: csv::Error| stage_error(format!("csv encoding failed: {}", e));
    writer.write_record(&headers).map_err(write_err)?;
    for row in &rows {
        writer
            .write_record(headers.iter().map(|h| csv_cell(row.get(h))))
            .map_err(write_err)?;
    }
    writer
        .into_inner()
        .map_err(|e| stage_error(format!("csv encoding failed: {}", e)))
}

async fn write_export(
    data: &JsonValue,
    format: FileFormat,
    filename: Option<&str>,
    ctx: &LoadContext<'_>,
) -> Result<JsonValue> {
    let filename = match filename.map(sanitize_filename).filter(|f| !f.is_empty()) {
        Some(name) if name.ends_with(&format!(".{}", format.extension())) => name,
        Some(name) => format!("{}.{}", name, format.extension()),
        None => format!(
            "etl_{}_{}_{}.{}",
            ctx.template.id,
            ctx.job_id,
            Utc::now().format("%Y%m%d%H%M%S"),
            format.extension()
        ),
    };

    let contents = match format {
        FileFormat::Json => serde_json::to_vec_pretty(data)?,
        FileFormat::Csv => render_csv(data)?,
    };

    let dir = Path::new(&ctx.config.export_dir);
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| stage_error(format!("cannot create export dir: {}", e)))?;
    let path = dir.join(&filename);
    tokio::fs::write(&path, &contents)
        .await
        .map_err(|e| stage_error(format!("cannot write export file: {}", e)))?;

    let url = format!(
        "{}/exports/{}",
        ctx.config.public_base_url.trim_end_matches('/'),
        filename
    );
    tracing::info!(path = %path.display(), bytes = contents.len(), "wrote export file");
    Ok(json!({
        "destination": "file",
        "success": true,
        "format": format.extension(),
        "filename": filename,
        "url": url,
        "bytes": contents.len(),
    }))
}
