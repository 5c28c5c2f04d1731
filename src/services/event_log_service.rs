use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::database::{store::Store, table::Table};
use crate::error::Result;
use crate::models::event_log::{EventLogEntry, LogLevel};
use crate::services::settings_service::SettingsService;

/// Buffered, leveled audit log. Entries under the configured `log_level`
/// are dropped; the rest are written once the buffer fills or on `flush`.
#[derive(Clone)]
pub struct EventLogService {
    entries: Table<EventLogEntry>,
    settings: SettingsService,
    buffer: Arc<Mutex<Vec<EventLogEntry>>>,
}

#[derive(Debug, Default, Clone)]
pub struct EventLogQuery {
    pub level: Option<LogLevel>,
    pub category: Option<String>,
    pub limit: Option<usize>,
}

impl EventLogService {
    pub fn new(store: Arc<dyn Store>, settings: SettingsService) -> Self {
        Self {
            entries: Table::new(store),
            settings,
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn min_level(&self) -> LogLevel {
        self.settings
            .get_string("log_level")
            .await
            .parse()
            .unwrap_or(LogLevel::Info)
    }

    pub async fn log(
        &self,
        level: LogLevel,
        category: &str,
        message: &str,
        context: JsonValue,
        ip_address: Option<String>,
    ) {
        if level < self.min_level().await {
            return;
        }

        match level {
            LogLevel::Debug => tracing::debug!(category, %context, "{}", message),
            LogLevel::Info => tracing::info!(category, %context, "{}", message),
            LogLevel::Warning => tracing::warn!(category, %context, "{}", message),
            LogLevel::Error | LogLevel::Critical => {
                tracing::error!(category, level = %level, %context, "{}", message)
            }
        }

        let entry = EventLogEntry {
            id: 0,
            level,
            category: category.to_string(),
            message: message.to_string(),
            context,
            user_id: None,
            ip_address,
            created_at: Utc::now(),
        };

        let capacity = self.settings.get_int("log_buffer_size").await.max(1) as usize;
        let full = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(entry);
            buffer.len() >= capacity
        };
        if full {
            self.flush().await;
        }
    }

    pub async fn info(&self, category: &str, message: &str, context: JsonValue) {
        self.log(LogLevel::Info, category, message, context, None).await
    }

    pub async fn warning(&self, category: &str, message: &str, context: JsonValue) {
        self.log(LogLevel::Warning, category, message, context, None).await
    }

    pub async fn error(&self, category: &str, message: &str, context: JsonValue) {
        self.log(LogLevel::Error, category, message, context, None).await
    }

    pub async fn critical(&self, category: &str, message: &str, context: JsonValue) {
        self.log(LogLevel::Critical, category, message, context, None).await
    }

    /// Writes buffered entries. Entries that fail to persist are reported
    /// through tracing and dropped.
    pub async fn flush(&self) -> usize {
        let pending = std::mem::take(&mut *self.buffer.lock().await);
        let mut written = 0;
        for entry in &pending {
            match self.entries.insert(entry).await {
                Ok(_) => written += 1,
                Err(e) => tracing::error!(error = %e, "failed to persist event log entry"),
            }
        }
        written
    }

    pub async fn pending(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Newest first.
    pub async fn list(&self, query: &EventLogQuery) -> Result<Vec<EventLogEntry>> {
        self.flush().await;
        let mut entries: Vec<EventLogEntry> = self
            .entries
            .all()
            .await?
            .into_iter()
            .filter(|e| query.level.map(|l| e.level == l).unwrap_or(true))
            .filter(|e| {
                query
                    .category
                    .as_deref()
                    .map(|c| e.category == c)
                    .unwrap_or(true)
            })
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        entries.truncate(query.limit.unwrap_or(100));
        Ok(entries)
    }

    /// Deletes entries older than `days`. Critical entries are kept.
    pub async fn cleanup(&self, days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(days);
        let mut deleted = 0;
        for entry in self.entries.all().await? {
            if entry.level == LogLevel::Critical || entry.created_at >= cutoff {
                continue;
            }
            self.entries.delete(entry.id).await?;
            deleted += 1;
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{ensure_schema, memory::MemoryStore};
    use serde_json::json;

    async fn service() -> EventLogService {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        ensure_schema(store.as_ref()).await.unwrap();
        let settings = SettingsService::new(store.clone());
        EventLogService::new(store, settings)
    }

    #[tokio::test]
    async fn entries_below_min_level_are_dropped() {
        let log = service().await;
        log.settings.set("log_level", &json!("warning")).await.unwrap();
        log.info("test", "ignored", json!({})).await;
        log.error("test", "kept", json!({})).await;
        assert_eq!(log.pending().await, 1);
        assert_eq!(log.flush().await, 1);
        assert_eq!(log.pending().await, 0);
    }

    #[tokio::test]
    async fn buffer_flushes_when_full() {
        let log = service().await;
        log.settings.set("log_buffer_size", &json!(2)).await.unwrap();
        log.info("test", "one", json!({})).await;
        assert_eq!(log.pending().await, 1);
        log.info("test", "two", json!({})).await;
        assert_eq!(log.pending().await, 0);
        assert_eq!(log.entries.all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cleanup_keeps_critical_entries() {
        let log = service().await;
        let old = Utc::now() - Duration::days(90);
        for level in [LogLevel::Info, LogLevel::Critical] {
            log.entries
                .insert(&EventLogEntry {
                    id: 0,
                    level,
                    category: "test".into(),
                    message: "old".into(),
                    context: json!({}),
                    user_id: None,
                    ip_address: None,
                    created_at: old,
                })
                .await
                .unwrap();
        }
        assert_eq!(log.cleanup(30).await.unwrap(), 1);
        let left = log.entries.all().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].level, LogLevel::Critical);
    }
}
