pub mod memory;
pub mod pool;
pub mod postgres;
pub mod store;
pub mod table;

use crate::database::store::{Store, TableSchema};
use crate::database::table::Record;
use crate::error::Result;
use crate::models::{
    endpoint::Endpoint,
    etl::{EtlJob, EtlTemplate},
    event_log::EventLogEntry,
    external_service::ExternalService,
    scheduled_task::ScheduledTask,
    setting::Setting,
    webhook_log::WebhookLog,
};

/// Creates every table the service needs. Safe to run on each start.
pub async fn ensure_schema(store: &dyn Store) -> Result<()> {
    let tables = [
        (
            Endpoint::TABLE,
            TableSchema::new(&["name", "slug", "route", "method", "handler_type", "is_active"])
                .with_index("slug"),
        ),
        (
            WebhookLog::TABLE,
            TableSchema::new(&["endpoint_id", "status", "retry_count", "created_at"])
                .with_index("endpoint_id")
                .with_index("status"),
        ),
        (
            EtlTemplate::TABLE,
            TableSchema::new(&["name", "external_service_id", "is_active"]),
        ),
        (
            EtlJob::TABLE,
            TableSchema::new(&["template_id", "webhook_log_id", "status", "created_at"])
                .with_index("status"),
        ),
        (
            ExternalService::TABLE,
            TableSchema::new(&["name", "base_url", "health_status", "is_active"]),
        ),
        (
            ScheduledTask::TABLE,
            TableSchema::new(&["handler", "task_type", "status", "next_run_at"])
                .with_index("handler"),
        ),
        (
            EventLogEntry::TABLE,
            TableSchema::new(&["level", "category", "created_at"]).with_index("level"),
        ),
        (Setting::TABLE, TableSchema::new(&["key", "value"]).with_index("key")),
    ];

    for (name, schema) in tables {
        if !store.table_exists(name).await {
            store.create_table(name, &schema).await.into_data()?;
            tracing::info!(table = name, "created table");
        }
    }
    Ok(())
}
