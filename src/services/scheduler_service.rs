//! Periodic background tasks.
//!
//! Each tick picks due tasks by priority and leases them through a
//! compare-and-swap on `lease_version`, which moves forward on every claim
//! and every completion. A tick working from an outdated snapshot loses the
//! swap. A lease older than [`LEASE_SECS`] is considered abandoned.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::database::{
    store::Store,
    table::{fields, Table},
};
use crate::dto::task_dto::{CreateTaskPayload, UpdateTaskPayload};
use crate::error::{Error, Result};
use crate::models::scheduled_task::{
    calculate_next_run, Frequency, ScheduledTask, TaskStatus, TaskType,
};
use crate::models::etl::JobStatus;
use crate::models::external_service::HealthStatus;
use crate::services::{
    connector_service::{ConnectorService, SendOptions},
    etl::{path::get_nested, EtlEngine},
    event_bus::{EventBus, SystemEvent},
    event_log_service::EventLogService,
    extensions::Extensions,
    settings_service::SettingsService,
    webhook_service::WebhookService,
};

pub const LEASE_SECS: i64 = 3600;
const DEFAULT_RETRY_LIMIT: usize = 50;

/// Built-in tasks, seeded once by handler name.
const SYSTEM_TASKS: [(&str, TaskType, Frequency, i32); 4] = [
    ("system_cleanup", TaskType::Cleanup, Frequency::Daily, 0),
    ("system_health_check", TaskType::HealthCheck, Frequency::Hourly, 5),
    ("system_webhook_retry", TaskType::WebhookRetry, Frequency::EveryFifteenMinutes, 10),
    ("system_etl_queue", TaskType::Etl, Frequency::EveryMinute, 20),
];

#[derive(Debug, Clone, Serialize)]
pub struct TaskRun {
    pub task_id: i64,
    pub name: String,
    pub success: bool,
    pub duration_ms: u64,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Where an `etl` task pulls its input from.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EtlSource {
    Query {
        table: String,
        column: Option<String>,
        value: Option<JsonValue>,
    },
    Service {
        service_id: i64,
        #[serde(default)]
        path: String,
        #[serde(default = "default_method")]
        method: String,
        data: Option<JsonValue>,
    },
    Static {
        data: JsonValue,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
struct EtlTaskConfig {
    /// Without a template the task drains queued jobs instead.
    template_id: Option<i64>,
    source: Option<EtlSource>,
    /// Dot path to the list of items inside the fetched data.
    items_path: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CleanupConfig {
    webhook_log_days: Option<i64>,
    event_log_days: Option<i64>,
    etl_job_days: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RetryTaskConfig {
    limit: Option<usize>,
}

fn task_config<T: for<'de> Deserialize<'de> + Default>(task: &ScheduledTask) -> Result<T> {
    if task.config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(task.config.clone())
        .map_err(|e| Error::BadRequest(format!("invalid config for task '{}': {}", task.name, e)))
}

fn parse_task_type(raw: &str) -> Result<TaskType> {
    serde_json::from_value(json!(raw))
        .map_err(|_| Error::BadRequest(format!("unknown task type: {}", raw)))
}

fn parse_frequency(raw: &str) -> Result<()> {
    raw.parse::<Frequency>().map(|_| ()).map_err(Error::BadRequest)
}

/// Whether a task may be leased at `now`: due, and not held by a live lease.
pub fn is_claimable(task: &ScheduledTask, now: DateTime<Utc>) -> bool {
    if !task.is_due(now) {
        return false;
    }
    match (task.status, task.claimed_at) {
        (TaskStatus::Running, Some(at)) => now - at > Duration::seconds(LEASE_SECS),
        _ => true,
    }
}

#[derive(Clone)]
pub struct SchedulerService {
    tasks: Table<ScheduledTask>,
    store: Arc<dyn Store>,
    etl: EtlEngine,
    webhooks: WebhookService,
    connector: ConnectorService,
    event_log: EventLogService,
    settings: SettingsService,
    extensions: Arc<Extensions>,
    events: Arc<EventBus>,
}

impl SchedulerService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        etl: EtlEngine,
        webhooks: WebhookService,
        connector: ConnectorService,
        event_log: EventLogService,
        settings: SettingsService,
        extensions: Arc<Extensions>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            tasks: Table::new(store.clone()),
            store,
            etl,
            webhooks,
            connector,
            event_log,
            settings,
            extensions,
            events,
        }
    }

    pub fn tasks(&self) -> &Table<ScheduledTask> {
        &self.tasks
    }

    pub async fn list(&self) -> Result<Vec<ScheduledTask>> {
        let mut tasks = self.tasks.all().await?;
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    pub async fn create(&self, payload: CreateTaskPayload) -> Result<ScheduledTask> {
        let task_type = parse_task_type(&payload.task_type)?;
        parse_frequency(&payload.frequency)?;
        let handler = payload.handler.unwrap_or_else(|| payload.name.clone());
        if self.tasks.find_one_by("handler", json!(handler)).await?.is_some() {
            return Err(Error::BadRequest(format!(
                "a task with handler '{}' already exists",
                handler
            )));
        }

        let mut task = ScheduledTask::new(&payload.name, task_type, &handler, Frequency::Once);
        task.frequency = payload.frequency;
        task.description = payload.description;
        task.config = payload.config;
        task.priority = payload.priority;
        task.is_active = payload.is_active.unwrap_or(true);
        let task = self.tasks.insert(&task).await?;
        tracing::info!(task_id = task.id, handler = %task.handler, "scheduled task created");
        Ok(task)
    }

    pub async fn update(&self, id: i64, payload: UpdateTaskPayload) -> Result<ScheduledTask> {
        let mut task = self.tasks.get(id).await?;
        if let Some(name) = payload.name {
            task.name = name;
        }
        if payload.description.is_some() {
            task.description = payload.description;
        }
        if let Some(config) = payload.config {
            task.config = config;
        }
        if let Some(frequency) = payload.frequency {
            parse_frequency(&frequency)?;
            task.next_run_at = calculate_next_run(&frequency, Utc::now());
            task.frequency = frequency;
        }
        if let Some(priority) = payload.priority {
            task.priority = priority;
        }
        if let Some(active) = payload.is_active {
            task.is_active = active;
        }
        match payload.paused {
            Some(true) => task.status = TaskStatus::Paused,
            Some(false) if task.status == TaskStatus::Paused => {
                task.status = TaskStatus::Pending;
                if task.next_run_at.is_none() {
                    task.next_run_at = Some(Utc::now());
                }
            }
            _ => {}
        }
        task.updated_at = Utc::now();
        self.tasks.save(&task).await
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        let task = self.tasks.get(id).await?;
        if task.is_system {
            return Err(Error::Forbidden(format!(
                "system task '{}' cannot be deleted",
                task.name
            )));
        }
        self.tasks.delete(id).await
    }

    /// Ensures the built-in tasks exist. Returns how many were created.
    pub async fn seed_system_tasks(&self) -> Result<usize> {
        let mut created = 0;
        for (handler, task_type, frequency, priority) in SYSTEM_TASKS {
            if self.tasks.find_one_by("handler", json!(handler)).await?.is_some() {
                continue;
            }
            let mut task = ScheduledTask::new(handler, task_type, handler, frequency);
            task.is_system = true;
            task.priority = priority;
            self.tasks.insert(&task).await?;
            created += 1;
        }
        if created > 0 {
            tracing::info!(created, "seeded system tasks");
        }
        Ok(created)
    }

    /// Runs every claimable task, highest priority first, up to `limit`
    /// (defaults to the `scheduler_batch_size` setting).
    pub async fn tick(&self, limit: Option<usize>) -> Result<Vec<TaskRun>> {
        let limit = match limit {
            Some(limit) => limit,
            None => self.settings.get_int("scheduler_batch_size").await.max(1) as usize,
        };
        let now = Utc::now();
        let mut due: Vec<ScheduledTask> = self
            .tasks
            .all()
            .await?
            .into_iter()
            .filter(|t| is_claimable(t, now))
            .collect();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.next_run_at.cmp(&b.next_run_at))
                .then(a.id.cmp(&b.id))
        });

        let mut runs = Vec::new();
        for task in due.into_iter().take(limit) {
            let Some(task) = self.claim(&task).await? else {
                tracing::debug!(task_id = task.id, "task claimed elsewhere");
                continue;
            };
            runs.push(self.execute(task).await?);
        }
        Ok(runs)
    }

    /// Runs one task immediately, regardless of its schedule.
    pub async fn run_now(&self, id: i64) -> Result<TaskRun> {
        let task = self.tasks.get(id).await?;
        if task.status == TaskStatus::Running
            && task
                .claimed_at
                .map(|at| Utc::now() - at <= Duration::seconds(LEASE_SECS))
                .unwrap_or(false)
        {
            return Err(Error::BadRequest(format!("task '{}' is already running", task.name)));
        }
        let Some(task) = self.claim(&task).await? else {
            return Err(Error::BadRequest(format!("task '{}' is already running", task.name)));
        };
        self.execute(task).await
    }

    async fn claim(&self, task: &ScheduledTask) -> Result<Option<ScheduledTask>> {
        let expected = json!(task.lease_version);
        let now = Utc::now();
        self.tasks
            .claim(
                task.id,
                "lease_version",
                &expected,
                fields([
                    ("lease_version", json!(task.lease_version + 1)),
                    ("claim_token", json!(Uuid::new_v4().to_string())),
                    ("claimed_at", json!(now)),
                    ("status", json!(TaskStatus::Running)),
                ]),
            )
            .await
    }

    async fn execute(&self, task: ScheduledTask) -> Result<TaskRun> {
        let started = Instant::now();
        let outcome = self.run_handler(&task).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let now = Utc::now();

        let (success, result, error) = match outcome {
            Ok(result) => (true, Some(result), None),
            Err(e) => (false, None, Some(e.to_string())),
        };

        self.tasks
            .update(
                task.id,
                fields([
                    (
                        "status",
                        json!(if success { TaskStatus::Completed } else { TaskStatus::Failed }),
                    ),
                    ("last_run_at", json!(now)),
                    ("last_duration_ms", json!(duration_ms)),
                    ("last_result", json!(result)),
                    ("last_error", json!(error)),
                    ("run_count", json!(task.run_count + 1)),
                    ("fail_count", json!(task.fail_count + u64::from(!success))),
                    ("next_run_at", json!(calculate_next_run(&task.frequency, now))),
                    ("claim_token", JsonValue::Null),
                    ("claimed_at", JsonValue::Null),
                    ("lease_version", json!(task.lease_version + 1)),
                    ("updated_at", json!(now)),
                ]),
            )
            .await?;

        let context = json!({
            "task_id": task.id,
            "handler": task.handler,
            "duration_ms": duration_ms,
            "error": error,
        });
        if success {
            self.event_log
                .info("scheduler", &format!("task '{}' executed", task.name), context)
                .await;
        } else {
            self.event_log
                .error("scheduler", &format!("task '{}' failed", task.name), context)
                .await;
        }
        self.events.publish(SystemEvent::TaskExecuted {
            task_id: task.id,
            success,
            duration_ms,
        });
        tracing::info!(task_id = task.id, success, duration_ms, "task finished");

        Ok(TaskRun {
            task_id: task.id,
            name: task.name,
            success,
            duration_ms,
            result,
            error,
        })
    }

    async fn run_handler(&self, task: &ScheduledTask) -> Result<JsonValue> {
        match task.task_type {
            TaskType::Etl => self.run_etl(task).await,
            TaskType::Cleanup => self.run_cleanup(task).await,
            TaskType::HealthCheck => self.run_health_checks().await,
            TaskType::WebhookRetry => {
                let config: RetryTaskConfig = task_config(task)?;
                let max_retries = self.settings.get_int("webhook_max_retries").await.max(0) as u32;
                let summary = self
                    .webhooks
                    .retry_failed(max_retries, config.limit.unwrap_or(DEFAULT_RETRY_LIMIT))
                    .await?;
                Ok(serde_json::to_value(summary)?)
            }
            TaskType::Custom => {
                if let Ok(handler) = self.extensions.task_handlers.get(&task.handler) {
                    return handler.run(task).await;
                }
                match self.extensions.run_task_hooks(task).await {
                    Some(result) => result,
                    None => Err(Error::NotFound(format!(
                        "no handler registered for task '{}'",
                        task.handler
                    ))),
                }
            }
        }
    }

    async fn run_etl(&self, task: &ScheduledTask) -> Result<JsonValue> {
        let config: EtlTaskConfig = task_config(task)?;
        let Some(template_id) = config.template_id else {
            let limit = config.limit.unwrap_or(
                self.settings.get_int("scheduler_batch_size").await.max(1) as usize,
            );
            let jobs = self.etl.run_pending(limit).await?;
            let failed = jobs.iter().filter(|j| j.status == JobStatus::Failed).count();
            return Ok(json!({ "processed": jobs.len(), "failed": failed }));
        };

        let data = match &config.source {
            None => JsonValue::Object(Default::default()),
            Some(EtlSource::Static { data }) => data.clone(),
            Some(EtlSource::Query { table, column, value }) => self
                .store
                .get_rows_data(table, column.as_deref(), value.as_ref(), true)
                .await
                .into_data()?,
            Some(EtlSource::Service { service_id, path, method, data }) => {
                let response = self
                    .connector
                    .send(*service_id, path, data.as_ref(), method, &SendOptions::default())
                    .await?;
                if !response.success {
                    return Err(Error::Transport(format!(
                        "source service answered {}: {}",
                        response.status_code,
                        response.error.unwrap_or_default()
                    )));
                }
                response.body
            }
        };

        let data = match &config.items_path {
            Some(path) => get_nested(&data, path).cloned().unwrap_or(JsonValue::Null),
            None => data,
        };
        let items = match data {
            JsonValue::Array(items) => items,
            JsonValue::Null => Vec::new(),
            other => vec![other],
        };

        let (mut completed, mut failed) = (0, 0);
        for item in items {
            let job = self.etl.create_job(template_id, item, None, None).await?;
            let job = self.etl.run_job(job.id).await?;
            if job.status == JobStatus::Failed {
                failed += 1;
            } else {
                completed += 1;
            }
        }
        Ok(json!({ "template_id": template_id, "completed": completed, "failed": failed }))
    }

    async fn run_cleanup(&self, task: &ScheduledTask) -> Result<JsonValue> {
        let config: CleanupConfig = task_config(task)?;
        let webhook_days = match config.webhook_log_days {
            Some(days) => days,
            None => self.settings.get_int("webhook_log_retention_days").await,
        };
        let event_days = match config.event_log_days {
            Some(days) => days,
            None => self.settings.get_int("event_log_retention_days").await,
        };
        let job_days = match config.etl_job_days {
            Some(days) => days,
            None => self.settings.get_int("etl_job_retention_days").await,
        };

        self.event_log.flush().await;
        Ok(json!({
            "webhook_logs": self.webhooks.cleanup(webhook_days.max(1)).await?,
            "event_logs": self.event_log.cleanup(event_days.max(1)).await?,
            "etl_jobs": self.etl.cleanup(job_days.max(1)).await?,
        }))
    }

    async fn run_health_checks(&self) -> Result<JsonValue> {
        let services = self.connector.services().all().await?;
        let (mut healthy, mut degraded, mut unhealthy, mut errors) = (0, 0, 0, 0);
        for service in services.into_iter().filter(|s| s.is_active) {
            match self.connector.health_check(service.id).await {
                Ok(report) => match report.status {
                    HealthStatus::Healthy => healthy += 1,
                    HealthStatus::Degraded => degraded += 1,
                    _ => unhealthy += 1,
                },
                Err(e) => {
                    tracing::warn!(service_id = service.id, error = %e, "health check failed");
                    errors += 1;
                }
            }
        }
        Ok(json!({
            "checked": healthy + degraded + unhealthy,
            "healthy": healthy,
            "degraded": degraded,
            "unhealthy": unhealthy,
            "errors": errors,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_leases_block_claims() {
        let now = Utc::now();
        let mut task = ScheduledTask::new("t", TaskType::Custom, "t", Frequency::Hourly);
        task.next_run_at = Some(now - Duration::seconds(5));
        assert!(is_claimable(&task, now));

        task.status = TaskStatus::Running;
        task.claimed_at = Some(now - Duration::minutes(10));
        assert!(!is_claimable(&task, now));

        task.claimed_at = Some(now - Duration::seconds(LEASE_SECS + 1));
        assert!(is_claimable(&task, now));
    }

    #[test]
    fn etl_task_config_sources() {
        let task = {
            let mut t = ScheduledTask::new("sync", TaskType::Etl, "sync", Frequency::Hourly);
            t.config = json!({
                "template_id": 3,
                "source": {"type": "service", "service_id": 1, "path": "/items"},
                "items_path": "data.items"
            });
            t
        };
        let config: EtlTaskConfig = task_config(&task).unwrap();
        assert_eq!(config.template_id, Some(3));
        assert!(matches!(
            config.source,
            Some(EtlSource::Service { ref method, .. }) if method == "GET"
        ));
    }

    #[tokio::test]
    async fn stale_snapshots_cannot_reclaim_a_finished_task() {
        use crate::{
            config::Config,
            database::{ensure_schema, memory::MemoryStore},
            AppState,
        };

        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        ensure_schema(store.as_ref()).await.unwrap();
        let state = AppState::new(Config::default(), store).unwrap();
        let scheduler = &state.scheduler;

        let mut task = ScheduledTask::new("once", TaskType::Cleanup, "once", Frequency::Hourly);
        task.next_run_at = Some(Utc::now() - Duration::seconds(1));
        let task = scheduler.tasks().insert(&task).await.unwrap();

        // Two ticks list the same due row; the first one runs it to completion.
        let snapshot = scheduler.tasks().get(task.id).await.unwrap();
        let claimed = scheduler.claim(&snapshot).await.unwrap().unwrap();
        scheduler.execute(claimed).await.unwrap();

        let after = scheduler.tasks().get(task.id).await.unwrap();
        assert!(after.claim_token.is_none());
        assert_eq!(after.lease_version, snapshot.lease_version + 2);

        assert!(scheduler.claim(&snapshot).await.unwrap().is_none());
        let after = scheduler.tasks().get(task.id).await.unwrap();
        assert_eq!(after.run_count, 1);
        assert_ne!(after.status, TaskStatus::Running);
    }

    #[test]
    fn unknown_task_types_are_rejected() {
        assert!(parse_task_type("health_check").is_ok());
        assert!(parse_task_type("reboot").is_err());
        assert!(parse_frequency("fortnightly").is_err());
    }
}
