//! Extract, transform and load over arbitrary JSON.
//!
//! A job moves `pending -> extracting -> transforming -> loading` and ends
//! `completed` or `failed`. Each phase snapshot is persisted before the job
//! advances, and failures carry the stage that raised them.

pub mod extract;
pub mod load;
pub mod path;
pub mod transform;
pub mod transformations;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};

use crate::config::Config;
use crate::database::{store::Store, table::Table};
use crate::dto::dispatch_dto::{HandlerResponse, InboundRequest};
use crate::dto::etl_dto::{CreateTemplatePayload, JobListQuery, UpdateTemplatePayload};
use crate::error::{Error, Result};
use crate::models::{
    endpoint::Endpoint,
    etl::{EtlJob, EtlStage, EtlTemplate, JobStatus},
};
use crate::services::{
    connector_service::ConnectorService,
    event_bus::{EventBus, SystemEvent},
    event_log_service::EventLogService,
    extensions::Extensions,
    settings_service::SettingsService,
};

use self::extract::ExtractConfig;
use self::load::{LoadConfig, LoadContext};
use self::transform::TransformPlan;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct Preview {
    pub extracted: JsonValue,
    pub transformed: JsonValue,
}

/// Everything a job needs from its template, parsed up front.
struct Pipeline {
    extract: Option<ExtractConfig>,
    transform: TransformPlan,
    load: Option<LoadConfig>,
}

impl Pipeline {
    fn compile(template: &EtlTemplate) -> Result<Self> {
        Ok(Self {
            extract: ExtractConfig::parse(&template.extract_config)?,
            transform: TransformPlan::parse(&template.transform_config)?,
            load: LoadConfig::parse(&template.load_config)?,
        })
    }
}

fn stage_of(error: &Error, fallback: EtlStage) -> EtlStage {
    match error {
        Error::Pipeline { stage, .. } => *stage,
        _ => fallback,
    }
}

fn stage_message(error: &Error) -> String {
    match error {
        Error::Pipeline { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

#[derive(Clone)]
pub struct EtlEngine {
    templates: Table<EtlTemplate>,
    jobs: Table<EtlJob>,
    store: Arc<dyn Store>,
    connector: ConnectorService,
    extensions: Arc<Extensions>,
    events: Arc<EventBus>,
    event_log: EventLogService,
    settings: SettingsService,
    config: Arc<Config>,
}

impl EtlEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        connector: ConnectorService,
        extensions: Arc<Extensions>,
        events: Arc<EventBus>,
        event_log: EventLogService,
        settings: SettingsService,
        config: Arc<Config>,
    ) -> Self {
        Self {
            templates: Table::new(store.clone()),
            jobs: Table::new(store.clone()),
            store,
            connector,
            extensions,
            events,
            event_log,
            settings,
            config,
        }
    }

    pub fn templates(&self) -> &Table<EtlTemplate> {
        &self.templates
    }

    pub fn jobs(&self) -> &Table<EtlJob> {
        &self.jobs
    }

    pub async fn create_template(&self, payload: CreateTemplatePayload) -> Result<EtlTemplate> {
        let now = Utc::now();
        let template = EtlTemplate {
            id: 0,
            name: payload.name,
            description: payload.description,
            extract_config: payload.extract_config,
            transform_config: payload.transform_config,
            load_config: payload.load_config,
            external_service_id: payload.external_service_id,
            is_active: payload.is_active.unwrap_or(true),
            created_at: now,
            updated_at: now,
        };
        Pipeline::compile(&template).map_err(|e| Error::BadRequest(e.to_string()))?;
        let template = self.templates.insert(&template).await?;
        tracing::info!(template_id = template.id, name = %template.name, "ETL template created");
        Ok(template)
    }

    pub async fn update_template(&self, id: i64, payload: UpdateTemplatePayload) -> Result<EtlTemplate> {
        let mut template = self.templates.get(id).await?;
        if let Some(name) = payload.name {
            template.name = name;
        }
        if payload.description.is_some() {
            template.description = payload.description;
        }
        if let Some(config) = payload.extract_config {
            template.extract_config = config;
        }
        if let Some(config) = payload.transform_config {
            template.transform_config = config;
        }
        if let Some(config) = payload.load_config {
            template.load_config = config;
        }
        if payload.external_service_id.is_some() {
            template.external_service_id = payload.external_service_id;
        }
        if let Some(active) = payload.is_active {
            template.is_active = active;
        }
        template.updated_at = Utc::now();
        Pipeline::compile(&template).map_err(|e| Error::BadRequest(e.to_string()))?;
        self.templates.save(&template).await
    }

    pub async fn delete_template(&self, id: i64) -> Result<()> {
        self.templates.get(id).await?;
        self.templates.delete(id).await
    }

    /// Newest first.
    pub async fn list_jobs(&self, query: &JobListQuery) -> Result<Vec<EtlJob>> {
        let status: Option<JobStatus> = query
            .status
            .as_deref()
            .map(|s| {
                serde_json::from_value(json!(s))
                    .map_err(|_| Error::BadRequest(format!("unknown job status: {}", s)))
            })
            .transpose()?;
        let mut jobs: Vec<EtlJob> = self
            .jobs
            .all()
            .await?
            .into_iter()
            .filter(|j| query.template_id.map(|t| j.template_id == t).unwrap_or(true))
            .filter(|j| status.map(|s| j.status == s).unwrap_or(true))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        jobs.truncate(query.limit.unwrap_or(100));
        Ok(jobs)
    }

    /// Queues a job without running it.
    pub async fn create_job(
        &self,
        template_id: i64,
        input: JsonValue,
        webhook_log_id: Option<i64>,
        endpoint_id: Option<i64>,
    ) -> Result<EtlJob> {
        let template = self.templates.get(template_id).await?;
        if !template.is_active {
            return Err(Error::BadRequest(format!(
                "ETL template '{}' is not active",
                template.name
            )));
        }
        let mut job = EtlJob::pending(template_id, input);
        job.webhook_log_id = webhook_log_id;
        job.endpoint_id = endpoint_id;
        let job = self.jobs.insert(&job).await?;
        tracing::debug!(job_id = job.id, template_id, "queued ETL job");
        Ok(job)
    }

    /// Handler strategy for `etl` endpoints: run the template against the
    /// request's merged parameters and report the job outcome.
    pub async fn process(
        &self,
        request: &InboundRequest,
        template_id: i64,
        endpoint: &Endpoint,
    ) -> Result<HandlerResponse> {
        let input = match request.json_body() {
            Some(body @ JsonValue::Array(_)) => body,
            _ => request.params(),
        };
        let job = self
            .create_job(template_id, input, None, Some(endpoint.id))
            .await?;
        let job = self.run_job(job.id).await?;

        if job.status == JobStatus::Completed {
            return Ok(HandlerResponse::ok(json!({
                "success": true,
                "job_id": job.id,
                "status": job.status,
                "result": job.load_result,
            })));
        }

        let debug = self.config.debug || self.settings.get_bool("debug_mode").await;
        let mut body = json!({
            "success": false,
            "job_id": job.id,
            "status": job.status,
            "error_stage": job.error_stage,
        });
        if debug {
            body["error"] = json!(job.error_message);
        }
        Ok(HandlerResponse::new(500, body))
    }

    async fn transition(&self, job: &EtlJob, next: JobStatus, mut fields: Map<String, JsonValue>) -> Result<EtlJob> {
        if !job.status.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "job {} cannot move from {:?} to {:?}",
                job.id, job.status, next
            )));
        }
        fields.insert("status".into(), serde_json::to_value(next)?);
        self.jobs.update(job.id, fields).await
    }

    /// Runs a pending job to completion. Pipeline failures are recorded on
    /// the job rather than returned.
    pub async fn run_job(&self, job_id: i64) -> Result<EtlJob> {
        let mut claim = Map::new();
        claim.insert("status".into(), serde_json::to_value(JobStatus::Extracting)?);
        claim.insert("started_at".into(), json!(Utc::now()));
        let Some(job) = self
            .jobs
            .claim(job_id, "status", &json!(JobStatus::Pending), claim)
            .await?
        else {
            return Err(Error::BadRequest(format!("ETL job {} is not pending", job_id)));
        };

        let outcome = self.execute(&job).await;
        let job = match outcome {
            Ok(job) => job,
            Err((current, error)) => self.fail(&current, error).await?,
        };
        Ok(job)
    }

    async fn execute(&self, job: &EtlJob) -> std::result::Result<EtlJob, (EtlJob, Error)> {
        let template = match self.templates.get(job.template_id).await {
            Ok(t) => t,
            Err(e) => return Err((job.clone(), Error::pipeline(EtlStage::Extract, e.to_string()))),
        };
        let pipeline = Pipeline::compile(&template).map_err(|e| (job.clone(), e))?;

        let extracted = extract::extract(&job.input_data, pipeline.extract.as_ref())
            .map_err(|e| (job.clone(), e))?;
        let mut fields = Map::new();
        fields.insert("extracted_data".into(), extracted.clone());
        let job = self
            .transition(job, JobStatus::Transforming, fields)
            .await
            .map_err(|e| (job.clone(), e))?;

        // Rejected by a filter: nothing to transform or load.
        if path::is_empty(&extracted) {
            let mut fields = Map::new();
            fields.insert("transformed_data".into(), json!({}));
            let job = self
                .transition(&job, JobStatus::Loading, fields)
                .await
                .map_err(|e| (job.clone(), e))?;
            return self
                .complete(&job, json!({"destination": "none", "success": true, "skipped": true}))
                .await
                .map_err(|e| (job.clone(), e));
        }

        let transformed = pipeline.transform.apply(&extracted, &self.extensions);
        let mut fields = Map::new();
        fields.insert("transformed_data".into(), transformed.clone());
        let job = self
            .transition(&job, JobStatus::Loading, fields)
            .await
            .map_err(|e| (job.clone(), e))?;

        let ctx = LoadContext {
            template: &template,
            job_id: job.id,
            connector: &self.connector,
            store: &self.store,
            extensions: &self.extensions,
            config: &self.config,
        };
        let result = load::load(&transformed, pipeline.load.as_ref(), &ctx)
            .await
            .map_err(|e| (job.clone(), e))?;

        if result.get("success").and_then(JsonValue::as_bool) == Some(false) {
            let message = result
                .get("error")
                .and_then(JsonValue::as_str)
                .unwrap_or("load destination reported failure")
                .to_string();
            let mut fields = Map::new();
            fields.insert("load_result".into(), result);
            let job = self
                .jobs
                .update(job.id, fields)
                .await
                .map_err(|e| (job.clone(), e))?;
            return Err((job, Error::pipeline(EtlStage::Load, message)));
        }

        self.complete(&job, result).await.map_err(|e| (job.clone(), e))
    }

    async fn complete(&self, job: &EtlJob, load_result: JsonValue) -> Result<EtlJob> {
        let mut fields = Map::new();
        fields.insert("load_result".into(), load_result);
        fields.insert("completed_at".into(), json!(Utc::now()));
        let job = self.transition(job, JobStatus::Completed, fields).await?;

        self.events.publish(SystemEvent::EtlJobCompleted {
            job_id: job.id,
            template_id: job.template_id,
        });
        tracing::info!(job_id = job.id, template_id = job.template_id, "ETL job completed");
        Ok(job)
    }

    async fn fail(&self, job: &EtlJob, error: Error) -> Result<EtlJob> {
        let fallback = match job.status {
            JobStatus::Transforming => EtlStage::Transform,
            JobStatus::Loading => EtlStage::Load,
            _ => EtlStage::Extract,
        };
        let stage = stage_of(&error, fallback);
        let message = stage_message(&error);

        let mut fields = Map::new();
        fields.insert("error_stage".into(), serde_json::to_value(stage)?);
        fields.insert("error_message".into(), json!(message));
        fields.insert("completed_at".into(), json!(Utc::now()));
        let failed = self.transition(job, JobStatus::Failed, fields).await?;

        self.events.publish(SystemEvent::EtlJobFailed {
            job_id: failed.id,
            template_id: failed.template_id,
            stage: Some(stage),
            message: message.clone(),
        });
        self.event_log
            .error(
                "etl",
                &format!("ETL job {} failed during {}", failed.id, stage),
                json!({
                    "job_id": failed.id,
                    "template_id": failed.template_id,
                    "stage": stage,
                    "error": message,
                    "retry_count": failed.retry_count,
                }),
            )
            .await;
        Ok(failed)
    }

    /// Runs queued jobs, oldest first.
    pub async fn run_pending(&self, limit: usize) -> Result<Vec<EtlJob>> {
        let mut pending = self
            .jobs
            .find_by("status", json!(JobStatus::Pending))
            .await?;
        pending.sort_by_key(|job| (job.created_at, job.id));

        let mut finished = Vec::new();
        for job in pending.into_iter().take(limit) {
            match self.run_job(job.id).await {
                Ok(job) => finished.push(job),
                // Another worker claimed it first.
                Err(Error::BadRequest(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(finished)
    }

    /// Re-runs a failed job as a new job linked through `retry_of`.
    pub async fn retry_job(&self, job_id: i64) -> Result<EtlJob> {
        let original = self.jobs.get(job_id).await?;
        if original.status != JobStatus::Failed {
            return Err(Error::BadRequest(format!(
                "ETL job {} has not failed and cannot be retried",
                job_id
            )));
        }
        if original.retry_count >= DEFAULT_MAX_RETRIES {
            return Err(Error::BadRequest(format!(
                "ETL job {} reached the retry limit of {}",
                job_id, DEFAULT_MAX_RETRIES
            )));
        }

        let mut retry = EtlJob::pending(original.template_id, original.input_data.clone());
        retry.webhook_log_id = original.webhook_log_id;
        retry.endpoint_id = original.endpoint_id;
        retry.retry_count = original.retry_count + 1;
        retry.retry_of = Some(original.id);
        let retry = self.jobs.insert(&retry).await?;
        tracing::info!(job_id, retry_job_id = retry.id, attempt = retry.retry_count, "retrying ETL job");
        self.run_job(retry.id).await
    }

    /// Deletes finished jobs older than `days`. Jobs still in flight are kept.
    pub async fn cleanup(&self, days: i64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let mut deleted = 0;
        for job in self.jobs.all().await? {
            if job.status.is_terminal() && job.created_at < cutoff {
                self.jobs.delete(job.id).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Extract and transform without loading or persisting anything.
    pub async fn preview(&self, template: &EtlTemplate, sample: &JsonValue) -> Result<Preview> {
        let pipeline = Pipeline::compile(template)?;
        let extracted = extract::extract(sample, pipeline.extract.as_ref())?;
        let transformed = if path::is_empty(&extracted) {
            json!({})
        } else {
            pipeline.transform.apply(&extracted, &self.extensions)
        };
        Ok(Preview {
            extracted,
            transformed,
        })
    }
}
