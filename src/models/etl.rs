use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::default_true;
use crate::database::table::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EtlStage {
    Extract,
    Transform,
    Load,
}

impl fmt::Display for EtlStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EtlStage::Extract => "extract",
            EtlStage::Transform => "transform",
            EtlStage::Load => "load",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Extracting,
    Transforming,
    Loading,
    Completed,
    Failed,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Extracting => 1,
            JobStatus::Transforming => 2,
            JobStatus::Loading => 3,
            JobStatus::Completed | JobStatus::Failed => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Forward-only: any later phase, or failure from a non-terminal state.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == JobStatus::Failed || next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlTemplate {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub extract_config: JsonValue,
    #[serde(default)]
    pub transform_config: JsonValue,
    #[serde(default)]
    pub load_config: JsonValue,
    pub external_service_id: Option<i64>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record for EtlTemplate {
    const TABLE: &'static str = "etl_templates";

    fn id(&self) -> i64 {
        self.id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlJob {
    #[serde(default)]
    pub id: i64,
    pub template_id: i64,
    pub webhook_log_id: Option<i64>,
    pub endpoint_id: Option<i64>,
    pub status: JobStatus,
    #[serde(default)]
    pub input_data: JsonValue,
    pub extracted_data: Option<JsonValue>,
    pub transformed_data: Option<JsonValue>,
    pub load_result: Option<JsonValue>,
    pub error_stage: Option<EtlStage>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    /// Job this one re-runs, when created by a retry.
    pub retry_of: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Record for EtlJob {
    const TABLE: &'static str = "etl_jobs";

    fn id(&self) -> i64 {
        self.id
    }
}

impl EtlJob {
    pub fn pending(template_id: i64, input_data: JsonValue) -> Self {
        Self {
            id: 0,
            template_id,
            webhook_log_id: None,
            endpoint_id: None,
            status: JobStatus::Pending,
            input_data,
            extracted_data: None,
            transformed_data: None,
            load_result: None,
            error_stage: None,
            error_message: None,
            retry_count: 0,
            retry_of: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }
}
