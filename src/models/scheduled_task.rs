use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::default_true;
use crate::database::table::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Etl,
    Cleanup,
    HealthCheck,
    WebhookRetry,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Once,
    EveryMinute,
    EveryFiveMinutes,
    EveryFifteenMinutes,
    EveryThirtyMinutes,
    Hourly,
    TwiceDaily,
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    /// Seconds until the next run; `None` for one-shot tasks.
    pub fn interval_secs(self) -> Option<i64> {
        match self {
            Frequency::Once => None,
            Frequency::EveryMinute => Some(60),
            Frequency::EveryFiveMinutes => Some(300),
            Frequency::EveryFifteenMinutes => Some(900),
            Frequency::EveryThirtyMinutes => Some(1800),
            Frequency::Hourly => Some(3600),
            Frequency::TwiceDaily => Some(43_200),
            Frequency::Daily => Some(86_400),
            Frequency::Weekly => Some(604_800),
            Frequency::Monthly => Some(2_592_000),
        }
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "once" => Ok(Frequency::Once),
            "every_minute" => Ok(Frequency::EveryMinute),
            "every_five_minutes" => Ok(Frequency::EveryFiveMinutes),
            "every_fifteen_minutes" => Ok(Frequency::EveryFifteenMinutes),
            "every_thirty_minutes" => Ok(Frequency::EveryThirtyMinutes),
            "hourly" => Ok(Frequency::Hourly),
            "twicedaily" | "twice_daily" => Ok(Frequency::TwiceDaily),
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            other => Err(format!("unknown frequency: {}", other)),
        }
    }
}

/// Next run relative to `now`. Unknown frequencies fall back to hourly and
/// one-shot tasks have no next run.
pub fn calculate_next_run(frequency: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let frequency = frequency.parse().unwrap_or(Frequency::Hourly);
    frequency
        .interval_secs()
        .map(|secs| now + Duration::seconds(secs))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub task_type: TaskType,
    /// Stable name; system tasks are looked up by it.
    pub handler: String,
    #[serde(default)]
    pub config: JsonValue,
    pub frequency: String,
    #[serde(default)]
    pub priority: i32,
    pub status: TaskStatus,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_system: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_result: Option<JsonValue>,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub fail_count: u64,
    pub claim_token: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Bumped on every claim and every completion; leases compare-and-swap
    /// on it, so a stale snapshot can never win.
    #[serde(default)]
    pub lease_version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record for ScheduledTask {
    const TABLE: &'static str = "scheduled_tasks";

    fn id(&self) -> i64 {
        self.id
    }
}

impl ScheduledTask {
    pub fn new(name: &str, task_type: TaskType, handler: &str, frequency: Frequency) -> Self {
        let now = Utc::now();
        let frequency = match frequency {
            Frequency::Once => "once",
            Frequency::EveryMinute => "every_minute",
            Frequency::EveryFiveMinutes => "every_five_minutes",
            Frequency::EveryFifteenMinutes => "every_fifteen_minutes",
            Frequency::EveryThirtyMinutes => "every_thirty_minutes",
            Frequency::Hourly => "hourly",
            Frequency::TwiceDaily => "twicedaily",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        };
        Self {
            id: 0,
            name: name.to_string(),
            description: None,
            task_type,
            handler: handler.to_string(),
            config: JsonValue::Object(Default::default()),
            frequency: frequency.to_string(),
            priority: 0,
            status: TaskStatus::Pending,
            is_active: true,
            is_system: false,
            next_run_at: Some(now),
            last_run_at: None,
            last_duration_ms: None,
            last_error: None,
            last_result: None,
            run_count: 0,
            fail_count: 0,
            claim_token: None,
            claimed_at: None,
            lease_version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.status != TaskStatus::Paused
            && self.next_run_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_run_offsets() {
        let now = Utc::now();
        assert_eq!(
            calculate_next_run("daily", now),
            Some(now + Duration::seconds(86_400))
        );
        assert_eq!(
            calculate_next_run("hourly", now),
            Some(now + Duration::seconds(3600))
        );
        assert_eq!(
            calculate_next_run("weekly", now),
            Some(now + Duration::seconds(604_800))
        );
        assert_eq!(
            calculate_next_run("twicedaily", now),
            Some(now + Duration::seconds(43_200))
        );
    }

    #[test]
    fn unknown_frequency_defaults_to_hourly() {
        let now = Utc::now();
        assert_eq!(
            calculate_next_run("fortnightly-ish", now),
            Some(now + Duration::seconds(3600))
        );
    }

    #[test]
    fn once_has_no_next_run() {
        assert_eq!(calculate_next_run("once", Utc::now()), None);
    }

    #[test]
    fn paused_tasks_are_never_due() {
        let mut task = ScheduledTask::new("t", TaskType::Custom, "t", Frequency::Hourly);
        let now = Utc::now() + Duration::seconds(1);
        assert!(task.is_due(now));
        task.status = TaskStatus::Paused;
        assert!(!task.is_due(now));
    }
}
