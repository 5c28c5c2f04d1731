//! In-process fan-out of lifecycle notifications.
//!
//! Publishing never blocks and never fails; events published while nobody
//! is subscribed are dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{etl::EtlStage, webhook_log::WebhookStatus};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SystemEvent {
    EndpointCreated {
        endpoint_id: i64,
    },
    EndpointUpdated {
        endpoint_id: i64,
    },
    EndpointDeleted {
        endpoint_id: i64,
    },
    WebhookReceived {
        log_id: i64,
        endpoint_id: i64,
        status: WebhookStatus,
    },
    EtlJobCompleted {
        job_id: i64,
        template_id: i64,
    },
    EtlJobFailed {
        job_id: i64,
        template_id: i64,
        stage: Option<EtlStage>,
        message: String,
    },
    TaskExecuted {
        task_id: i64,
        success: bool,
        duration_ms: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: SystemEvent,
    pub timestamp: DateTime<Utc>,
}

pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: SystemEvent) {
        tracing::debug!(?event, "publishing system event");
        let _ = self.sender.send(EventEnvelope {
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
