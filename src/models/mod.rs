pub mod endpoint;
pub mod etl;
pub mod event_log;
pub mod external_service;
pub mod scheduled_task;
pub mod setting;
pub mod webhook_log;

pub(crate) fn default_true() -> bool {
    true
}
