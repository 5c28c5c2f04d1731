pub mod connector_service;
pub mod dispatch_service;
pub mod endpoint_service;
pub mod etl;
pub mod event_bus;
pub mod event_log_service;
pub mod extensions;
pub mod permission_service;
pub mod scheduler_service;
pub mod settings_service;
pub mod webhook_service;
