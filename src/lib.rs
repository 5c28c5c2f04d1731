pub mod config;
pub mod database;
pub mod dto;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::DefaultBodyLimit, Router};
use reqwest::Client;
use tower_http::{catch_panic::CatchPanicLayer, services::ServeDir, trace::TraceLayer};

use crate::config::Config;
use crate::database::store::Store;
use crate::error::{Error, Result};
use crate::services::{
    connector_service::ConnectorService, dispatch_service::DispatchService,
    endpoint_service::EndpointService, etl::EtlEngine, event_bus::EventBus,
    event_log_service::EventLogService, extensions::Extensions,
    permission_service::PermissionService, scheduler_service::SchedulerService,
    settings_service::SettingsService, webhook_service::WebhookService,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub events: Arc<EventBus>,
    pub extensions: Arc<Extensions>,
    pub settings: SettingsService,
    pub event_log: EventLogService,
    pub connector: ConnectorService,
    pub etl: EtlEngine,
    pub webhooks: WebhookService,
    pub endpoints: EndpointService,
    pub permissions: PermissionService,
    pub dispatcher: DispatchService,
    pub scheduler: SchedulerService,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn Store>) -> Result<Self> {
        Self::with_extensions(config, store, Arc::new(Extensions::new()))
    }

    /// Like `new`, with hooks and handlers registered up front by the host.
    pub fn with_extensions(
        config: Config,
        store: Arc<dyn Store>,
        extensions: Arc<Extensions>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;

        let events = Arc::new(EventBus::default());
        let settings = SettingsService::new(store.clone());
        let event_log = EventLogService::new(store.clone(), settings.clone());
        let connector = ConnectorService::new(
            store.clone(),
            settings.clone(),
            event_log.clone(),
            http_client,
        );
        let etl = EtlEngine::new(
            store.clone(),
            connector.clone(),
            extensions.clone(),
            events.clone(),
            event_log.clone(),
            settings.clone(),
            config.clone(),
        );
        let webhooks = WebhookService::new(
            store.clone(),
            etl.clone(),
            extensions.clone(),
            events.clone(),
            event_log.clone(),
        );
        let endpoints = EndpointService::new(store.clone(), events.clone());
        let permissions = PermissionService::new(extensions.clone(), &config.jwt_secret);
        let dispatcher = DispatchService::new(
            extensions.clone(),
            permissions.clone(),
            webhooks.clone(),
            etl.clone(),
            connector.clone(),
            settings.clone(),
            event_log.clone(),
            config.clone(),
        );
        let scheduler = SchedulerService::new(
            store.clone(),
            etl.clone(),
            webhooks.clone(),
            connector.clone(),
            event_log.clone(),
            settings.clone(),
            extensions.clone(),
            events.clone(),
        );

        Ok(Self {
            config,
            store,
            events,
            extensions,
            settings,
            event_log,
            connector,
            etl,
            webhooks,
            endpoints,
            permissions,
            dispatcher,
            scheduler,
        })
    }
}

/// The full HTTP surface: health, the custom endpoint catch-all, the admin
/// API and exported files.
pub fn build_router(state: AppState) -> Router {
    let config = state.config.clone();
    tracing::info!(export_dir = %config.export_dir, "serving exports");

    routes::router(state.clone())
        .nest_service("/exports", ServeDir::new(&config.export_dir))
        .with_state(state)
        .layer(CatchPanicLayer::new())
        .layer(middleware::cors::cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
}
