use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use custom_endpoints::{
    build_router,
    config::Config,
    database::{
        ensure_schema, memory::MemoryStore, pool::create_pool, postgres::PgStore, store::Store,
    },
    AppState,
};
use tokio::net::TcpListener;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("custom_endpoints=info,tower_http=info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let pool = create_pool(url).await?;
            info!("Using Postgres store");
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, data lives in memory only");
            Arc::new(MemoryStore::new())
        }
    };
    ensure_schema(store.as_ref()).await?;
    Ok(store)
}

/// Drives the task scheduler. Ticks may overlap; a task only runs under a
/// lease won by bumping its `lease_version`.
async fn start_scheduler(state: &AppState) -> anyhow::Result<JobScheduler> {
    let interval = Duration::from_secs(state.config.scheduler_interval_secs.max(1));
    let scheduler = state.scheduler.clone();

    let sched = JobScheduler::new()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create job scheduler: {:?}", e))?;
    let job = Job::new_repeated_async(interval, move |_id, _lock| {
        let scheduler = scheduler.clone();
        Box::pin(async move {
            match scheduler.tick(None).await {
                Ok(runs) if !runs.is_empty() => {
                    let failed = runs.iter().filter(|r| !r.success).count();
                    info!(ran = runs.len(), failed, "scheduler tick finished");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "scheduler tick failed"),
            }
        })
    })
    .map_err(|e| anyhow::anyhow!("failed to create tick job: {:?}", e))?;
    sched
        .add(job)
        .await
        .map_err(|e| anyhow::anyhow!("failed to add tick job: {:?}", e))?;
    sched
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("failed to start job scheduler: {:?}", e))?;
    info!(interval_secs = interval.as_secs(), "Scheduler started");
    Ok(sched)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::from_env()?;
    let addr: SocketAddr = config.server_address.parse()?;

    let store = open_store(&config).await?;
    let app_state = AppState::new(config, store)?;
    app_state.scheduler.seed_system_tasks().await?;

    let mut sched = start_scheduler(&app_state).await?;
    let app = build_router(app_state.clone());

    info!("Server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Err(e) = sched.shutdown().await {
        tracing::warn!(error = ?e, "job scheduler did not stop cleanly");
    }
    let flushed = app_state.event_log.flush().await;
    info!(flushed, "Event log flushed, shutdown complete");
    Ok(())
}
