use std::collections::BTreeMap;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};

use crate::{
    database::table::Record,
    error::Result,
    models::{endpoint::Endpoint, external_service::HealthStatus, scheduled_task::TaskStatus},
    AppState,
};

/// Counts serialized variants by their wire name.
fn tally<T: Serialize>(items: impl IntoIterator<Item = T>) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for item in items {
        let key = match serde_json::to_value(&item) {
            Ok(JsonValue::String(s)) => s,
            Ok(other) => other.to_string(),
            Err(_) => continue,
        };
        *counts.entry(key).or_insert(0) += 1;
    }
    counts
}

#[utoipa::path(
    get,
    path = "/api/admin/system/status",
    responses((status = 200, description = "Component counts and versions"))
)]
#[axum::debug_handler]
pub async fn status(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let endpoints = state.endpoints.list(&Default::default()).await?;
    let routes = state.endpoints.route_table().await?;
    let templates = state.etl.templates().all().await?;
    let services = state.connector.services().all().await?;
    let tasks = state.scheduler.tasks().all().await?;

    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "debug": state.config.debug || state.settings.get_bool("debug_mode").await,
        "endpoints": {
            "total": endpoints.len(),
            "active": endpoints.iter().filter(|e| e.is_active).count(),
            "routes": routes.len(),
            "by_handler": tally(endpoints.iter().map(|e| e.handler_type)),
        },
        "templates": {
            "total": templates.len(),
            "active": templates.iter().filter(|t| t.is_active).count(),
        },
        "services": {
            "total": services.len(),
            "by_health": tally(services.iter().map(|s| s.health_status)),
        },
        "tasks": {
            "total": tasks.len(),
            "by_status": tally(tasks.iter().map(|t| t.status)),
        },
        "event_log_buffered": state.event_log.pending().await,
    })))
}

/// 200 when every dependency is usable, 503 otherwise.
#[utoipa::path(
    get,
    path = "/api/admin/system/health",
    responses(
        (status = 200, description = "All checks passed"),
        (status = 503, description = "At least one check failed")
    )
)]
#[axum::debug_handler]
pub async fn health(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let mut checks = serde_json::Map::new();
    let mut healthy = true;

    let store_ok = state.store.table_exists(Endpoint::TABLE).await;
    healthy &= store_ok;
    checks.insert("store".into(), json!({ "ok": store_ok }));

    let unhealthy: Vec<i64> = state
        .connector
        .services()
        .all()
        .await
        .map(|services| {
            services
                .into_iter()
                .filter(|s| s.is_active && s.health_status == HealthStatus::Unhealthy)
                .map(|s| s.id)
                .collect()
        })
        .unwrap_or_default();
    checks.insert(
        "services".into(),
        json!({ "ok": unhealthy.is_empty(), "unhealthy": unhealthy }),
    );
    healthy &= unhealthy.is_empty();

    // A due task that nobody picked up for a while means the tick loop stalled.
    let stalled_after = Utc::now() - Duration::minutes(10);
    let overdue = state
        .scheduler
        .tasks()
        .all()
        .await
        .map(|tasks| {
            tasks
                .iter()
                .filter(|t| t.is_active && t.status != TaskStatus::Paused)
                .filter(|t| t.next_run_at.map(|at| at < stalled_after).unwrap_or(false))
                .count()
        })
        .unwrap_or(0);
    checks.insert("scheduler".into(), json!({ "ok": overdue == 0, "overdue": overdue }));
    healthy &= overdue == 0;

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "checks": checks,
    });
    Ok((status, Json(body)))
}

#[utoipa::path(
    get,
    path = "/api/admin/system/statistics",
    responses((status = 200, description = "Activity over the last 24 hours"))
)]
#[axum::debug_handler]
pub async fn statistics(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let since = Utc::now() - Duration::hours(24);

    let logs: Vec<_> = state
        .webhooks
        .logs()
        .all()
        .await?
        .into_iter()
        .filter(|l| l.created_at >= since)
        .collect();
    let jobs: Vec<_> = state
        .etl
        .jobs()
        .all()
        .await?
        .into_iter()
        .filter(|j| j.created_at >= since)
        .collect();
    let tasks = state.scheduler.tasks().all().await?;

    Ok(Json(json!({
        "since": since,
        "webhooks": {
            "received": logs.len(),
            "by_status": tally(logs.iter().map(|l| l.status)),
        },
        "etl_jobs": {
            "created": jobs.len(),
            "by_status": tally(jobs.iter().map(|j| j.status)),
        },
        "tasks": {
            "runs": tasks.iter().map(|t| t.run_count).sum::<u64>(),
            "failures": tasks.iter().map(|t| t.fail_count).sum::<u64>(),
        },
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::webhook_log::WebhookStatus;

    #[test]
    fn tally_uses_wire_names() {
        let counts = tally([
            WebhookStatus::Processed,
            WebhookStatus::Failed,
            WebhookStatus::Processed,
        ]);
        assert_eq!(counts["processed"], 2);
        assert_eq!(counts["failed"], 1);
    }
}
