use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::services::AppServices;
use crate::context::PrincipalContext;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn whoami(Extension(principal): Extension<PrincipalContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "principal_id": principal.principal_id().to_string(),
    }))
}

/// Per-queue worker counters; empty when no broker is configured.
pub async fn workers(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    let stats: serde_json::Map<String, serde_json::Value> = match &services.workers {
        Some(pool) => pool
            .queues()
            .into_iter()
            .filter_map(|queue| {
                let stats = pool.stats(&queue)?;
                Some((queue, serde_json::to_value(stats).ok()?))
            })
            .collect(),
        None => serde_json::Map::new(),
    };
    Json(serde_json::json!({
        "broker_available": services.queue.is_available(),
        "queues": stats,
    }))
}
