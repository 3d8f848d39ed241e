use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use taskforge_core::BrokerJobId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/:queue/jobs", post(add_job).get(list_jobs))
        .route("/:queue/jobs/:id", get(get_job).delete(remove_job))
        .route("/:queue/pause", post(pause_queue))
        .route("/:queue/resume", post(resume_queue))
        .route("/:queue/metrics", get(queue_metrics))
}

pub async fn add_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(queue): Path<String>,
    Json(mut body): Json<dto::AddJobRequest>,
) -> axum::response::Response {
    let options = body.options(principal.principal_id());
    match services.queue.add_job(&queue, &body.name, body.payload, options).await {
        Ok(added) => (StatusCode::CREATED, Json(dto::AddJobResponse::from(added))).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let state = match query.state() {
        Ok(s) => s,
        Err(msg) => return errors::bad_request(msg),
    };
    let jobs: Vec<dto::JobResponse> = services
        .queue
        .list_jobs(&queue, state, query.range())
        .await
        .into_iter()
        .map(dto::JobResponse::from)
        .collect();
    Json(jobs).into_response()
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path((queue, id)): Path<(String, String)>,
) -> axum::response::Response {
    match services.queue.get_job_status(&queue, &BrokerJobId::new(id)).await {
        Some(job) => Json(dto::JobResponse::from(job)).into_response(),
        None => errors::not_found("job"),
    }
}

pub async fn remove_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path((queue, id)): Path<(String, String)>,
) -> axum::response::Response {
    if !services.queue.is_available() {
        return errors::broker_unavailable();
    }
    if services.queue.remove_job(&queue, &BrokerJobId::new(id)).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        errors::not_found("removable job")
    }
}

pub async fn pause_queue(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
) -> axum::response::Response {
    if !services.queue.is_available() {
        return errors::broker_unavailable();
    }
    let paused = services.queue.pause_queue(&queue).await;
    Json(serde_json::json!({ "queue": queue, "paused": paused })).into_response()
}

pub async fn resume_queue(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
) -> axum::response::Response {
    if !services.queue.is_available() {
        return errors::broker_unavailable();
    }
    let resumed = services.queue.resume_queue(&queue).await;
    Json(serde_json::json!({ "queue": queue, "resumed": resumed })).into_response()
}

/// Zeroed counts when no broker is configured.
pub async fn queue_metrics(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
) -> axum::response::Response {
    Json(services.queue.get_queue_metrics(&queue).await).into_response()
}
