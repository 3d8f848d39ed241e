use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use taskforge_core::DeadLetterId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_entries))
        .route("/stats", get(stats))
        .route("/:id", get(get_entry))
        .route("/:id/requeue", post(requeue))
        .route("/:id/resolve", post(resolve))
}

fn parse_id(raw: &str) -> Result<DeadLetterId, axum::response::Response> {
    raw.parse::<DeadLetterId>()
        .map_err(|e| errors::bad_request(format!("invalid dead letter id: {e}")))
}

pub async fn list_entries(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListDeadLettersQuery>,
) -> axum::response::Response {
    let filter = match query.filter() {
        Ok(f) => f,
        Err(msg) => return errors::bad_request(msg),
    };
    match services.dead_letters.list_entries(&filter).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => errors::dead_letter_error_to_response(e),
    }
}

pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.dead_letters.get_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::dead_letter_error_to_response(e),
    }
}

pub async fn get_entry(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.dead_letters.get(id).await {
        Ok(entry) => Json(entry).into_response(),
        Err(e) => errors::dead_letter_error_to_response(e),
    }
}

pub async fn requeue(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.dead_letters.requeue(id).await {
        Ok(added) => Json(dto::AddJobResponse::from(added)).into_response(),
        Err(e) => errors::dead_letter_error_to_response(e),
    }
}

pub async fn resolve(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.dead_letters.resolve(id).await {
        Ok(()) => Json(serde_json::json!({ "id": id, "resolved": true })).into_response(),
        Err(e) => errors::dead_letter_error_to_response(e),
    }
}
