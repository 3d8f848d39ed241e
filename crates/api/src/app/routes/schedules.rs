use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use taskforge_core::{CronSchedule, ScheduleId};
use taskforge_infra::cron_scheduler::CronJobSpec;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_schedules).post(create_schedule))
        .route("/:id", get(get_schedule).delete(remove_schedule))
        .route("/:id/toggle", post(toggle_schedule))
}

/// Load a schedule the caller owns.
///
/// Someone else's schedule answers 403; a malformed id answers 400.
async fn owned(
    services: &AppServices,
    principal: &PrincipalContext,
    raw_id: &str,
) -> Result<CronSchedule, axum::response::Response> {
    let id = raw_id
        .parse::<ScheduleId>()
        .map_err(|e| errors::bad_request(format!("invalid schedule id: {e}")))?;
    let schedule = services
        .scheduler
        .get(id)
        .await
        .map_err(errors::schedule_error_to_response)?;
    if schedule.owner != principal.principal_id() {
        return Err(errors::json_error(
            StatusCode::FORBIDDEN,
            "forbidden",
            "schedule belongs to another principal",
        ));
    }
    Ok(schedule)
}

pub async fn create_schedule(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<dto::CreateScheduleRequest>,
) -> axum::response::Response {
    let spec = CronJobSpec::new(body.name, body.pattern, body.queue, body.job_name).with_payload(body.payload);
    match services.scheduler.add_cron_job(spec, principal.principal_id()).await {
        Ok(schedule) => (StatusCode::CREATED, Json(schedule)).into_response(),
        Err(e) => errors::schedule_error_to_response(e),
    }
}

pub async fn list_schedules(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<dto::ListSchedulesQuery>,
) -> axum::response::Response {
    let owner = (!query.all).then(|| principal.principal_id());
    match services.scheduler.list_schedules(owner).await {
        Ok(schedules) => Json(schedules).into_response(),
        Err(e) => errors::schedule_error_to_response(e),
    }
}

pub async fn get_schedule(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match owned(&services, &principal, &id).await {
        Ok(schedule) => Json(schedule).into_response(),
        Err(resp) => resp,
    }
}

pub async fn remove_schedule(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let schedule = match owned(&services, &principal, &id).await {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match services.scheduler.remove_cron_job(schedule.id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => errors::not_found("schedule"),
        Err(e) => errors::schedule_error_to_response(e),
    }
}

pub async fn toggle_schedule(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::ToggleScheduleRequest>,
) -> axum::response::Response {
    let schedule = match owned(&services, &principal, &id).await {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match services.scheduler.toggle_schedule(schedule.id, body.is_active).await {
        Ok(updated) => Json(updated).into_response(),
        Err(e) => errors::schedule_error_to_response(e),
    }
}
