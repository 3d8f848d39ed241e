use axum::{routing::get, Router};

pub mod dead_letters;
pub mod jobs;
pub mod schedules;
pub mod system;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/workers", get(system::workers))
        .nest("/queues", jobs::router())
        .nest("/dead-letters", dead_letters::router())
        .nest("/schedules", schedules::router())
}
