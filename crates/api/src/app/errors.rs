use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use taskforge_infra::cron_scheduler::ScheduleError;
use taskforge_infra::dead_letter::DeadLetterError;
use taskforge_infra::queue::QueueError;
use taskforge_infra::store::StoreError;

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn broker_unavailable() -> axum::response::Response {
    json_error(
        StatusCode::SERVICE_UNAVAILABLE,
        "broker_unavailable",
        "no message broker is configured",
    )
}

pub fn not_found(what: &str) -> axum::response::Response {
    json_error(StatusCode::NOT_FOUND, "not_found", format!("{what} not found"))
}

pub fn bad_request(message: impl Into<String>) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "validation_error", message)
}

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::BrokerUnavailable => broker_unavailable(),
        QueueError::InvalidInput(msg) => bad_request(msg),
        QueueError::Broker(e) => json_error(StatusCode::BAD_GATEWAY, "broker_error", e.to_string()),
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StoreError::Backend(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg),
    }
}

pub fn dead_letter_error_to_response(err: DeadLetterError) -> axum::response::Response {
    match err {
        DeadLetterError::NotFound(_) => not_found("dead letter entry"),
        DeadLetterError::AlreadyResolved(id) => json_error(
            StatusCode::CONFLICT,
            "already_resolved",
            format!("dead letter entry {id} is already resolved"),
        ),
        DeadLetterError::Requeue(e) => queue_error_to_response(e),
        DeadLetterError::Store(e) => store_error_to_response(e),
    }
}

pub fn schedule_error_to_response(err: ScheduleError) -> axum::response::Response {
    match err {
        ScheduleError::InvalidPattern(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_pattern", msg),
        ScheduleError::InvalidInput(msg) => bad_request(msg),
        ScheduleError::NotFound(_) => not_found("schedule"),
        ScheduleError::BrokerUnavailable => broker_unavailable(),
        ScheduleError::Broker(e) => json_error(StatusCode::BAD_GATEWAY, "broker_error", e.to_string()),
        ScheduleError::Store(e) => store_error_to_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_core::DeadLetterId;
    use taskforge_infra::broker::BrokerError;

    #[test]
    fn status_codes_follow_error_kind() {
        assert_eq!(
            queue_error_to_response(QueueError::BrokerUnavailable).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            queue_error_to_response(QueueError::Broker(BrokerError::Backend("x".into()))).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            dead_letter_error_to_response(DeadLetterError::AlreadyResolved(DeadLetterId::new())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            schedule_error_to_response(ScheduleError::InvalidPattern("60 * * * *".into())).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
