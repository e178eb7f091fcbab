use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use contentflow_infra::{JobStoreError, LifecycleError};

pub fn lifecycle_error_to_response(err: LifecycleError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        LifecycleError::JobNotFound(_) | LifecycleError::Store(JobStoreError::NotFound(_)) => {
            json_error(StatusCode::NOT_FOUND, "job_not_found", message)
        }
        LifecycleError::InvalidStateTransition { .. } => {
            json_error(StatusCode::CONFLICT, "invalid_state_transition", message)
        }
        LifecycleError::InvalidProgressValue { .. } => {
            json_error(StatusCode::BAD_REQUEST, "invalid_progress_value", message)
        }
        LifecycleError::RetryNotAllowed { .. } => {
            json_error(StatusCode::CONFLICT, "retry_not_allowed", message)
        }
        LifecycleError::BackoffPending { .. } => {
            json_error(StatusCode::CONFLICT, "backoff_pending", message)
        }
        LifecycleError::NotStale { .. } => json_error(StatusCode::CONFLICT, "not_stale", message),
        LifecycleError::Conflict { .. } => json_error(StatusCode::CONFLICT, "conflict", message),
        LifecycleError::Store(e) => {
            tracing::error!(error = %e, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", message)
        }
    }
}

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
