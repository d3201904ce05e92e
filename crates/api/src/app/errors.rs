use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use signpost_core::TransitionOutcome;
use signpost_infra::StoreError;

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StoreError::Unavailable(msg) => {
            error!(error = %msg, "store unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
        }
        other => {
            error!(error = %other, "store error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", other.to_string())
        }
    }
}

/// Map a conditional transition onto the ack response the print worker expects.
///
/// A rejected transition is final (e.g. the job was cancelled): 409 with
/// `retryable: false` so the worker stops re-sending the ack.
pub fn transition_to_response(
    outcome: TransitionOutcome,
    already_note: &'static str,
) -> axum::response::Response {
    match outcome {
        TransitionOutcome::Applied => Json(json!({ "success": true })).into_response(),
        TransitionOutcome::AlreadyApplied => {
            Json(json!({ "success": true, "note": already_note })).into_response()
        }
        TransitionOutcome::Rejected { current } => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "invalid_transition",
                "message": format!("invalid transition from {current}"),
                "current": current,
                "retryable": false,
            })),
        )
            .into_response(),
        TransitionOutcome::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
