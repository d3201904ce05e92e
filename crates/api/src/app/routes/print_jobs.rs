//! Print-worker endpoints (`/api/print-jobs`).
//!
//! Everything here requires the print bearer token, except the PDF download,
//! which also accepts the signed link handed out by `claim`.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use signpost_core::PrintJobId;
use signpost_infra::print_queue::PrintQueueError;

use super::parse_id;
use crate::app::{errors, services::AppServices};
use crate::middleware::{self, AuthState};

const DEFAULT_CLAIM_LIMIT: usize = 10;

pub fn router(auth: AuthState) -> Router {
    Router::new()
        .route("/claim", post(claim))
        .route("/:job_id/downloaded", post(downloaded))
        .route("/:job_id/printed", post(printed))
        .route_layer(axum::middleware::from_fn_with_state(
            auth,
            middleware::auth_middleware,
        ))
        .route("/:job_id/pdf", get(download_pdf))
}

#[derive(Debug, Deserialize)]
pub struct ClaimQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub expires: Option<i64>,
    pub sig: Option<String>,
}

/// POST /api/print-jobs/claim?limit=N
pub async fn claim(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ClaimQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_CLAIM_LIMIT);
    match services.print_queue.claim(limit).await {
        Ok(jobs) => Json(json!({ "jobs": jobs })).into_response(),
        Err(e) => print_queue_error_to_response(e),
    }
}

/// GET /api/print-jobs/{job_id}/pdf
pub async fn download_pdf(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> Response {
    let parsed = job_id.parse::<PrintJobId>().ok();
    let bearer_ok = AuthState::new(services.print_token.clone(), "print")
        .check(&headers)
        .is_ok();
    let link_ok = match (parsed, query.expires, query.sig.as_deref()) {
        (Some(id), Some(expires), Some(sig)) => {
            services.print_queue.verify_download(id, expires, sig).is_ok()
        }
        _ => false,
    };
    if !bearer_ok && !link_ok {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let job_id: PrintJobId = match parse_id(&job_id, "print job") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.print_queue.artifact(job_id).await {
        Ok(Some(bytes)) => (
            [
                (header::CONTENT_TYPE, "application/pdf".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"print_job_{job_id}.pdf\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "print job or PDF not found"),
        Err(e) => print_queue_error_to_response(e),
    }
}

/// POST /api/print-jobs/{job_id}/downloaded
pub async fn downloaded(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> Response {
    let job_id = match parse_id(&job_id, "print job") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.print_queue.ack_downloaded(job_id).await {
        Ok(outcome) => errors::transition_to_response(outcome, "already_processed"),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /api/print-jobs/{job_id}/printed
pub async fn printed(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> Response {
    let job_id = match parse_id(&job_id, "print job") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.print_queue.ack_printed(job_id).await {
        Ok(outcome) => errors::transition_to_response(outcome, "already_printed"),
        Err(e) => errors::store_error_to_response(e),
    }
}

fn print_queue_error_to_response(err: PrintQueueError) -> Response {
    match err {
        PrintQueueError::Store(e) => errors::store_error_to_response(e),
        PrintQueueError::Storage(e) => {
            error!(error = %e, "artifact storage error");
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", e.to_string())
        }
        PrintQueueError::Auth(e) => {
            errors::json_error(StatusCode::UNAUTHORIZED, "unauthorized", e.to_string())
        }
    }
}
