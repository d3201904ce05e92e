//! Operator endpoints: job inspection and retry, manual fulfillment retry,
//! print-job cancellation, and stuck-order reconciliation.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use signpost_core::{JobId, OrderId, PrintJobId, TransitionOutcome};
use signpost_infra::FulfillmentOutcome;
use signpost_infra::external::ExternalError;
use signpost_infra::jobs::JobStatus;

use super::parse_id;
use crate::app::{errors, services::AppServices};

const DEFAULT_LIST_LIMIT: usize = 50;
const DEFAULT_RECONCILE_HOURS: i64 = 24;

// ─────────────────────────────────────────────────────────────────────────────
// Request DTOs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ReconcileQuery {
    pub hours: Option<i64>,
    pub dry_run: Option<bool>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/stats", get(job_stats))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/retry", post(retry_job))
        .route("/orders/:id/retry-fulfillment", post(retry_fulfillment))
        .route("/orders/:id/print-jobs", get(order_print_jobs))
        .route("/print-jobs/:job_id", get(get_print_job))
        .route("/print-jobs/:job_id/cancel", post(cancel_print_job))
        .route("/prices/:lookup_key", get(lookup_price))
        .route("/reconcile", post(reconcile))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /admin/jobs?status=dead&limit=N
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ListJobsQuery>,
) -> Response {
    let status = match query.status.as_deref().map(str::parse::<JobStatus>) {
        None => None,
        Some(Ok(status)) => Some(status),
        Some(Err(e)) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_status", e.to_string());
        }
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    match services.jobs.list(status, limit).await {
        Ok(jobs) => Json(json!({ "count": jobs.len(), "jobs": jobs })).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /admin/jobs/stats
pub async fn job_stats(Extension(services): Extension<Arc<AppServices>>) -> Response {
    match services.jobs.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /admin/jobs/{id}
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let id: JobId = match parse_id(&id, "job") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.jobs.get(id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /admin/jobs/{id}/retry
pub async fn retry_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let id: JobId = match parse_id(&id, "job") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.jobs.retry(id).await {
        Ok(outcome) => errors::transition_to_response(outcome, "already_queued"),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /admin/orders/{id}/retry-fulfillment
///
/// Moves a `print_failed` order back to `paid` and runs fulfillment inline.
pub async fn retry_fulfillment(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let order_id: OrderId = match parse_id(&id, "order") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services
        .orders
        .reset_order_for_retry(order_id, services.clock.now())
        .await
    {
        Ok(TransitionOutcome::NotFound) => {
            return errors::json_error(StatusCode::NOT_FOUND, "not_found", "order not found");
        }
        Ok(TransitionOutcome::Applied) => info!(order_id = %order_id, "order reset for fulfillment retry"),
        Ok(_) => {}
        Err(e) => return errors::store_error_to_response(e),
    }

    let outcome = services.fulfillment.fulfill_order(order_id).await;
    let status = match &outcome {
        o if o.succeeded() => StatusCode::OK,
        FulfillmentOutcome::Rejected { .. } => StatusCode::CONFLICT,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, Json(outcome)).into_response()
}

/// GET /admin/orders/{id}/print-jobs
pub async fn order_print_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let order_id: OrderId = match parse_id(&id, "order") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.print_queue.jobs_for_order(order_id).await {
        Ok(jobs) => Json(json!({ "order_id": order_id, "jobs": jobs })).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /admin/print-jobs/{job_id}
pub async fn get_print_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> Response {
    let job_id: PrintJobId = match parse_id(&job_id, "print job") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.print_queue.status(job_id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "print job not found"),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /admin/print-jobs/{job_id}/cancel
pub async fn cancel_print_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> Response {
    let job_id: PrintJobId = match parse_id(&job_id, "print job") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match services.print_queue.cancel(job_id).await {
        Ok(outcome) => errors::transition_to_response(outcome, "already_cancelled"),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /admin/prices/{lookup_key}
pub async fn lookup_price(
    Extension(services): Extension<Arc<AppServices>>,
    Path(lookup_key): Path<String>,
) -> Response {
    match services.prices.price_id(&lookup_key).await {
        Ok(price_id) => Json(json!({ "lookup_key": lookup_key, "price_id": price_id })).into_response(),
        Err(ExternalError::NotConfigured(what)) => errors::json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "not_configured",
            format!("{what} not configured"),
        ),
        Err(e) => {
            warn!(lookup_key = %lookup_key, error = %e, "price lookup failed");
            errors::json_error(StatusCode::BAD_GATEWAY, "provider_error", e.to_string())
        }
    }
}

/// POST /admin/reconcile?hours=N&dry_run=bool
pub async fn reconcile(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ReconcileQuery>,
) -> Response {
    let hours = query.hours.unwrap_or(DEFAULT_RECONCILE_HOURS);
    if hours < 0 {
        return errors::json_error(StatusCode::BAD_REQUEST, "invalid_hours", "hours must not be negative");
    }
    match services
        .reconciler
        .reconcile_stuck_orders(chrono::Duration::hours(hours), query.dry_run.unwrap_or(false))
        .await
    {
        Ok(report) => Json(report).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
