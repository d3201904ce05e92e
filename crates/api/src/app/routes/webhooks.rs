//! Payment-provider webhook endpoint.
//!
//! The provider retries anything that is not 2xx, so failures that may
//! succeed later answer 5xx and permanent rejections answer 400.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, warn};

use signpost_infra::webhooks::{ProviderEvent, WebhookError, WebhookOutcome};

use crate::app::{errors, services::AppServices};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// POST /stripe/webhook
pub async fn payment_webhook(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !services.webhook_verifier.is_configured() {
        error!("payment webhook secret not configured; refusing delivery");
        return errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "webhook_not_configured",
            "webhook not configured",
        );
    }

    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if let Err(e) = services
        .webhook_verifier
        .verify(&body, signature, services.clock.now())
    {
        warn!(error = %e, "webhook signature rejected");
        return errors::json_error(StatusCode::BAD_REQUEST, "invalid_signature", e.to_string());
    }

    let event = match ProviderEvent::parse(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "webhook payload rejected");
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_payload", e.to_string());
        }
    };

    match services.webhooks.process(&event).await {
        Ok(WebhookOutcome::Processed) => Json(json!({ "status": "success" })).into_response(),
        Ok(WebhookOutcome::Duplicate) => {
            Json(json!({ "status": "success", "note": "duplicate" })).into_response()
        }
        Ok(WebhookOutcome::Failed(message)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "processing_failed",
                "message": message,
                "event_id": event.id,
            })),
        )
            .into_response(),
        Err(WebhookError::Invalid(e)) => {
            errors::json_error(StatusCode::BAD_REQUEST, "invalid_payload", e.to_string())
        }
        Err(WebhookError::Store(e)) => {
            error!(event_id = %event.id, error = %e, "webhook store error");
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}
