//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store backend and external collaborator selection
//! - `routes/`: HTTP handlers, one file per surface
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{
    Extension, Router,
    routing::{get, post},
};
use tower::ServiceBuilder;

use signpost_infra::Settings;

use crate::middleware::{self, AuthState};

pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub async fn build_app(settings: &Settings) -> anyhow::Result<Router> {
    let services = services::build_services(settings).await?;
    Ok(router(Arc::new(services)))
}

/// Router over already-assembled services.
pub fn router(services: Arc<AppServices>) -> Router {
    let print_auth = AuthState::new(services.print_token.clone(), "print");
    let admin_auth = AuthState::new(services.admin_token.clone(), "admin");

    let admin = routes::admin::router().route_layer(axum::middleware::from_fn_with_state(
        admin_auth,
        middleware::auth_middleware,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .route("/stripe/webhook", post(routes::webhooks::payment_webhook))
        .nest("/api/print-jobs", routes::print_jobs::router(print_auth))
        .nest("/admin", admin)
        .layer(Extension(services))
        .layer(ServiceBuilder::new())
}
