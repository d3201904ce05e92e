use axum::http::StatusCode;
use axum::response::Response;

use crate::app::errors;

pub mod admin;
pub mod print_jobs;
pub mod system;
pub mod webhooks;

/// Parse a path id, answering 400 when it is malformed.
pub(crate) fn parse_id<T: std::str::FromStr>(raw: &str, what: &'static str) -> Result<T, Response> {
    raw.parse::<T>().map_err(|_| {
        errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("invalid {what} id"))
    })
}
