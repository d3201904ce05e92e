use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::warn;

use signpost_auth::{AuthError, TokenVerifier};

/// Shared-secret bearer check for one route group (print worker, admin).
#[derive(Clone)]
pub struct AuthState {
    pub verifier: Arc<dyn TokenVerifier>,
    pub realm: &'static str,
}

impl AuthState {
    pub fn new(verifier: Arc<dyn TokenVerifier>, realm: &'static str) -> Self {
        Self { verifier, realm }
    }

    pub fn check(&self, headers: &HeaderMap) -> Result<(), StatusCode> {
        let token = extract_bearer(headers)?;
        self.verifier.verify(token).map_err(|e| {
            if e == AuthError::NotConfigured {
                warn!(realm = self.realm, "bearer token not configured; refusing request");
            }
            StatusCode::UNAUTHORIZED
        })
    }
}

pub async fn auth_middleware(
    State(state): State<AuthState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    state.check(req.headers())?;
    Ok(next.run(req).await)
}

pub fn extract_bearer(headers: &HeaderMap) -> Result<&str, StatusCode> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    let header = header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = header.trim();
    if token.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use signpost_auth::StaticTokenVerifier;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn bearer_must_match_configured_token() {
        let state = AuthState::new(Arc::new(StaticTokenVerifier::new(Some("s3cret"))), "print");
        assert!(state.check(&headers("Bearer s3cret")).is_ok());
        assert_eq!(state.check(&headers("Bearer nope")), Err(StatusCode::UNAUTHORIZED));
        assert_eq!(state.check(&headers("Basic s3cret")), Err(StatusCode::UNAUTHORIZED));
        assert_eq!(state.check(&HeaderMap::new()), Err(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn unconfigured_token_refuses_everything() {
        let state = AuthState::new(Arc::new(StaticTokenVerifier::new(None)), "admin");
        assert_eq!(state.check(&headers("Bearer anything")), Err(StatusCode::UNAUTHORIZED));
    }
}
