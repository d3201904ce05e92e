use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No secret configured on this side; every request is refused.
    #[error("credential not configured")]
    NotConfigured,

    #[error("missing credential")]
    Missing,

    #[error("invalid credential")]
    Invalid,

    #[error("malformed signature header: {0}")]
    MalformedHeader(String),

    #[error("timestamp outside tolerance window")]
    Expired,
}
