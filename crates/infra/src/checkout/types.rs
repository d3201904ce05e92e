use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use signpost_core::{DomainError, OrderId, UserId};

/// ```text
/// created -> session_created -> completed
///    \            \
///     `------------`-> failed -> completed (late webhook)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Created,
    SessionCreated,
    Completed,
    Failed,
}

impl AttemptStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::SessionCreated => "session_created",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether a new request may reuse an attempt in this state.
    pub const fn is_reusable(&self) -> bool {
        matches!(self, Self::Created | Self::SessionCreated)
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "session_created" => Ok(Self::SessionCreated),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::validation(format!("unknown attempt status: {other}"))),
        }
    }
}

/// One user intent to pay, bound to a fixed set of session parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutAttempt {
    pub attempt_token: String,
    /// Sent to the provider; `"{purpose}_{attempt_token}"`.
    pub idempotency_key: String,
    pub purpose: String,
    pub params_hash: String,
    pub status: AttemptStatus,
    pub user_id: Option<UserId>,
    pub order_id: Option<OrderId>,
    pub external_session_id: Option<String>,
    pub external_customer_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckoutAttempt {
    pub fn new(
        purpose: &str,
        params_hash: String,
        user_id: Option<UserId>,
        order_id: Option<OrderId>,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        if purpose.trim().is_empty() {
            return Err(DomainError::validation("checkout purpose must not be empty"));
        }
        let attempt_token = Uuid::new_v4().simple().to_string();
        Ok(Self {
            idempotency_key: format!("{purpose}_{attempt_token}"),
            attempt_token,
            purpose: purpose.to_string(),
            params_hash,
            status: AttemptStatus::Created,
            user_id,
            order_id,
            external_session_id: None,
            external_customer_id: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_purpose_scoped_and_unique() {
        let now = Utc::now();
        let a = CheckoutAttempt::new("sign_order", "h".into(), None, None, now).unwrap();
        let b = CheckoutAttempt::new("sign_order", "h".into(), None, None, now).unwrap();
        assert_eq!(a.idempotency_key, format!("sign_order_{}", a.attempt_token));
        assert_ne!(a.attempt_token, b.attempt_token);
        assert_eq!(a.attempt_token.len(), 32);
    }

    #[test]
    fn empty_purpose_is_rejected() {
        assert!(CheckoutAttempt::new(" ", "h".into(), None, None, Utc::now()).is_err());
    }
}
