use async_trait::async_trait;
use chrono::{DateTime, Utc};

use signpost_core::{OrderId, TransitionOutcome, truncate_error};

use super::types::{AttemptStatus, CheckoutAttempt};
use crate::db::MemoryStore;
use crate::db::memory::{read, write};
use crate::error::StoreError;

#[async_trait]
pub trait CheckoutAttemptStore: Send + Sync {
    /// Fails with `StoreError::Conflict` on a duplicate token or key.
    async fn insert_attempt(&self, attempt: &CheckoutAttempt) -> Result<(), StoreError>;

    async fn get_attempt(&self, token: &str) -> Result<Option<CheckoutAttempt>, StoreError>;

    /// created -> session_created, recording the provider session id.
    async fn attempt_session_created(
        &self,
        token: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// created | session_created | failed -> completed.
    async fn complete_attempt(
        &self,
        token: &str,
        customer_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// created | session_created -> failed.
    async fn fail_attempt(
        &self,
        token: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;

    async fn latest_attempt_for_order(
        &self,
        order_id: OrderId,
        purpose: &str,
    ) -> Result<Option<CheckoutAttempt>, StoreError>;
}

pub(crate) const SESSION_FROM: &[AttemptStatus] = &[AttemptStatus::Created];
pub(crate) const SESSION_ALREADY: &[AttemptStatus] =
    &[AttemptStatus::SessionCreated, AttemptStatus::Completed];
pub(crate) const COMPLETE_FROM: &[AttemptStatus] = &[
    AttemptStatus::Created,
    AttemptStatus::SessionCreated,
    AttemptStatus::Failed,
];
pub(crate) const FAIL_FROM: &[AttemptStatus] =
    &[AttemptStatus::Created, AttemptStatus::SessionCreated];

fn transition(
    attempt: Option<&mut CheckoutAttempt>,
    allowed: &[AttemptStatus],
    already: &[AttemptStatus],
    apply: impl FnOnce(&mut CheckoutAttempt),
) -> TransitionOutcome {
    match attempt {
        None => TransitionOutcome::NotFound,
        Some(a) if allowed.contains(&a.status) => {
            apply(a);
            TransitionOutcome::Applied
        }
        Some(a) if already.contains(&a.status) => TransitionOutcome::AlreadyApplied,
        Some(a) => TransitionOutcome::rejected(a.status.as_str()),
    }
}

#[async_trait]
impl CheckoutAttemptStore for MemoryStore {
    async fn insert_attempt(&self, attempt: &CheckoutAttempt) -> Result<(), StoreError> {
        let mut attempts = write(&self.checkout_attempts)?;
        if attempts.contains_key(&attempt.attempt_token)
            || attempts
                .values()
                .any(|a| a.idempotency_key == attempt.idempotency_key)
        {
            return Err(StoreError::Conflict(format!(
                "checkout attempt exists: {}",
                attempt.attempt_token
            )));
        }
        attempts.insert(attempt.attempt_token.clone(), attempt.clone());
        Ok(())
    }

    async fn get_attempt(&self, token: &str) -> Result<Option<CheckoutAttempt>, StoreError> {
        Ok(read(&self.checkout_attempts)?.get(token).cloned())
    }

    async fn attempt_session_created(
        &self,
        token: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut attempts = write(&self.checkout_attempts)?;
        Ok(transition(attempts.get_mut(token), SESSION_FROM, SESSION_ALREADY, |a| {
            a.status = AttemptStatus::SessionCreated;
            a.external_session_id = Some(session_id.to_string());
            a.updated_at = now;
        }))
    }

    async fn complete_attempt(
        &self,
        token: &str,
        customer_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut attempts = write(&self.checkout_attempts)?;
        Ok(transition(
            attempts.get_mut(token),
            COMPLETE_FROM,
            &[AttemptStatus::Completed],
            |a| {
                a.status = AttemptStatus::Completed;
                if let Some(customer) = customer_id {
                    a.external_customer_id = Some(customer.to_string());
                }
                a.error_message = None;
                a.updated_at = now;
            },
        ))
    }

    async fn fail_attempt(
        &self,
        token: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut attempts = write(&self.checkout_attempts)?;
        Ok(transition(
            attempts.get_mut(token),
            FAIL_FROM,
            &[AttemptStatus::Failed],
            |a| {
                a.status = AttemptStatus::Failed;
                a.error_message = Some(truncate_error(error));
                a.updated_at = now;
            },
        ))
    }

    async fn latest_attempt_for_order(
        &self,
        order_id: OrderId,
        purpose: &str,
    ) -> Result<Option<CheckoutAttempt>, StoreError> {
        Ok(read(&self.checkout_attempts)?
            .values()
            .filter(|a| a.order_id == Some(order_id) && a.purpose == purpose)
            .max_by_key(|a| a.created_at)
            .cloned())
    }
}
