//! Attempt-based idempotency for checkout session creation.
//!
//! A double-submit reuses the attempt (and so the provider idempotency key);
//! changed parameters get a fresh attempt instead of replaying a key the
//! provider would reject.

use std::sync::Arc;

use tracing::{info, warn};

use signpost_core::{Clock, DomainError, OrderId, TransitionOutcome, UserId};

use super::hash::params_hash;
use super::store::CheckoutAttemptStore;
use super::types::CheckoutAttempt;
use crate::error::StoreError;
use crate::external::{CheckoutSession, ExternalError, PaymentProvider, SessionRequest};

#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("payment provider: {0}")]
    Provider(#[from] ExternalError),
}

/// Request to start (or resume) a checkout.
#[derive(Debug, Clone)]
pub struct BeginCheckout<'a> {
    pub purpose: &'a str,
    pub params: &'a serde_json::Value,
    pub user_id: Option<UserId>,
    pub order_id: Option<OrderId>,
    /// Token of an attempt the client already holds.
    pub attempt_token: Option<&'a str>,
}

/// Whether `params` are the ones `attempt` was created for.
pub fn validate_attempt_params(attempt: &CheckoutAttempt, params: &serde_json::Value) -> bool {
    attempt.params_hash == params_hash(params)
}

#[derive(Clone)]
pub struct CheckoutAttempts {
    store: Arc<dyn CheckoutAttemptStore>,
    provider: Arc<dyn PaymentProvider>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CheckoutAttempts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckoutAttempts").finish_non_exhaustive()
    }
}

impl CheckoutAttempts {
    pub fn new(
        store: Arc<dyn CheckoutAttemptStore>,
        provider: Arc<dyn PaymentProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            provider,
            clock,
        }
    }

    pub async fn create_attempt(
        &self,
        purpose: &str,
        params: &serde_json::Value,
        user_id: Option<UserId>,
        order_id: Option<OrderId>,
    ) -> Result<CheckoutAttempt, CheckoutError> {
        let attempt = CheckoutAttempt::new(
            purpose,
            params_hash(params),
            user_id,
            order_id,
            self.clock.now(),
        )?;
        self.store.insert_attempt(&attempt).await?;
        info!(purpose, attempt_token = %attempt.attempt_token, "checkout attempt created");
        Ok(attempt)
    }

    pub fn validate_attempt_params(
        &self,
        attempt: &CheckoutAttempt,
        params: &serde_json::Value,
    ) -> bool {
        validate_attempt_params(attempt, params)
    }

    /// Reuse the caller's attempt when it still matches, otherwise start a new one.
    pub async fn begin(&self, request: &BeginCheckout<'_>) -> Result<CheckoutAttempt, CheckoutError> {
        if let Some(token) = request.attempt_token {
            match self.store.get_attempt(token).await? {
                Some(existing)
                    if existing.purpose == request.purpose
                        && existing.status.is_reusable()
                        && validate_attempt_params(&existing, request.params) =>
                {
                    info!(attempt_token = token, "reusing checkout attempt");
                    return Ok(existing);
                }
                Some(existing) => {
                    info!(
                        attempt_token = token,
                        status = %existing.status,
                        "checkout attempt stale; starting a new one"
                    );
                }
                None => warn!(attempt_token = token, "unknown checkout attempt token"),
            }
        }
        self.create_attempt(request.purpose, request.params, request.user_id, request.order_id)
            .await
    }

    pub async fn get(&self, token: &str) -> Result<Option<CheckoutAttempt>, StoreError> {
        self.store.get_attempt(token).await
    }

    pub async fn mark_session_created(
        &self,
        token: &str,
        session_id: &str,
    ) -> Result<TransitionOutcome, StoreError> {
        self.store
            .attempt_session_created(token, session_id, self.clock.now())
            .await
    }

    pub async fn mark_completed(
        &self,
        token: &str,
        customer_id: Option<&str>,
    ) -> Result<TransitionOutcome, StoreError> {
        self.store
            .complete_attempt(token, customer_id, self.clock.now())
            .await
    }

    pub async fn mark_failed(
        &self,
        token: &str,
        error: &str,
    ) -> Result<TransitionOutcome, StoreError> {
        self.store.fail_attempt(token, error, self.clock.now()).await
    }

    pub async fn latest_for_order(
        &self,
        order_id: OrderId,
        purpose: &str,
    ) -> Result<Option<CheckoutAttempt>, StoreError> {
        self.store.latest_attempt_for_order(order_id, purpose).await
    }

    /// Create the provider session for `attempt`, or return the one it already has.
    pub async fn create_session(
        &self,
        attempt: &CheckoutAttempt,
        request: &SessionRequest,
    ) -> Result<CheckoutSession, CheckoutError> {
        if let Some(session_id) = &attempt.external_session_id {
            return Ok(self.provider.retrieve_session(session_id).await?);
        }

        match self
            .provider
            .create_session(request, &attempt.idempotency_key)
            .await
        {
            Ok(session) => {
                self.mark_session_created(&attempt.attempt_token, &session.id)
                    .await?;
                info!(
                    attempt_token = %attempt.attempt_token,
                    session_id = %session.id,
                    "checkout session created"
                );
                Ok(session)
            }
            Err(err) => {
                warn!(attempt_token = %attempt.attempt_token, error = %err, "checkout session failed");
                self.mark_failed(&attempt.attempt_token, &err.to_string())
                    .await?;
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::{Duration, Utc};
    use serde_json::json;
    use signpost_core::ManualClock;

    use crate::checkout::types::AttemptStatus;
    use crate::db::MemoryStore;
    use crate::external::LineItem;
    use crate::external::fakes::FakePayments;

    fn service() -> (Arc<FakePayments>, Arc<ManualClock>, CheckoutAttempts) {
        let payments = Arc::new(FakePayments::default());
        let clock = ManualClock::arc(Utc::now());
        let svc = CheckoutAttempts::new(MemoryStore::arc(), payments.clone(), clock.clone());
        (payments, clock, svc)
    }

    fn request() -> SessionRequest {
        SessionRequest {
            mode: "payment".into(),
            line_items: vec![LineItem {
                price: "price_sign".into(),
                quantity: 1,
            }],
            success_url: "https://x/ok".into(),
            cancel_url: "https://x/cancel".into(),
            customer: None,
            client_reference_id: Some("42".into()),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn double_submit_reuses_attempt_and_session() {
        let (payments, _, svc) = service();
        let params = json!({"price": "price_sign", "quantity": 1});
        let begin = BeginCheckout {
            purpose: "sign_order",
            params: &params,
            user_id: Some(UserId::new(7)),
            order_id: Some(OrderId::new(42)),
            attempt_token: None,
        };

        let attempt = svc.begin(&begin).await.unwrap();
        let session = svc.create_session(&attempt, &request()).await.unwrap();

        let again = svc
            .begin(&BeginCheckout {
                attempt_token: Some(&attempt.attempt_token),
                ..begin.clone()
            })
            .await
            .unwrap();
        assert_eq!(again.attempt_token, attempt.attempt_token);
        assert_eq!(again.status, AttemptStatus::SessionCreated);

        payments
            .sessions
            .lock()
            .unwrap()
            .insert(session.id.clone(), session.clone());
        let replay = svc.create_session(&again, &request()).await.unwrap();
        assert_eq!(replay.id, session.id);
        assert_eq!(payments.created(), vec![attempt.idempotency_key.clone()]);
    }

    #[tokio::test]
    async fn changed_params_start_a_fresh_attempt() {
        let (_, _, svc) = service();
        let monthly = json!({"plan": "pro", "interval": "month"});
        let yearly = json!({"interval": "year", "plan": "pro"});

        let first = svc
            .create_attempt("subscription_upgrade", &monthly, Some(UserId::new(1)), None)
            .await
            .unwrap();
        assert!(svc.validate_attempt_params(&first, &json!({"interval": "month", "plan": "pro"})));
        assert!(!svc.validate_attempt_params(&first, &yearly));

        let second = svc
            .begin(&BeginCheckout {
                purpose: "subscription_upgrade",
                params: &yearly,
                user_id: Some(UserId::new(1)),
                order_id: None,
                attempt_token: Some(&first.attempt_token),
            })
            .await
            .unwrap();
        assert_ne!(second.attempt_token, first.attempt_token);
        assert_ne!(second.idempotency_key, first.idempotency_key);
    }

    #[tokio::test]
    async fn completed_attempt_is_not_reused() {
        let (_, _, svc) = service();
        let params = json!({"price": "p"});
        let attempt = svc
            .create_attempt("listing_kit", &params, None, Some(OrderId::new(3)))
            .await
            .unwrap();
        assert_eq!(
            svc.mark_completed(&attempt.attempt_token, Some("cus_1")).await.unwrap(),
            TransitionOutcome::Applied
        );
        assert_eq!(
            svc.mark_completed(&attempt.attempt_token, None).await.unwrap(),
            TransitionOutcome::AlreadyApplied
        );
        assert_eq!(
            svc.mark_failed(&attempt.attempt_token, "late").await.unwrap(),
            TransitionOutcome::rejected("completed")
        );

        let next = svc
            .begin(&BeginCheckout {
                purpose: "listing_kit",
                params: &params,
                user_id: None,
                order_id: Some(OrderId::new(3)),
                attempt_token: Some(&attempt.attempt_token),
            })
            .await
            .unwrap();
        assert_ne!(next.attempt_token, attempt.attempt_token);
        let stored = svc.get(&attempt.attempt_token).await.unwrap().unwrap();
        assert_eq!(stored.external_customer_id.as_deref(), Some("cus_1"));
    }

    #[tokio::test]
    async fn latest_for_order_picks_newest_of_purpose() {
        let (_, clock, svc) = service();
        let order = Some(OrderId::new(42));
        svc.create_attempt("sign_order", &json!({"v": 1}), None, order).await.unwrap();
        clock.advance(Duration::seconds(5));
        let newest = svc
            .create_attempt("sign_order", &json!({"v": 2}), None, order)
            .await
            .unwrap();
        clock.advance(Duration::seconds(5));
        svc.create_attempt("listing_kit", &json!({"v": 3}), None, order).await.unwrap();

        let latest = svc.latest_for_order(OrderId::new(42), "sign_order").await.unwrap().unwrap();
        assert_eq!(latest.attempt_token, newest.attempt_token);
        assert!(svc.latest_for_order(OrderId::new(9), "sign_order").await.unwrap().is_none());
    }
}
