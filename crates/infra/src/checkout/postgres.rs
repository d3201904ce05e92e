//! Postgres implementation of [`CheckoutAttemptStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Row};
use tracing::instrument;

use signpost_core::{OrderId, TransitionOutcome, UserId, truncate_error};

use super::store::CheckoutAttemptStore;
use super::types::{AttemptStatus, CheckoutAttempt};
use crate::db::{PgStore, settle_transition, transition_sql};
use crate::error::{StoreError, map_sqlx_error};

const ATTEMPT_COLUMNS: &str = "attempt_token, idempotency_key, purpose, params_hash, status, \
     user_id, order_id, external_session_id, external_customer_id, error_message, created_at, \
     updated_at";

#[derive(Debug, FromRow)]
struct AttemptRow {
    attempt_token: String,
    idempotency_key: String,
    purpose: String,
    params_hash: String,
    status: String,
    user_id: Option<i64>,
    order_id: Option<i64>,
    external_session_id: Option<String>,
    external_customer_id: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AttemptRow> for CheckoutAttempt {
    type Error = StoreError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        Ok(CheckoutAttempt {
            attempt_token: row.attempt_token,
            idempotency_key: row.idempotency_key,
            purpose: row.purpose,
            params_hash: row.params_hash,
            status: row.status.parse()?,
            user_id: row.user_id.map(UserId::new),
            order_id: row.order_id.map(OrderId::new),
            external_session_id: row.external_session_id,
            external_customer_id: row.external_customer_id,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn in_list(statuses: &[AttemptStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl CheckoutAttemptStore for PgStore {
    #[instrument(skip(self, attempt), fields(purpose = %attempt.purpose), err)]
    async fn insert_attempt(&self, attempt: &CheckoutAttempt) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO checkout_attempts ({ATTEMPT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(&attempt.attempt_token)
        .bind(&attempt.idempotency_key)
        .bind(&attempt.purpose)
        .bind(&attempt.params_hash)
        .bind(attempt.status.as_str())
        .bind(attempt.user_id.map(UserId::get))
        .bind(attempt.order_id.map(OrderId::get))
        .bind(&attempt.external_session_id)
        .bind(&attempt.external_customer_id)
        .bind(&attempt.error_message)
        .bind(attempt.created_at)
        .bind(attempt.updated_at)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("insert_attempt", e))?;
        Ok(())
    }

    async fn get_attempt(&self, token: &str) -> Result<Option<CheckoutAttempt>, StoreError> {
        let row: Option<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM checkout_attempts WHERE attempt_token = $1"
        ))
        .bind(token)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| map_sqlx_error("get_attempt", e))?;
        row.map(CheckoutAttempt::try_from).transpose()
    }

    async fn attempt_session_created(
        &self,
        token: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let sql = transition_sql(
            "checkout_attempts",
            "attempt_token",
            "status = 'session_created', external_session_id = $3, updated_at = $2",
            &in_list(super::store::SESSION_FROM),
        );
        let row = sqlx::query(&sql)
            .bind(token)
            .bind(now)
            .bind(session_id)
            .fetch_one(self.pool())
            .await
            .map_err(|e| map_sqlx_error("attempt_session_created", e))?;
        settle_transition(
            self.pool(),
            "checkout_attempts",
            "attempt_token",
            token,
            row.get("applied"),
            &["session_created", "completed"],
        )
        .await
    }

    async fn complete_attempt(
        &self,
        token: &str,
        customer_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let sql = transition_sql(
            "checkout_attempts",
            "attempt_token",
            "status = 'completed', error_message = NULL, \
             external_customer_id = COALESCE($3, external_customer_id), updated_at = $2",
            &in_list(super::store::COMPLETE_FROM),
        );
        let row = sqlx::query(&sql)
            .bind(token)
            .bind(now)
            .bind(customer_id)
            .fetch_one(self.pool())
            .await
            .map_err(|e| map_sqlx_error("complete_attempt", e))?;
        settle_transition(
            self.pool(),
            "checkout_attempts",
            "attempt_token",
            token,
            row.get("applied"),
            &["completed"],
        )
        .await
    }

    async fn fail_attempt(
        &self,
        token: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let sql = transition_sql(
            "checkout_attempts",
            "attempt_token",
            "status = 'failed', error_message = $3, updated_at = $2",
            &in_list(super::store::FAIL_FROM),
        );
        let row = sqlx::query(&sql)
            .bind(token)
            .bind(now)
            .bind(truncate_error(error))
            .fetch_one(self.pool())
            .await
            .map_err(|e| map_sqlx_error("fail_attempt", e))?;
        settle_transition(
            self.pool(),
            "checkout_attempts",
            "attempt_token",
            token,
            row.get("applied"),
            &["failed"],
        )
        .await
    }

    async fn latest_attempt_for_order(
        &self,
        order_id: OrderId,
        purpose: &str,
    ) -> Result<Option<CheckoutAttempt>, StoreError> {
        let row: Option<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM checkout_attempts \
             WHERE order_id = $1 AND purpose = $2 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(order_id.get())
        .bind(purpose)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| map_sqlx_error("latest_attempt_for_order", e))?;
        row.map(CheckoutAttempt::try_from).transpose()
    }
}
