//! Database adapters: the Postgres pool wrapper, its schema, and the
//! in-memory stand-in used by tests and single-process dev runs.
//!
//! Each store trait (`JobStore`, `PrintJobStore`, `OrderStore`, ...) is
//! implemented for both [`PgStore`] and [`MemoryStore`] next to the trait
//! definition, so one handle serves every queue.

pub mod memory;
pub mod schema;

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Encode, Executor, PgPool, Postgres, Type};
use tracing::{info, instrument};

use signpost_core::TransitionOutcome;

use crate::error::{StoreError, map_sqlx_error};

pub use memory::MemoryStore;

/// Postgres-backed store for every pipeline table.
///
/// ## Thread Safety
///
/// `PgStore` is `Send + Sync` and cheap to clone; the SQLx pool handles
/// connection management. Multi-row updates run inside a transaction.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the schema. Every statement is idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in schema::STATEMENTS {
            sqlx::query(statement)
                .execute(self.pool())
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        info!(statements = schema::STATEMENTS.len(), "schema applied");
        Ok(())
    }
}

/// SQL for a conditional status transition on one row keyed by `$1`.
///
/// Yields a single `applied` column. A miss is classified by
/// [`settle_transition`], which reads the row again in a new statement.
pub(crate) fn transition_sql(table: &str, key: &str, set: &str, allowed_from: &str) -> String {
    format!(
        r#"
        WITH updated AS (
            UPDATE {table}
            SET {set}
            WHERE {key} = $1 AND status IN ({allowed_from})
            RETURNING 1
        )
        SELECT EXISTS (SELECT 1 FROM updated) AS applied
        "#
    )
}

/// Turn the `applied` flag of a `transition_sql` row into an outcome.
///
/// When the update missed, the status is re-read rather than taken from the
/// update's snapshot: a concurrent writer holding the row lock may have moved
/// it to the target state while this statement waited.
pub(crate) async fn settle_transition<'c, E, K>(
    executor: E,
    table: &str,
    key: &str,
    id: K,
    applied: bool,
    already: &[&str],
) -> Result<TransitionOutcome, StoreError>
where
    E: Executor<'c, Database = Postgres>,
    K: for<'q> Encode<'q, Postgres> + Type<Postgres> + Send,
{
    if applied {
        return Ok(TransitionOutcome::Applied);
    }
    let sql = format!("SELECT status FROM {table} WHERE {key} = $1");
    let current: Option<String> = sqlx::query_scalar(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(|e| map_sqlx_error("settle_transition", e))?;
    Ok(transition_outcome(current, false, already))
}

/// Interpret a transition given the row's current status.
pub(crate) fn transition_outcome(
    current: Option<String>,
    applied: bool,
    already: &[&str],
) -> TransitionOutcome {
    match (current, applied) {
        (_, true) => TransitionOutcome::Applied,
        (None, false) => TransitionOutcome::NotFound,
        (Some(current), false) if already.contains(&current.as_str()) => {
            TransitionOutcome::AlreadyApplied
        }
        (Some(current), false) => TransitionOutcome::Rejected { current },
    }
}
