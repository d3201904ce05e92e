//! Postgres implementation of [`PrintJobStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Row};
use tracing::instrument;
use uuid::Uuid;

use signpost_core::{OrderId, PrintJobId, ProductMetadata, TransitionOutcome};

use super::store::PrintJobStore;
use super::types::{ClaimedPrintJob, PrintClaim, PrintJob};
use crate::claim::ClaimQuery;
use crate::db::{PgStore, settle_transition, transition_sql};
use crate::error::{StoreError, map_sqlx_error};

const PRINT_JOB_COLUMNS: &str = "t.job_id, t.idempotency_key, t.order_id, t.filename, t.status, \
     t.shipping_json, t.attempts, t.last_error, t.claimed_at, t.next_retry_at, t.downloaded_at, \
     t.printed_at, t.created_at, t.updated_at";

#[derive(Debug, FromRow)]
struct PrintJobRow {
    job_id: Uuid,
    idempotency_key: String,
    order_id: i64,
    filename: String,
    status: String,
    shipping_json: Option<serde_json::Value>,
    attempts: i32,
    last_error: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    downloaded_at: Option<DateTime<Utc>>,
    printed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PrintJobRow> for PrintJob {
    type Error = StoreError;

    fn try_from(row: PrintJobRow) -> Result<Self, Self::Error> {
        Ok(PrintJob {
            job_id: PrintJobId::from_uuid(row.job_id),
            idempotency_key: row.idempotency_key,
            order_id: OrderId::new(row.order_id),
            filename: row.filename,
            status: row.status.parse()?,
            shipping_json: row.shipping_json.unwrap_or(serde_json::Value::Null),
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            last_error: row.last_error,
            claimed_at: row.claimed_at,
            next_retry_at: row.next_retry_at,
            downloaded_at: row.downloaded_at,
            printed_at: row.printed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ProductRow {
    id: i64,
    print_product: Option<String>,
    material: Option<String>,
    sides: Option<String>,
    layout_id: Option<String>,
}

fn select_by(filter: &str) -> String {
    format!("SELECT {PRINT_JOB_COLUMNS} FROM print_jobs t WHERE {filter}")
}

#[async_trait]
impl PrintJobStore for PgStore {
    #[instrument(skip(self, job), fields(job_id = %job.job_id, order_id = %job.order_id), err)]
    async fn insert_print_job(&self, job: &PrintJob) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO print_jobs
                (job_id, idempotency_key, order_id, filename, status, shipping_json,
                 attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(job.job_id.as_uuid())
        .bind(&job.idempotency_key)
        .bind(job.order_id.get())
        .bind(&job.filename)
        .bind(job.status.as_str())
        .bind(&job.shipping_json)
        .bind(job.attempts as i32)
        .bind(job.created_at)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("insert_print_job", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_print_job_by_key(&self, key: &str) -> Result<Option<PrintJob>, StoreError> {
        let row: Option<PrintJobRow> = sqlx::query_as(&select_by("t.idempotency_key = $1"))
            .bind(key)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_sqlx_error("find_print_job_by_key", e))?;
        row.map(PrintJob::try_from).transpose()
    }

    async fn get_print_job(&self, id: PrintJobId) -> Result<Option<PrintJob>, StoreError> {
        let row: Option<PrintJobRow> = sqlx::query_as(&select_by("t.job_id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| map_sqlx_error("get_print_job", e))?;
        row.map(PrintJob::try_from).transpose()
    }

    async fn print_jobs_for_order(&self, order_id: OrderId) -> Result<Vec<PrintJob>, StoreError> {
        let rows: Vec<PrintJobRow> =
            sqlx::query_as(&format!("{} ORDER BY t.created_at ASC", select_by("t.order_id = $1")))
                .bind(order_id.get())
                .fetch_all(self.pool())
                .await
                .map_err(|e| map_sqlx_error("print_jobs_for_order", e))?;
        rows.into_iter().map(PrintJob::try_from).collect()
    }

    #[instrument(skip(self, claim), fields(limit = claim.limit), err)]
    async fn claim_print_jobs(
        &self,
        claim: &PrintClaim,
    ) -> Result<Vec<ClaimedPrintJob>, StoreError> {
        let sql = ClaimQuery {
            table: "print_jobs",
            key: "job_id",
            ready: r#"
                (t.status = 'queued' AND (t.next_retry_at IS NULL OR t.next_retry_at <= $2))
                OR (t.status = 'claimed' AND t.claimed_at < $3)
            "#,
            order_by: "t.created_at ASC, t.job_id ASC",
            set: "status = 'claimed', claimed_at = $2, next_retry_at = $4, \
                  attempts = t.attempts + 1, updated_at = $2",
            returning: PRINT_JOB_COLUMNS,
            limit_param: 1,
        }
        .sql();

        let rows: Vec<PrintJobRow> = sqlx::query_as(&sql)
            .bind(claim.limit as i64)
            .bind(claim.now)
            .bind(claim.now - claim.stale_claim_after)
            .bind(claim.now + claim.retry_after)
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_sqlx_error("claim_print_jobs", e))?;
        let jobs = rows
            .into_iter()
            .map(PrintJob::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let order_ids: Vec<i64> = jobs.iter().map(|j| j.order_id.get()).collect();
        let products: Vec<ProductRow> = sqlx::query_as(
            "SELECT id, print_product, material, sides, layout_id FROM orders WHERE id = ANY($1)",
        )
        .bind(&order_ids)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("claim_print_jobs", e))?;
        let mut products: HashMap<i64, ProductMetadata> = products
            .into_iter()
            .map(|p| {
                (
                    p.id,
                    ProductMetadata {
                        print_product: p.print_product,
                        material: p.material,
                        sides: p.sides,
                        layout_id: p.layout_id,
                    },
                )
            })
            .collect();

        Ok(jobs
            .into_iter()
            .map(|job| {
                let product = products.remove(&job.order_id.get()).unwrap_or_default();
                ClaimedPrintJob { job, product }
            })
            .collect())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn mark_print_job_downloaded(
        &self,
        id: PrintJobId,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let sql = transition_sql(
            "print_jobs",
            "job_id",
            "status = 'downloaded', downloaded_at = $2, next_retry_at = NULL, updated_at = $2",
            "'queued', 'claimed'",
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(now)
            .fetch_one(self.pool())
            .await
            .map_err(|e| map_sqlx_error("mark_print_job_downloaded", e))?;
        settle_transition(
            self.pool(),
            "print_jobs",
            "job_id",
            *id.as_uuid(),
            row.get("applied"),
            &["downloaded", "printed"],
        )
        .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn mark_print_job_printed(
        &self,
        id: PrintJobId,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("mark_print_job_printed", e))?;

        let sql = transition_sql(
            "print_jobs",
            "job_id",
            "status = 'printed', printed_at = $2, next_retry_at = NULL, updated_at = $2",
            "'queued', 'claimed', 'downloaded'",
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("mark_print_job_printed", e))?;
        let outcome = settle_transition(
            &mut *tx,
            "print_jobs",
            "job_id",
            *id.as_uuid(),
            row.get("applied"),
            &["printed"],
        )
        .await?;

        if outcome.is_applied() {
            sqlx::query(
                r#"
                UPDATE orders o
                SET status = 'fulfilled', fulfilled_at = $2, updated_at = $2
                FROM print_jobs p
                WHERE p.job_id = $1 AND o.id = p.order_id AND o.status <> 'fulfilled'
                "#,
            )
            .bind(id.as_uuid())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("mark_print_job_printed", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("mark_print_job_printed", e))?;
        Ok(outcome)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn cancel_print_job(
        &self,
        id: PrintJobId,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let sql = transition_sql(
            "print_jobs",
            "job_id",
            "status = 'cancelled', next_retry_at = NULL, updated_at = $2",
            "'queued', 'claimed', 'downloaded'",
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(now)
            .fetch_one(self.pool())
            .await
            .map_err(|e| map_sqlx_error("cancel_print_job", e))?;
        settle_transition(
            self.pool(),
            "print_jobs",
            "job_id",
            *id.as_uuid(),
            row.get("applied"),
            &["cancelled"],
        )
        .await
    }
}
