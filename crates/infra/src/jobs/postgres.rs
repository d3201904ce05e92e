//! Postgres implementation of [`JobStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Row};
use tracing::instrument;
use uuid::Uuid;

use signpost_core::{JobId, TransitionOutcome};

use super::store::{JobClaim, JobStore};
use super::types::{AsyncJob, BackoffStrategy, JobStats, JobStatus, RetryPolicy};
use crate::claim::ClaimQuery;
use crate::db::{PgStore, settle_transition, transition_sql};
use crate::error::{StoreError, map_sqlx_error};

const JOB_COLUMNS: &str = "t.id, t.job_type, t.payload, t.status, t.attempts, t.last_error, \
     t.locked_at, t.locked_by, t.next_run_at, t.created_at, t.updated_at";

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    job_type: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    next_run_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for AsyncJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(AsyncJob {
            id: JobId::from_uuid(row.id),
            job_type: row.job_type.parse()?,
            payload: row.payload,
            status: row.status.parse()?,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            last_error: row.last_error,
            locked_at: row.locked_at,
            locked_by: row.locked_by,
            next_run_at: row.next_run_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode(rows: Vec<JobRow>) -> Result<Vec<AsyncJob>, StoreError> {
    rows.into_iter().map(AsyncJob::try_from).collect()
}

fn seconds(d: chrono::Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

#[async_trait]
impl JobStore for PgStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type), err)]
    async fn insert_job(&self, job: &AsyncJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO async_jobs (id, job_type, payload, status, attempts, next_run_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.job_type.as_str())
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(job.attempts as i32)
        .bind(job.next_run_at)
        .bind(job.created_at)
        .execute(self.pool())
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;
        Ok(())
    }

    #[instrument(skip(self, claim), fields(limit = claim.limit, worker = %claim.worker_id), err)]
    async fn claim_jobs(&self, claim: &JobClaim) -> Result<Vec<AsyncJob>, StoreError> {
        let returning = JOB_COLUMNS;
        let sql = ClaimQuery {
            table: "async_jobs",
            key: "id",
            ready: r#"
                ($2::text[] IS NULL OR t.job_type = ANY($2))
                AND (
                    (t.status = 'queued' AND (t.next_run_at IS NULL OR t.next_run_at <= $3))
                    OR (t.status = 'processing' AND t.locked_at < $3 - make_interval(
                        secs => COALESCE(($4::jsonb ->> t.job_type)::double precision, $5)))
                    OR (t.status = 'failed' AND t.attempts < $6 AND t.next_run_at <= $3)
                )
            "#,
            order_by: "t.next_run_at ASC NULLS FIRST, t.created_at ASC, t.id ASC",
            set: "status = 'processing', locked_at = $3, locked_by = $7, \
                  attempts = t.attempts + 1, next_run_at = NULL, updated_at = $3",
            returning,
            limit_param: 1,
        }
        .sql();

        let job_types: Option<Vec<String>> = claim
            .job_types
            .as_ref()
            .map(|types| types.iter().map(|t| t.as_str().to_string()).collect());
        let overrides: serde_json::Map<String, serde_json::Value> = claim
            .stale_overrides
            .iter()
            .map(|(t, d)| (t.as_str().to_string(), serde_json::json!(seconds(*d))))
            .collect();

        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(claim.limit as i64)
            .bind(job_types)
            .bind(claim.now)
            .bind(serde_json::Value::Object(overrides))
            .bind(seconds(claim.stale_after))
            .bind(claim.max_attempts as i32)
            .bind(&claim.worker_id)
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_sqlx_error("claim_jobs", e))?;

        decode(rows)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn complete_job(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let sql = transition_sql(
            "async_jobs",
            "id",
            "status = 'done', locked_at = NULL, locked_by = NULL, updated_at = $2",
            "'processing'",
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(now)
            .fetch_one(self.pool())
            .await
            .map_err(|e| map_sqlx_error("complete_job", e))?;
        settle_transition(
            self.pool(),
            "async_jobs",
            "id",
            *id.as_uuid(),
            row.get("applied"),
            &["done"],
        )
        .await
    }

    #[instrument(skip(self, error, policy), fields(job_id = %id), err)]
    async fn fail_job(
        &self,
        id: JobId,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<AsyncJob>, StoreError> {
        let growth = match policy.strategy {
            BackoffStrategy::Exponential => 2.0_f64,
            BackoffStrategy::Fixed => 1.0_f64,
        };
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE async_jobs t
            SET last_error = $2,
                locked_at = NULL,
                locked_by = NULL,
                updated_at = $3,
                status = CASE WHEN t.attempts < $4 THEN 'queued' ELSE 'dead' END,
                next_run_at = CASE
                    WHEN t.attempts < $4
                    THEN $3 + make_interval(secs => LEAST($5 * power($6, t.attempts), $7))
                    ELSE NULL
                END
            WHERE t.id = $1 AND t.status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(signpost_core::truncate_error(error))
        .bind(now)
        .bind(policy.max_attempts as i32)
        .bind(policy.base_delay.as_secs_f64())
        .bind(growth)
        .bind(policy.max_delay.as_secs_f64())
        .fetch_optional(self.pool())
        .await
        .map_err(|e| map_sqlx_error("fail_job", e))?;

        row.map(AsyncJob::try_from).transpose()
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn bury_job(
        &self,
        id: JobId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let sql = transition_sql(
            "async_jobs",
            "id",
            "status = 'dead', last_error = $3, locked_at = NULL, locked_by = NULL, \
             next_run_at = NULL, updated_at = $2",
            "'queued', 'processing', 'failed'",
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(now)
            .bind(signpost_core::truncate_error(error))
            .fetch_one(self.pool())
            .await
            .map_err(|e| map_sqlx_error("bury_job", e))?;
        settle_transition(
            self.pool(),
            "async_jobs",
            "id",
            *id.as_uuid(),
            row.get("applied"),
            &["dead"],
        )
        .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn requeue_job(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let sql = transition_sql(
            "async_jobs",
            "id",
            "status = 'queued', attempts = 0, next_run_at = NULL, updated_at = $2",
            "'dead', 'failed'",
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(now)
            .fetch_one(self.pool())
            .await
            .map_err(|e| map_sqlx_error("requeue_job", e))?;
        settle_transition(
            self.pool(),
            "async_jobs",
            "id",
            *id.as_uuid(),
            row.get("applied"),
            &["queued"],
        )
        .await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<AsyncJob>, StoreError> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM async_jobs t WHERE t.id = $1"))
                .bind(id.as_uuid())
                .fetch_optional(self.pool())
                .await
                .map_err(|e| map_sqlx_error("get_job", e))?;
        row.map(AsyncJob::try_from).transpose()
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<AsyncJob>, StoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM async_jobs t
            WHERE ($1::text IS NULL OR t.status = $1)
            ORDER BY t.created_at ASC
            LIMIT $2
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;
        decode(rows)
    }

    async fn job_stats(&self) -> Result<JobStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM async_jobs GROUP BY status")
            .fetch_all(self.pool())
            .await
            .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            stats.record(status.parse()?, usize::try_from(n).unwrap_or(0));
        }
        Ok(stats)
    }
}
