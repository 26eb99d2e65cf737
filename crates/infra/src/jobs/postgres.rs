//! Postgres-backed job store.
//!
//! Every state change is one conditional `UPDATE ... RETURNING` statement, so
//! Postgres row locking is the only arbiter of exclusivity:
//!
//! | operation | condition |
//! |---|---|
//! | `claim` | `status = 'QUEUED' AND (next_eligible_run IS NULL OR next_eligible_run <= now)` |
//! | `complete` | `status = 'PROCESSING' AND claim_token = $token AND result_locator IS NULL` |
//! | `record_retry_or_fail` | `status = 'PROCESSING' AND claim_token = $token` |
//! | `record_enqueue` | none; the handle is prepended whatever the status |
//!
//! When a conditional write matches no row, the current row is read back to
//! tell `NotFound` apart from a rejected write.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (insert only) |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Io / other | N/A | `Storage` |

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::{debug, instrument};

use mediaforge_core::{ClaimToken, DomainError, JobId, JobStatus, SchedulerHandle};

use super::store::{JobStore, JobStoreError};
use super::types::{FailureTransition, Job};

const JOB_COLUMNS: &str = "id, prompt, status, result_locator, attempt_count, next_eligible_run, \
     scheduling_history, claim_token, created_at, updated_at";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS generation_jobs (
    id                 UUID PRIMARY KEY,
    prompt             TEXT NOT NULL,
    status             TEXT NOT NULL DEFAULT 'QUEUED'
                       CHECK (status IN ('QUEUED', 'PROCESSING', 'COMPLETED', 'FAILED')),
    result_locator     TEXT NULL,
    attempt_count      INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
    next_eligible_run  TIMESTAMPTZ NULL,
    scheduling_history TEXT[] NOT NULL DEFAULT '{}',
    claim_token        UUID NULL,
    created_at         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at         TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS generation_jobs_history_idx
    ON generation_jobs USING GIN (scheduling_history);
"#;

/// Postgres-backed job store.
///
/// `PgPool` is internally reference counted; clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `generation_jobs` table and its indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn fetch(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|row| decode_job(&row)).transpose()
    }

    /// Explain why a conditional write on `id` matched no row.
    async fn diagnose(&self, id: JobId, expected: JobStatus) -> JobStoreError {
        match self.fetch(id).await {
            Ok(None) => JobStoreError::NotFound(id),
            Ok(Some(job)) if job.status != expected => {
                JobStoreError::rejected(id, DomainError::invalid_state(expected, job.status))
            }
            Ok(Some(_)) => JobStoreError::rejected(
                id,
                DomainError::conflict("job is held by another claim"),
            ),
            Err(e) => e,
        }
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        let history: Vec<Option<String>> = job
            .scheduling_history
            .iter()
            .map(|h| h.as_ref().map(|h| h.as_str().to_string()))
            .collect();

        let sql = format!(
            r#"
            INSERT INTO generation_jobs (
                id, prompt, status, result_locator, attempt_count, next_eligible_run,
                scheduling_history, claim_token, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job.id.as_uuid())
            .bind(&job.prompt)
            .bind(job.status.as_str())
            .bind(&job.result_locator)
            .bind(attempt_count_to_db(job.attempt_count)?)
            .bind(job.next_eligible_run)
            .bind(&history)
            .bind(job.claim_token.map(uuid::Uuid::from))
            .bind(job.created_at)
            .bind(job.updated_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    JobStoreError::AlreadyExists(job.id)
                } else {
                    map_sqlx_error("insert", e)
                }
            })?;
        decode_job(&row)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.fetch(id).await
    }

    #[instrument(skip(self, handle), fields(handle = %handle), err)]
    async fn find_by_handle(&self, handle: &SchedulerHandle) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM generation_jobs
            WHERE $1 = ANY(scheduling_history)
            ORDER BY created_at DESC
            LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(handle.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_handle", e))?;
        row.map(|row| decode_job(&row)).transpose()
    }

    #[instrument(skip(self, handle), fields(job_id = %id, handle = %handle), err)]
    async fn record_enqueue(
        &self,
        id: JobId,
        handle: SchedulerHandle,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE generation_jobs
            SET scheduling_history = array_prepend($2::text, scheduling_history),
                updated_at = $3
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(handle.as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("record_enqueue", e))?;

        match row {
            Some(row) => decode_job(&row),
            None => Err(JobStoreError::NotFound(id)),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn claim(
        &self,
        id: JobId,
        token: ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE generation_jobs
            SET status = 'PROCESSING',
                claim_token = $2,
                updated_at = $3
            WHERE id = $1
              AND status = 'QUEUED'
              AND (next_eligible_run IS NULL OR next_eligible_run <= $3)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(token.as_uuid())
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        debug!(claimed = row.is_some(), "claim attempted");
        row.map(|row| decode_job(&row)).transpose()
    }

    #[instrument(skip(self, locator), fields(job_id = %id), err)]
    async fn complete(
        &self,
        id: JobId,
        token: ClaimToken,
        locator: String,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE generation_jobs
            SET status = 'COMPLETED',
                result_locator = $3,
                attempt_count = attempt_count + 1,
                next_eligible_run = NULL,
                claim_token = NULL,
                updated_at = $4
            WHERE id = $1
              AND status = 'PROCESSING'
              AND claim_token = $2
              AND result_locator IS NULL
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(token.as_uuid())
            .bind(&locator)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("complete", e))?;

        match row {
            Some(row) => decode_job(&row),
            None => Err(self.diagnose(id, JobStatus::Processing).await),
        }
    }

    #[instrument(skip(self), fields(job_id = %id, to = %transition.target_status()), err)]
    async fn record_retry_or_fail(
        &self,
        id: JobId,
        token: ClaimToken,
        transition: FailureTransition,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let target = transition.target_status();
        let (next_run, handle) = match transition {
            FailureTransition::Retry { next_run, handle } => (Some(next_run), Some(handle.into_inner())),
            FailureTransition::Fail => (None, None),
        };

        let sql = format!(
            r#"
            UPDATE generation_jobs
            SET status = $3,
                next_eligible_run = $4,
                scheduling_history = array_append(scheduling_history, $5::text),
                attempt_count = attempt_count + 1,
                claim_token = NULL,
                updated_at = $6
            WHERE id = $1
              AND status = 'PROCESSING'
              AND claim_token = $2
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(token.as_uuid())
            .bind(target.as_str())
            .bind(next_run)
            .bind(handle)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("record_retry_or_fail", e))?;

        match row {
            Some(row) => decode_job(&row),
            None => Err(self.diagnose(id, JobStatus::Processing).await),
        }
    }
}

fn attempt_count_to_db(count: u32) -> Result<i32, JobStoreError> {
    i32::try_from(count)
        .map_err(|_| JobStoreError::Storage(format!("attempt_count {count} out of range")))
}

fn decode_job(row: &PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to deserialize job row: {e}")))?
        .try_into()
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {} (code {:?})",
            operation,
            db_err.message(),
            db_err.code()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    prompt: String,
    status: String,
    result_locator: Option<String>,
    attempt_count: i32,
    next_eligible_run: Option<DateTime<Utc>>,
    scheduling_history: Vec<Option<String>>,
    claim_token: Option<uuid::Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            prompt: row.try_get("prompt")?,
            status: row.try_get("status")?,
            result_locator: row.try_get("result_locator")?,
            attempt_count: row.try_get("attempt_count")?,
            next_eligible_run: row.try_get("next_eligible_run")?,
            scheduling_history: row.try_get("scheduling_history")?,
            claim_token: row.try_get("claim_token")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|e: DomainError| JobStoreError::Storage(e.to_string()))?;
        let attempt_count = u32::try_from(row.attempt_count).map_err(|_| {
            JobStoreError::Storage(format!("negative attempt_count {}", row.attempt_count))
        })?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            prompt: row.prompt,
            status,
            result_locator: row.result_locator,
            attempt_count,
            next_eligible_run: row.next_eligible_run,
            scheduling_history: row
                .scheduling_history
                .into_iter()
                .map(|h| h.map(SchedulerHandle::from))
                .collect(),
            claim_token: row.claim_token.map(ClaimToken::from_uuid),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
