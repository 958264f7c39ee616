//! Postgres-backed job store.
//!
//! One `flowforge_jobs` table holds timers, executable jobs and dead letters.
//! Every lock transition is a single `UPDATE ... WHERE` statement guarded by
//! the row's `version` (and lease columns), so concurrent engine instances
//! sharing the database can never both win the same job.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (insert only) |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use flowforge_core::{ExpectedVersion, JobId, LockOwner};

use super::store::{JobQuery, JobStats, JobStore, JobStoreError};
use super::types::{DeadLetterEntry, FailureOutcome, Job, JobKind, JobState, LockToken};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS flowforge_jobs (
    id                    UUID PRIMARY KEY,
    kind                  TEXT NOT NULL,
    handler_type          TEXT NOT NULL,
    payload               JSONB NOT NULL,
    state                 TEXT NOT NULL,
    due_at                TIMESTAMPTZ NOT NULL,
    lock_owner            TEXT,
    lock_lease            UUID,
    lock_expires_at       TIMESTAMPTZ,
    retries               INTEGER NOT NULL DEFAULT 0,
    exception             TEXT,
    correlation_id        UUID,
    process_definition_id UUID,
    process_instance_id   UUID,
    version               BIGINT NOT NULL DEFAULT 0,
    created_at            TIMESTAMPTZ NOT NULL,
    updated_at            TIMESTAMPTZ NOT NULL,
    dead_lettered_at      TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS flowforge_jobs_acquire_idx ON flowforge_jobs (state, due_at);
"#;

const COLUMNS: &str = "id, kind, handler_type, payload, state, due_at, lock_owner, lock_lease, \
    lock_expires_at, retries, exception, correlation_id, process_definition_id, \
    process_instance_id, version, created_at, updated_at, dead_lettered_at";

/// Postgres-backed job store.
///
/// `PostgresJobStore` is `Send + Sync`; all statements go through the SQLx
/// connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the jobs table and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    fn expected_version(expected: ExpectedVersion) -> Option<i64> {
        match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v as i64),
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO flowforge_jobs (
                id, kind, handler_type, payload, state, due_at, retries, exception,
                correlation_id, process_definition_id, process_instance_id, version,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.kind.as_str())
        .bind(&job.handler_type)
        .bind(&job.payload)
        .bind(job.state.as_str())
        .bind(job.due_at)
        .bind(job.retries as i32)
        .bind(&job.exception)
        .bind(job.correlation_id.map(Uuid::from))
        .bind(job.process_definition_id.map(Uuid::from))
        .bind(job.process_instance_id.map(Uuid::from))
        .bind(job.version as i64)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(job.id),
            Err(e) if is_unique_violation(&e) => Err(JobStoreError::AlreadyExists(job.id)),
            Err(e) => Err(map_sqlx_error("insert", e)),
        }
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM flowforge_jobs WHERE id = $1 AND state <> 'dead_lettered'"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn find_acquirable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM flowforge_jobs
            WHERE state = 'executable'
              AND due_at <= $1
              AND (lock_expires_at IS NULL OR lock_expires_at <= $1)
            ORDER BY due_at ASC, created_at ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_acquirable", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self, token), fields(job_id = %job_id, owner = %token.owner), err)]
    async fn try_lock(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        token: LockToken,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE flowforge_jobs
            SET lock_owner = $2, lock_lease = $3, lock_expires_at = $4,
                version = version + 1, updated_at = $5
            WHERE id = $1
              AND state = 'executable'
              AND due_at <= $5
              AND (lock_expires_at IS NULL OR lock_expires_at <= $5)
              AND ($6::BIGINT IS NULL OR version = $6)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(token.owner.as_str())
        .bind(token.lease)
        .bind(token.expires_at)
        .bind(now)
        .bind(Self::expected_version(expected))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_lock", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn renew_lock(
        &self,
        job_id: JobId,
        token: &LockToken,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE flowforge_jobs
            SET lock_expires_at = $4, version = version + 1
            WHERE id = $1 AND lock_owner = $2 AND lock_lease = $3
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(token.owner.as_str())
        .bind(token.lease)
        .bind(expires_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew_lock", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, job_id: JobId, token: &LockToken) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE flowforge_jobs
            SET lock_owner = NULL, lock_lease = NULL, lock_expires_at = NULL,
                version = version + 1
            WHERE id = $1 AND lock_owner = $2 AND lock_lease = $3
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(token.owner.as_str())
        .bind(token.lease)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_lock", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, token), fields(job_id = %job_id), err)]
    async fn complete(&self, job_id: JobId, token: &LockToken) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            "DELETE FROM flowforge_jobs WHERE id = $1 AND lock_owner = $2 AND lock_lease = $3",
        )
        .bind(job_id.as_uuid())
        .bind(token.owner.as_str())
        .bind(token.lease)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, token, outcome), fields(job_id = %job_id), err)]
    async fn record_failure(
        &self,
        job_id: JobId,
        token: &LockToken,
        outcome: FailureOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let (state, due_at, dead_lettered_at) = match &outcome {
            FailureOutcome::Retry { due_at, .. } => (JobState::Executable, Some(*due_at), None),
            FailureOutcome::DeadLetter { .. } => (JobState::DeadLettered, None, Some(now)),
        };

        let row = sqlx::query(&format!(
            r#"
            UPDATE flowforge_jobs
            SET retries = retries + 1,
                exception = $4,
                state = $5,
                due_at = COALESCE($6, due_at),
                dead_lettered_at = $7,
                lock_owner = NULL, lock_lease = NULL, lock_expires_at = NULL,
                version = version + 1,
                updated_at = $8
            WHERE id = $1 AND lock_owner = $2 AND lock_lease = $3
            RETURNING {COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(token.owner.as_str())
        .bind(token.lease)
        .bind(outcome.error())
        .bind(state.as_str())
        .bind(due_at)
        .bind(dead_lettered_at)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_failure", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn find_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM flowforge_jobs
            WHERE state = 'timer' AND due_at <= $1
            ORDER BY due_at ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_due_timers", e))?;

        rows.iter().map(job_from_row).collect()
    }

    async fn promote_timer(
        &self,
        job_id: JobId,
        expected: ExpectedVersion,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE flowforge_jobs
            SET state = 'executable', version = version + 1, updated_at = $2
            WHERE id = $1
              AND state = 'timer'
              AND due_at <= $2
              AND ($3::BIGINT IS NULL OR version = $3)
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(now)
        .bind(Self::expected_version(expected))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("promote_timer", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn list(&self, query: &JobQuery) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM flowforge_jobs
            WHERE ($1::TEXT IS NULL OR state = $1)
              AND ($2::TEXT IS NULL OR kind = $2)
              AND ($3::TEXT IS NULL OR handler_type = $3)
            ORDER BY due_at ASC, created_at ASC
            LIMIT $4
            "#
        ))
        .bind(query.state.map(|s| s.as_str()))
        .bind(query.kind.map(|k| k.as_str()))
        .bind(query.handler_type.as_deref())
        .bind(query.limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(job_from_row).collect()
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM flowforge_jobs
            WHERE state = 'dead_lettered'
            ORDER BY dead_lettered_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter()
            .map(|row| {
                let job = job_from_row(row)?;
                let at: Option<DateTime<Utc>> = row
                    .try_get("dead_lettered_at")
                    .map_err(|e| JobStoreError::InvalidRecord(e.to_string()))?;
                let reason = job.exception.clone().unwrap_or_default();
                let at = at.unwrap_or(job.updated_at);
                Ok(DeadLetterEntry::new(job, reason, at))
            })
            .collect()
    }

    async fn retry_dead_letter(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE flowforge_jobs
            SET state = 'executable', retries = 0, due_at = $2, dead_lettered_at = NULL,
                lock_owner = NULL, lock_lease = NULL, lock_expires_at = NULL,
                version = version + 1, updated_at = $2
            WHERE id = $1 AND state = 'dead_lettered'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("retry_dead_letter", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(JobStoreError::NotFound(job_id)),
        }
    }

    async fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            "DELETE FROM flowforge_jobs WHERE id = $1 AND state = 'dead_lettered'",
        )
        .bind(job_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_dead_letter", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id));
        }
        Ok(())
    }

    async fn delete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            "DELETE FROM flowforge_jobs WHERE id = $1 AND state <> 'dead_lettered'",
        )
        .bind(job_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id));
        }
        Ok(())
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<JobStats, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'timer') AS timers,
                COUNT(*) FILTER (WHERE state = 'executable'
                    AND (lock_expires_at IS NULL OR lock_expires_at <= $1)) AS executable,
                COUNT(*) FILTER (WHERE state = 'executable'
                    AND lock_expires_at > $1) AS locked,
                COUNT(*) FILTER (WHERE state = 'dead_lettered') AS dead_lettered
            FROM flowforge_jobs
            "#,
        )
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |name: &str| -> Result<usize, JobStoreError> {
            row.try_get::<i64, _>(name)
                .map(|v| v.max(0) as usize)
                .map_err(|e| JobStoreError::InvalidRecord(format!("failed to read {name}: {e}")))
        };

        Ok(JobStats {
            timers: count("timers")?,
            executable: count("executable")?,
            locked: count("locked")?,
            dead_lettered: count("dead_lettered")?,
        })
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let invalid = |e: sqlx::Error| JobStoreError::InvalidRecord(e.to_string());

    let kind: String = row.try_get("kind").map_err(invalid)?;
    let state: String = row.try_get("state").map_err(invalid)?;
    let lock_owner: Option<String> = row.try_get("lock_owner").map_err(invalid)?;
    let lock_lease: Option<Uuid> = row.try_get("lock_lease").map_err(invalid)?;
    let lock_expires_at: Option<DateTime<Utc>> = row.try_get("lock_expires_at").map_err(invalid)?;
    let lock = match (lock_owner, lock_lease, lock_expires_at) {
        (Some(owner), Some(lease), Some(expires_at)) => Some(LockToken {
            owner: LockOwner::new(owner),
            lease,
            expires_at,
        }),
        _ => None,
    };

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(invalid)?),
        kind: JobKind::parse(&kind)
            .ok_or_else(|| JobStoreError::InvalidRecord(format!("unknown job kind '{kind}'")))?,
        handler_type: row.try_get("handler_type").map_err(invalid)?,
        payload: row.try_get("payload").map_err(invalid)?,
        state: JobState::parse(&state)
            .ok_or_else(|| JobStoreError::InvalidRecord(format!("unknown job state '{state}'")))?,
        due_at: row.try_get("due_at").map_err(invalid)?,
        lock,
        retries: row.try_get::<i32, _>("retries").map_err(invalid)?.max(0) as u32,
        exception: row.try_get("exception").map_err(invalid)?,
        correlation_id: row
            .try_get::<Option<Uuid>, _>("correlation_id")
            .map_err(invalid)?
            .map(Into::into),
        process_definition_id: row
            .try_get::<Option<Uuid>, _>("process_definition_id")
            .map_err(invalid)?
            .map(Into::into),
        process_instance_id: row
            .try_get::<Option<Uuid>, _>("process_instance_id")
            .map_err(invalid)?
            .map(Into::into),
        version: row.try_get::<i64, _>("version").map_err(invalid)?.max(0) as u64,
        created_at: row.try_get("created_at").map_err(invalid)?,
        updated_at: row.try_get("updated_at").map_err(invalid)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => JobStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
