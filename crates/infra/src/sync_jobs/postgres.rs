//! Postgres-backed stores for the sync pipeline.
//!
//! ## Schema
//!
//! Three tables, bootstrapped by [`ensure_schema`]:
//!
//! - `sync_jobs` — one row per [`SyncJob`]; rows are never deleted,
//!   terminal statuses are retained for audit
//! - `sync_error_logs` — append-only failure records
//! - `entitlements` — the application-side access flag per user
//!
//! ## Claiming discipline
//!
//! `claim_batch` is a single `UPDATE … WHERE id IN (SELECT … FOR UPDATE
//! SKIP LOCKED) RETURNING` statement. Row locks serialize concurrent
//! schedulers on the same rows, and `SKIP LOCKED` makes the losers move
//! on instead of blocking, so a job can never be claimed twice. The inner
//! select takes only the oldest eligible job per subject and excludes
//! subjects that already have an `in_progress` row, which is what upholds
//! the at-most-one-concurrent-job-per-subject invariant across processes.
//!
//! ## Error mapping
//!
//! All sqlx errors collapse into the store's `Storage` variant with the
//! failing operation named. Connection and authentication failures keep
//! their driver message, which is what the error classifier's critical
//! patterns match against downstream.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use streamgate_core::{SubjectId, UserId};
use streamgate_sync::{
    DesiredAction, EntitlementError, EntitlementStore, ErrorLog, ErrorLogError, ErrorLogId,
    ErrorLogStore, JobStatus, Severity, SyncJob, SyncJobId,
};

use super::store::{JobStats, JobStore, JobStoreError};

/// Create the pipeline's tables and indexes if they do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_jobs (
            id             UUID PRIMARY KEY,
            subject_id     UUID NOT NULL,
            user_id        UUID NOT NULL,
            desired_action TEXT NOT NULL,
            status         TEXT NOT NULL,
            attempt_count  INTEGER NOT NULL DEFAULT 0,
            not_before     TIMESTAMPTZ NOT NULL,
            last_error     TEXT NULL,
            claimed_at     TIMESTAMPTZ NULL,
            created_at     TIMESTAMPTZ NOT NULL,
            processed_at   TIMESTAMPTZ NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS sync_jobs_claim_idx
         ON sync_jobs (status, not_before, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS sync_jobs_subject_idx
         ON sync_jobs (subject_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_error_logs (
            id         UUID PRIMARY KEY,
            job_id     UUID NOT NULL,
            user_id    UUID NOT NULL,
            message    TEXT NOT NULL,
            severity   TEXT NOT NULL,
            context    JSONB NULL,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS sync_error_logs_job_idx
         ON sync_error_logs (job_id, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entitlements (
            user_id    UUID PRIMARY KEY,
            active     BOOLEAN NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

fn map_sqlx_error(operation: &str, e: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("{operation}: {e}"))
}

fn status_from_str(s: &str) -> Result<JobStatus, JobStoreError> {
    match s {
        "pending" => Ok(JobStatus::Pending),
        "in_progress" => Ok(JobStatus::InProgress),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        other => Err(JobStoreError::Storage(format!("unknown job status: {other}"))),
    }
}

fn action_from_str(s: &str) -> Result<DesiredAction, JobStoreError> {
    match s {
        "grant" => Ok(DesiredAction::Grant),
        "revoke" => Ok(DesiredAction::Revoke),
        other => Err(JobStoreError::Storage(format!("unknown desired action: {other}"))),
    }
}

fn row_to_job(row: &PgRow) -> Result<SyncJob, JobStoreError> {
    let status: String = row
        .try_get("status")
        .map_err(|e| map_sqlx_error("row_to_job", e))?;
    let action: String = row
        .try_get("desired_action")
        .map_err(|e| map_sqlx_error("row_to_job", e))?;
    let attempt_count: i32 = row
        .try_get("attempt_count")
        .map_err(|e| map_sqlx_error("row_to_job", e))?;

    Ok(SyncJob {
        id: SyncJobId::from_uuid(
            row.try_get("id").map_err(|e| map_sqlx_error("row_to_job", e))?,
        ),
        subject_id: SubjectId::from_uuid(
            row.try_get("subject_id")
                .map_err(|e| map_sqlx_error("row_to_job", e))?,
        ),
        user_id: UserId::from_uuid(
            row.try_get("user_id")
                .map_err(|e| map_sqlx_error("row_to_job", e))?,
        ),
        desired_action: action_from_str(&action)?,
        status: status_from_str(&status)?,
        attempt_count: attempt_count.max(0) as u32,
        not_before: row
            .try_get("not_before")
            .map_err(|e| map_sqlx_error("row_to_job", e))?,
        last_error: row
            .try_get("last_error")
            .map_err(|e| map_sqlx_error("row_to_job", e))?,
        claimed_at: row
            .try_get("claimed_at")
            .map_err(|e| map_sqlx_error("row_to_job", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| map_sqlx_error("row_to_job", e))?,
        processed_at: row
            .try_get("processed_at")
            .map_err(|e| map_sqlx_error("row_to_job", e))?,
    })
}

const JOB_COLUMNS: &str = "id, subject_id, user_id, desired_action, status, attempt_count, \
                           not_before, last_error, claimed_at, created_at, processed_at";

/// Postgres-backed job store.
///
/// Shareable across threads and processes; all coordination happens
/// through row locks taken inside single statements.
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

    /// Report a transition that matched no `in_progress` row as precisely
    /// as possible: missing job vs. wrong current status.
    async fn transition_conflict(
        &self,
        id: SyncJobId,
        to: JobStatus,
    ) -> JobStoreError {
        let row = sqlx::query("SELECT status FROM sync_jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&*self.pool)
            .await;
        match row {
            Ok(Some(row)) => match row.try_get::<String, _>("status") {
                Ok(status) => match status_from_str(&status) {
                    Ok(from) => JobStoreError::InvalidTransition { id, from, to },
                    Err(e) => e,
                },
                Err(e) => map_sqlx_error("transition_conflict", e),
            },
            Ok(None) => JobStoreError::NotFound(id),
            Err(e) => map_sqlx_error("transition_conflict", e),
        }
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self), fields(subject_id = %subject_id, user_id = %user_id), err)]
    async fn enqueue(
        &self,
        subject_id: SubjectId,
        user_id: UserId,
        desired_action: DesiredAction,
    ) -> Result<SyncJobId, JobStoreError> {
        let job = SyncJob::new(subject_id, user_id, desired_action);
        sqlx::query(
            r#"
            INSERT INTO sync_jobs
                (id, subject_id, user_id, desired_action, status, attempt_count,
                 not_before, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(job.id.0)
        .bind(job.subject_id.as_uuid())
        .bind(job.user_id.as_uuid())
        .bind(job.desired_action.as_str())
        .bind(job.status.as_str())
        .bind(job.attempt_count as i32)
        .bind(job.not_before)
        .bind(job.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;
        Ok(job.id)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: SyncJobId) -> Result<Option<SyncJob>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(row_to_job).transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_batch(&self, limit: usize) -> Result<Vec<SyncJob>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE sync_jobs
            SET status = 'in_progress', claimed_at = NOW()
            WHERE id IN (
                SELECT j.id
                FROM sync_jobs j
                WHERE j.status = 'pending'
                  AND j.not_before <= NOW()
                  AND NOT EXISTS (
                      SELECT 1 FROM sync_jobs b
                      WHERE b.subject_id = j.subject_id
                        AND b.status = 'in_progress'
                  )
                  AND NOT EXISTS (
                      SELECT 1 FROM sync_jobs e
                      WHERE e.subject_id = j.subject_id
                        AND e.status = 'pending'
                        AND e.not_before <= NOW()
                        AND (e.created_at, e.id) < (j.created_at, j.id)
                  )
                ORDER BY j.created_at, j.id
                LIMIT $1
                FOR UPDATE OF j SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let mut jobs = rows
            .iter()
            .map(row_to_job)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING order is unspecified; restore oldest-first.
        jobs.sort_by_key(|j| (j.created_at, j.id.0));
        Ok(jobs)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn complete(&self, id: SyncJobId) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'completed', last_error = NULL, processed_at = NOW()
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(id.0)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_conflict(id, JobStatus::Completed).await);
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn fail_transiently(
        &self,
        id: SyncJobId,
        error: &str,
        next_not_before: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'pending',
                attempt_count = attempt_count + 1,
                last_error = $2,
                not_before = $3
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(id.0)
        .bind(error)
        .bind(next_not_before)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_transiently", e))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_conflict(id, JobStatus::Pending).await);
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn fail_permanently(&self, id: SyncJobId, error: &str) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'failed',
                attempt_count = attempt_count + 1,
                last_error = $2,
                processed_at = NOW()
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(id.0)
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_permanently", e))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_conflict(id, JobStatus::Failed).await);
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<SyncJob>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM sync_jobs
            WHERE $1::text IS NULL OR status = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_status", e))?;

        rows.iter().map(row_to_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM sync_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let n = n.max(0) as usize;
            match status_from_str(&status)? {
                JobStatus::Pending => stats.pending = n,
                JobStatus::InProgress => stats.in_progress = n,
                JobStatus::Completed => stats.completed = n,
                JobStatus::Failed => stats.failed = n,
            }
        }
        Ok(stats)
    }

    #[instrument(skip(self), err)]
    async fn reap_stale(&self, older_than: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'pending', claimed_at = NULL
            WHERE status = 'in_progress'
              AND claimed_at IS NOT NULL
              AND claimed_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reap_stale", e))?;
        Ok(result.rows_affected())
    }
}

/// Postgres-backed append-only error log.
#[derive(Debug, Clone)]
pub struct PostgresErrorLogStore {
    pool: Arc<PgPool>,
}

impl PostgresErrorLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn severity_from_str(s: &str) -> Result<Severity, ErrorLogError> {
    match s {
        "recoverable" => Ok(Severity::Recoverable),
        "critical" => Ok(Severity::Critical),
        other => Err(ErrorLogError::Storage(format!("unknown severity: {other}"))),
    }
}

fn row_to_error_log(row: &PgRow) -> Result<ErrorLog, ErrorLogError> {
    let severity: String = row
        .try_get("severity")
        .map_err(|e| ErrorLogError::Storage(e.to_string()))?;
    Ok(ErrorLog {
        id: ErrorLogId(
            row.try_get("id")
                .map_err(|e| ErrorLogError::Storage(e.to_string()))?,
        ),
        job_id: SyncJobId::from_uuid(
            row.try_get("job_id")
                .map_err(|e| ErrorLogError::Storage(e.to_string()))?,
        ),
        user_id: UserId::from_uuid(
            row.try_get("user_id")
                .map_err(|e| ErrorLogError::Storage(e.to_string()))?,
        ),
        message: row
            .try_get("message")
            .map_err(|e| ErrorLogError::Storage(e.to_string()))?,
        severity: severity_from_str(&severity)?,
        context: row
            .try_get::<Option<JsonValue>, _>("context")
            .map_err(|e| ErrorLogError::Storage(e.to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| ErrorLogError::Storage(e.to_string()))?,
    })
}

#[async_trait::async_trait]
impl ErrorLogStore for PostgresErrorLogStore {
    #[instrument(skip(self, log), fields(job_id = %log.job_id), err)]
    async fn append(&self, log: ErrorLog) -> Result<(), ErrorLogError> {
        sqlx::query(
            r#"
            INSERT INTO sync_error_logs
                (id, job_id, user_id, message, severity, context, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(log.id.0)
        .bind(log.job_id.0)
        .bind(log.user_id.as_uuid())
        .bind(&log.message)
        .bind(log.severity.as_str())
        .bind(&log.context)
        .bind(log.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| ErrorLogError::Storage(format!("append: {e}")))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn list_for_job(&self, job_id: SyncJobId) -> Result<Vec<ErrorLog>, ErrorLogError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, user_id, message, severity, context, created_at
            FROM sync_error_logs
            WHERE job_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(job_id.0)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| ErrorLogError::Storage(format!("list_for_job: {e}")))?;
        rows.iter().map(row_to_error_log).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_recent(&self, limit: usize) -> Result<Vec<ErrorLog>, ErrorLogError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, user_id, message, severity, context, created_at
            FROM sync_error_logs
            ORDER BY created_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| ErrorLogError::Storage(format!("list_recent: {e}")))?;
        rows.iter().map(row_to_error_log).collect()
    }
}

/// Postgres-backed entitlement store.
///
/// Both mutations are upserts, so re-applying a grant or revoke is a
/// no-op — the idempotence the reconciler relies on.
#[derive(Debug, Clone)]
pub struct PostgresEntitlementStore {
    pool: Arc<PgPool>,
}

impl PostgresEntitlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn set_active(&self, user_id: UserId, active: bool) -> Result<(), EntitlementError> {
        sqlx::query(
            r#"
            INSERT INTO entitlements (user_id, active, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id)
            DO UPDATE SET active = EXCLUDED.active, updated_at = NOW()
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(active)
        .execute(&*self.pool)
        .await
        .map_err(|e| EntitlementError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl EntitlementStore for PostgresEntitlementStore {
    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn is_entitled(&self, user_id: UserId) -> Result<bool, EntitlementError> {
        let row = sqlx::query("SELECT active FROM entitlements WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| EntitlementError::Unavailable(e.to_string()))?;
        match row {
            Some(row) => row
                .try_get("active")
                .map_err(|e| EntitlementError::Unavailable(e.to_string())),
            None => Ok(false),
        }
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn grant(&self, user_id: UserId) -> Result<(), EntitlementError> {
        self.set_active(user_id, true).await
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn revoke(&self, user_id: UserId) -> Result<(), EntitlementError> {
        self.set_active(user_id, false).await
    }
}
