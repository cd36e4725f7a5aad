use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::jobs::model::{FailureReason, Job, JobStatus, NewJob, QueueStats};
use crate::jobs::store::{JobStore, ReapOutcome};

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    queue: String,
    job_type: String,
    payload: Value,
    metadata: Value,
    priority: i32,
    max_attempts: i32,
    attempts_made: i32,
    status: String,
    run_at: DateTime<Utc>,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    lock_expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            queue: row.queue,
            job_type: row.job_type,
            payload: row.payload,
            metadata: row.metadata,
            priority: row.priority,
            max_attempts: row.max_attempts,
            attempts_made: row.attempts_made,
            status: row.status.parse()?,
            run_at: row.run_at,
            locked_by: row.locked_by,
            locked_at: row.locked_at,
            lock_expires_at: row.lock_expires_at,
            last_error: row.last_error,
            failure_reason: row.failure_reason.as_deref().map(str::parse::<FailureReason>).transpose()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
        })
    }
}

fn into_jobs(rows: Vec<JobRow>) -> anyhow::Result<Vec<Job>> {
    rows.into_iter().map(Job::try_from).collect()
}

/// Postgres-backed [`JobStore`]. Leasing uses `FOR UPDATE SKIP LOCKED` so any
/// number of worker processes can share one table.
#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
}

impl JobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for JobsRepo {
    // ----------------------------
    // Enqueue / reads
    // ----------------------------

    async fn insert(&self, job: NewJob) -> anyhow::Result<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs (id, queue, job_type, payload, metadata, priority, max_attempts, run_at, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'queued')
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&job.queue)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(&job.metadata)
        .bind(job.priority)
        .bind(job.max_attempts)
        .bind(job.run_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn find_live(&self, filter: &Value) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT *
            FROM jobs
            WHERE status IN ('queued', 'running')
              AND payload @> $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(filter)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    // ----------------------------
    // Leasing
    // ----------------------------

    async fn lease(&self, queue: &str, worker_id: &str, lease: Duration, limit: i64) -> anyhow::Result<Vec<Job>> {
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);

        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            WITH next AS (
                SELECT id
                FROM jobs
                WHERE queue = $1
                  AND status = 'queued'
                  AND run_at <= now()
                ORDER BY priority ASC, created_at ASC, seq ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $4
            )
            UPDATE jobs j
            SET status = 'running',
                locked_by = $2,
                locked_at = now(),
                lock_expires_at = now() + ($3::bigint * interval '1 millisecond'),
                attempts_made = j.attempts_made + 1,
                updated_at = now()
            FROM next
            WHERE j.id = next.id
            RETURNING j.*
            "#,
        )
        .bind(queue)
        .bind(worker_id)
        .bind(lease_ms)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        // UPDATE ... RETURNING does not preserve the CTE order.
        let mut jobs = into_jobs(rows)?;
        jobs.sort_by_key(|j| (j.priority, j.created_at));
        Ok(jobs)
    }

    async fn reap_expired(&self, queue: &str) -> anyhow::Result<ReapOutcome> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            WITH expired AS (
                SELECT id
                FROM jobs
                WHERE queue = $1
                  AND status = 'running'
                  AND lock_expires_at IS NOT NULL
                  AND lock_expires_at < now()
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs j
            SET status = CASE WHEN j.attempts_made >= j.max_attempts THEN 'failed' ELSE 'queued' END,
                failure_reason = CASE WHEN j.attempts_made >= j.max_attempts THEN 'STALLED' ELSE NULL END,
                finished_at = CASE WHEN j.attempts_made >= j.max_attempts THEN now() ELSE NULL END,
                run_at = CASE WHEN j.attempts_made >= j.max_attempts THEN j.run_at ELSE now() END,
                last_error = 'lease expired',
                locked_by = NULL,
                locked_at = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            FROM expired
            WHERE j.id = expired.id
            RETURNING j.*
            "#,
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        let (exhausted, requeued): (Vec<Job>, Vec<Job>) = into_jobs(rows)?
            .into_iter()
            .partition(|j| j.status == JobStatus::Failed);

        Ok(ReapOutcome { requeued, exhausted })
    }

    // ----------------------------
    // Attempt outcomes (guarded by locked_by)
    // ----------------------------

    async fn complete(&self, id: Uuid, worker_id: &str) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                finished_at = now(),
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND status = 'running'
              AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn reschedule(&self, id: Uuid, worker_id: &str, run_at: DateTime<Utc>, error: &str) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued',
                run_at = $3,
                last_error = $4,
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND status = 'running'
              AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(run_at)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn fail(&self, id: Uuid, worker_id: &str, reason: FailureReason, error: &str) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                failure_reason = $3,
                last_error = $4,
                finished_at = now(),
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND status = 'running'
              AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(reason.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn retry_failed(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'queued',
                attempts_made = 0,
                run_at = now(),
                failure_reason = NULL,
                last_error = NULL,
                finished_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND status = 'failed'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    // ----------------------------
    // Stats / retention
    // ----------------------------

    async fn stats(&self, queue: &str) -> anyhow::Result<QueueStats> {
        let (waiting, delayed, active, completed, failed) = sqlx::query_as::<_, (i64, i64, i64, i64, i64)>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'queued' AND run_at <= now()),
                COUNT(*) FILTER (WHERE status = 'queued' AND run_at > now()),
                COUNT(*) FILTER (WHERE status = 'running'),
                COUNT(*) FILTER (WHERE status = 'completed'),
                COUNT(*) FILTER (WHERE status = 'failed')
            FROM jobs
            WHERE queue = $1
            "#,
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            waiting,
            active,
            completed,
            failed,
            delayed,
        })
    }

    async fn prune(&self, queue: &str, keep_completed: i64, keep_failed: i64) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            WITH ranked AS (
                SELECT id,
                       status,
                       ROW_NUMBER() OVER (
                           PARTITION BY status
                           ORDER BY finished_at DESC NULLS LAST, seq DESC
                       ) AS rn
                FROM jobs
                WHERE queue = $1
                  AND status IN ('completed', 'failed')
            )
            DELETE FROM jobs
            WHERE id IN (
                SELECT id FROM ranked
                WHERE (status = 'completed' AND rn > $2)
                   OR (status = 'failed' AND rn > $3)
            )
            "#,
        )
        .bind(queue)
        .bind(keep_completed.max(0))
        .bind(keep_failed.max(0))
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn delete_terminal_before(&self, queue: &str, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE queue = $1
              AND status IN ('completed', 'failed')
              AND finished_at < $2
            "#,
        )
        .bind(queue)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }
}
