use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::jobs::model::{FailureReason, Job, NewJob, QueueStats};

/// Result of one reaper pass over expired leases.
#[derive(Debug, Default)]
pub struct ReapOutcome {
    /// Stalled jobs put back in line for another attempt.
    pub requeued: Vec<Job>,
    /// Stalled jobs that had used their last attempt; now `failed`/`STALLED`.
    pub exhausted: Vec<Job>,
}

impl ReapOutcome {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.exhausted.is_empty()
    }
}

/// Durable job storage. Writes that finish an attempt are guarded by
/// `locked_by`, so a worker whose lease was reaped cannot overwrite the
/// outcome of the attempt that replaced it; those writes report `false`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: NewJob) -> anyhow::Result<Job>;

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Job>>;

    /// Newest `queued` or `running` job, in any queue, whose payload
    /// contains `filter` (jsonb `@>` semantics).
    async fn find_live(&self, filter: &Value) -> anyhow::Result<Option<Job>>;

    /// Leases up to `limit` ready jobs, lowest `priority` first, then oldest.
    /// Each lease counts as one delivery attempt.
    async fn lease(&self, queue: &str, worker_id: &str, lease: Duration, limit: i64) -> anyhow::Result<Vec<Job>>;

    async fn complete(&self, id: Uuid, worker_id: &str) -> anyhow::Result<bool>;

    async fn reschedule(&self, id: Uuid, worker_id: &str, run_at: DateTime<Utc>, error: &str) -> anyhow::Result<bool>;

    async fn fail(&self, id: Uuid, worker_id: &str, reason: FailureReason, error: &str) -> anyhow::Result<bool>;

    async fn reap_expired(&self, queue: &str) -> anyhow::Result<ReapOutcome>;

    /// `failed -> queued` with a fresh attempt budget. `None` when the job
    /// does not exist or is not failed.
    async fn retry_failed(&self, id: Uuid) -> anyhow::Result<Option<Job>>;

    async fn stats(&self, queue: &str) -> anyhow::Result<QueueStats>;

    /// Keeps the newest `keep_completed` completed and `keep_failed` failed
    /// jobs of `queue`; deletes the rest. Returns the number deleted.
    async fn prune(&self, queue: &str, keep_completed: i64, keep_failed: i64) -> anyhow::Result<u64>;

    async fn delete_terminal_before(&self, queue: &str, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;
}
