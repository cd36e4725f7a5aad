use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::jobs::maintenance::{cutoff, Retention};
use crate::jobs::memory::InMemoryJobStore;
use crate::jobs::model::{
    Job, JobHandle, JobRequest, JobState, NewJob, QueueStats, DEFAULT_ATTEMPTS, DEFAULT_PRIORITY,
    DEFAULT_QUEUE,
};
use crate::jobs::store::{JobStore, ReapOutcome};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
    #[error("invalid job: {0}")]
    InvalidJob(String),
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {id} is {state}; only failed jobs can be retried")]
    NotFailed { id: Uuid, state: JobState },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub queue: String,
    pub default_attempts: i32,
    pub default_priority: i32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            default_attempts: DEFAULT_ATTEMPTS,
            default_priority: DEFAULT_PRIORITY,
        }
    }
}

/// Client for one named queue. Constructed explicitly at startup, cloned
/// into whatever needs it, and closed at shutdown.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    settings: Arc<QueueSettings>,
    closed: Arc<AtomicBool>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, settings: QueueSettings) -> Self {
        Self {
            store,
            settings: Arc::new(settings),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn in_memory(settings: QueueSettings) -> Self {
        Self::new(Arc::new(InMemoryJobStore::new()), settings)
    }

    pub fn name(&self) -> &str {
        &self.settings.queue
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    pub async fn enqueue(&self, req: JobRequest) -> Result<JobHandle, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let new = self.validate(req)?;
        let job = self.store.insert(new).await?;

        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = job.priority,
            run_at = %job.run_at,
            "job enqueued"
        );
        Ok(JobHandle::from(&job))
    }

    pub async fn enqueue_delayed(&self, req: JobRequest, delay: Duration) -> Result<JobHandle, QueueError> {
        self.enqueue(req.delay(delay)).await
    }

    fn validate(&self, req: JobRequest) -> Result<NewJob, QueueError> {
        if req.job_type.trim().is_empty() {
            return Err(QueueError::InvalidJob("type is required".into()));
        }
        let max_attempts = req.attempts.unwrap_or(self.settings.default_attempts);
        if max_attempts < 1 {
            return Err(QueueError::InvalidJob(format!("attempts must be >= 1, got {max_attempts}")));
        }
        let delay_ms = req.delay.unwrap_or(0);
        if delay_ms < 0 {
            return Err(QueueError::InvalidJob(format!("delay must be >= 0, got {delay_ms}")));
        }
        let run_at = Utc::now()
            .checked_add_signed(chrono::Duration::milliseconds(delay_ms))
            .ok_or_else(|| QueueError::InvalidJob(format!("delay {delay_ms}ms is out of range")))?;

        Ok(NewJob {
            queue: self.settings.queue.clone(),
            job_type: req.job_type,
            payload: req.payload,
            metadata: req.metadata.unwrap_or_else(|| json!({})),
            priority: req.priority.unwrap_or(self.settings.default_priority),
            max_attempts,
            run_at,
        })
    }

    pub async fn get(&self, id: Uuid) -> Result<Job, QueueError> {
        self.store.get(id).await?.ok_or(QueueError::NotFound(id))
    }

    /// Newest waiting, delayed or active job whose payload contains `filter`.
    pub async fn find_live(&self, filter: &Value) -> Result<Option<Job>, QueueError> {
        Ok(self.store.find_live(filter).await?)
    }

    pub async fn get_status(&self, id: Uuid) -> Result<JobState, QueueError> {
        Ok(self.get(id).await?.state())
    }

    /// Puts a failed job back in line with a fresh attempt budget.
    pub async fn retry(&self, id: Uuid) -> Result<JobHandle, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        if let Some(job) = self.store.retry_failed(id).await? {
            info!(job_id = %id, "failed job requeued");
            return Ok(JobHandle::from(&job));
        }

        let job = self.get(id).await?;
        Err(QueueError::NotFailed { id, state: job.state() })
    }

    pub async fn lease(&self, worker_id: &str, lease: Duration, limit: usize) -> Result<Vec<Job>, QueueError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Ok(self.store.lease(&self.settings.queue, worker_id, lease, limit).await?)
    }

    pub async fn reap_expired(&self) -> Result<ReapOutcome, QueueError> {
        let outcome = self.store.reap_expired(&self.settings.queue).await?;
        if !outcome.is_empty() {
            warn!(
                requeued = outcome.requeued.len(),
                exhausted = outcome.exhausted.len(),
                "reaped expired leases"
            );
        }
        Ok(outcome)
    }

    /// Deletes completed and failed jobs that finished more than
    /// `older_than` ago.
    pub async fn drain_terminal(&self, older_than: Duration) -> Result<u64, QueueError> {
        let removed = self
            .store
            .delete_terminal_before(&self.settings.queue, cutoff(Utc::now(), older_than))
            .await?;
        if removed > 0 {
            info!(removed, "drained terminal jobs");
        }
        Ok(removed)
    }

    pub async fn apply_retention(&self, retention: &Retention) -> Result<u64, QueueError> {
        let pruned = self
            .store
            .prune(&self.settings.queue, retention.keep_completed, retention.keep_failed)
            .await?;
        if pruned > 0 {
            info!(pruned, "pruned terminal jobs past retention");
        }
        Ok(pruned)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(self.store.stats(&self.settings.queue).await?)
    }

    /// Stops accepting new work. Reads, leasing and acks keep working so
    /// in-flight jobs can finish.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(queue = %self.settings.queue, "queue closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
