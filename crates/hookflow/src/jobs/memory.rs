use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::jobs::model::{FailureReason, Job, JobStatus, NewJob, QueueStats};
use crate::jobs::store::{JobStore, ReapOutcome};

struct Entry {
    seq: u64,
    job: Job,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    jobs: HashMap<Uuid, Entry>,
}

impl Inner {
    /// The job, if `worker_id` still holds its lease.
    fn leased_by(&mut self, id: Uuid, worker_id: &str) -> Option<&mut Job> {
        self.jobs
            .get_mut(&id)
            .map(|e| &mut e.job)
            .filter(|j| j.status == JobStatus::Running && j.locked_by.as_deref() == Some(worker_id))
    }
}

fn release(job: &mut Job, now: DateTime<Utc>) {
    job.locked_by = None;
    job.locked_at = None;
    job.lock_expires_at = None;
    job.updated_at = now;
}

/// jsonb `@>`: every key of an object `needle` is contained in `haystack`,
/// arrays match element-wise by containment, scalars by equality.
fn json_contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Object(h), Value::Object(n)) => n
            .iter()
            .all(|(k, v)| h.get(k).is_some_and(|hv| json_contains(hv, v))),
        (Value::Array(h), Value::Array(n)) => n.iter().all(|v| h.iter().any(|hv| json_contains(hv, v))),
        _ => haystack == needle,
    }
}

pub(crate) fn lease_span(lease: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(1))
}

/// Single-process [`JobStore`]. Same semantics as the Postgres store, minus
/// durability across restarts.
#[derive(Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: NewJob) -> anyhow::Result<Job> {
        let mut inner = self.inner.lock().await;
        let job = job.into_job(Utc::now());
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(job.id, Entry { seq, job: job.clone() });
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        Ok(self.inner.lock().await.jobs.get(&id).map(|e| e.job.clone()))
    }

    async fn find_live(&self, filter: &Value) -> anyhow::Result<Option<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|e| {
                let j = &e.job;
                matches!(j.status, JobStatus::Queued | JobStatus::Running) && json_contains(&j.payload, filter)
            })
            .max_by_key(|e| e.seq)
            .map(|e| e.job.clone()))
    }

    async fn lease(&self, queue: &str, worker_id: &str, lease: Duration, limit: i64) -> anyhow::Result<Vec<Job>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let mut ready: Vec<(i32, DateTime<Utc>, u64, Uuid)> = inner
            .jobs
            .values()
            .filter(|e| e.job.queue == queue && e.job.status == JobStatus::Queued && e.job.run_at <= now)
            .map(|e| (e.job.priority, e.job.created_at, e.seq, e.job.id))
            .collect();
        ready.sort();
        ready.truncate(limit.max(0) as usize);

        let mut leased = Vec::with_capacity(ready.len());
        for (_, _, _, id) in ready {
            if let Some(entry) = inner.jobs.get_mut(&id) {
                let job = &mut entry.job;
                job.status = JobStatus::Running;
                job.locked_by = Some(worker_id.to_string());
                job.locked_at = Some(now);
                job.lock_expires_at = Some(now + lease_span(lease));
                job.attempts_made += 1;
                job.updated_at = now;
                leased.push(job.clone());
            }
        }
        Ok(leased)
    }

    async fn complete(&self, id: Uuid, worker_id: &str) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.leased_by(id, worker_id) else {
            return Ok(false);
        };
        let now = Utc::now();
        job.status = JobStatus::Completed;
        job.finished_at = Some(now);
        release(job, now);
        Ok(true)
    }

    async fn reschedule(&self, id: Uuid, worker_id: &str, run_at: DateTime<Utc>, error: &str) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.leased_by(id, worker_id) else {
            return Ok(false);
        };
        job.status = JobStatus::Queued;
        job.run_at = run_at;
        job.last_error = Some(error.to_string());
        release(job, Utc::now());
        Ok(true)
    }

    async fn fail(&self, id: Uuid, worker_id: &str, reason: FailureReason, error: &str) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.leased_by(id, worker_id) else {
            return Ok(false);
        };
        let now = Utc::now();
        job.status = JobStatus::Failed;
        job.failure_reason = Some(reason);
        job.last_error = Some(error.to_string());
        job.finished_at = Some(now);
        release(job, now);
        Ok(true)
    }

    async fn reap_expired(&self, queue: &str) -> anyhow::Result<ReapOutcome> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut out = ReapOutcome::default();

        for entry in inner.jobs.values_mut() {
            let job = &mut entry.job;
            let expired = job.queue == queue
                && job.status == JobStatus::Running
                && job.lock_expires_at.is_some_and(|t| t < now);
            if !expired {
                continue;
            }

            job.last_error = Some("lease expired".to_string());
            release(job, now);
            if job.has_attempts_left() {
                job.status = JobStatus::Queued;
                job.run_at = now;
                out.requeued.push(job.clone());
            } else {
                job.status = JobStatus::Failed;
                job.failure_reason = Some(FailureReason::Stalled);
                job.finished_at = Some(now);
                out.exhausted.push(job.clone());
            }
        }
        Ok(out)
    }

    async fn retry_failed(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner
            .jobs
            .get_mut(&id)
            .map(|e| &mut e.job)
            .filter(|j| j.status == JobStatus::Failed)
        else {
            return Ok(None);
        };

        let now = Utc::now();
        job.status = JobStatus::Queued;
        job.attempts_made = 0;
        job.run_at = now;
        job.failure_reason = None;
        job.last_error = None;
        job.finished_at = None;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn stats(&self, queue: &str) -> anyhow::Result<QueueStats> {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        let mut stats = QueueStats::default();

        for job in inner.jobs.values().map(|e| &e.job).filter(|j| j.queue == queue) {
            match job.status {
                JobStatus::Queued if job.run_at > now => stats.delayed += 1,
                JobStatus::Queued => stats.waiting += 1,
                JobStatus::Running => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn prune(&self, queue: &str, keep_completed: i64, keep_failed: i64) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut doomed = Vec::new();

        for (status, keep) in [(JobStatus::Completed, keep_completed), (JobStatus::Failed, keep_failed)] {
            let mut terminal: Vec<(Option<DateTime<Utc>>, u64, Uuid)> = inner
                .jobs
                .values()
                .filter(|e| e.job.queue == queue && e.job.status == status)
                .map(|e| (e.job.finished_at, e.seq, e.job.id))
                .collect();
            // newest first
            terminal.sort_by(|a, b| b.cmp(a));
            doomed.extend(terminal.into_iter().skip(keep.max(0) as usize).map(|(_, _, id)| id));
        }

        for id in &doomed {
            inner.jobs.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn delete_terminal_before(&self, queue: &str, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.jobs.len();
        inner.jobs.retain(|_, e| {
            let j = &e.job;
            !(j.queue == queue && j.status.is_terminal() && j.finished_at.is_some_and(|t| t < cutoff))
        });
        Ok((before - inner.jobs.len()) as u64)
    }
}
