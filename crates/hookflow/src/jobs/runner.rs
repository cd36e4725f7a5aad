use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, SeedableRng};
use tracing::{error, info, warn};

use crate::jobs::dispatcher::DispatchError;
use crate::jobs::model::{FailureReason, Job};
use crate::jobs::retry::{next_delay, ErrorClass, RetryConfig};
use crate::jobs::store::{JobStore, ReapOutcome};
use crate::webhooks::model::WebhookStatus;
use crate::webhooks::payload::WebhookJob;
use crate::webhooks::records::{TransitionError, WebhookRecords};

#[derive(Debug, Clone, PartialEq)]
pub enum FailureDecision {
    Retry { run_at: DateTime<Utc>, delay: Duration },
    Failed { reason: FailureReason },
    /// Our lease was reaped while the handler ran; the job belongs to
    /// someone else now and nothing was written.
    LeaseLost,
}

/// Applies attempt outcomes to the job store and, on terminal failure, to
/// the webhook record.
#[derive(Clone)]
pub struct JobRunner {
    jobs: Arc<dyn JobStore>,
    records: WebhookRecords,
    retry_cfg: RetryConfig,
}

impl JobRunner {
    pub fn new(jobs: Arc<dyn JobStore>, records: WebhookRecords, retry_cfg: RetryConfig) -> Self {
        Self {
            jobs,
            records,
            retry_cfg,
        }
    }

    pub async fn on_success(&self, job: &Job, worker_id: &str) -> anyhow::Result<bool> {
        let acked = self.jobs.complete(job.id, worker_id).await?;
        if acked {
            info!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempts_made, "job completed");
        } else {
            warn!(job_id = %job.id, "lease lost before ack; completion not recorded");
        }
        Ok(acked)
    }

    pub async fn on_failure(&self, job: &Job, worker_id: &str, err: &DispatchError) -> anyhow::Result<FailureDecision> {
        let class = err.class();
        let can_retry = class == ErrorClass::Retryable && job.has_attempts_left();
        let message = err.to_string();

        if can_retry {
            let mut rng = StdRng::from_entropy();
            let delay = next_delay(job.attempts_made, &self.retry_cfg, &mut rng);
            let run_at = Utc::now() + chrono::Duration::from_std(delay)?;

            if !self.jobs.reschedule(job.id, worker_id, run_at, &message).await? {
                warn!(job_id = %job.id, "lease lost before retry was scheduled");
                return Ok(FailureDecision::LeaseLost);
            }
            info!(
                job_id = %job.id,
                attempt = job.attempts_made,
                max_attempts = job.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "job scheduled for retry"
            );
            return Ok(FailureDecision::Retry { run_at, delay });
        }

        let reason = match class {
            ErrorClass::NonRetryable => err.failure_reason(),
            ErrorClass::Retryable => FailureReason::MaxAttemptsExceeded,
        };

        if !self.jobs.fail(job.id, worker_id, reason, &message).await? {
            warn!(job_id = %job.id, "lease lost before failure was recorded");
            return Ok(FailureDecision::LeaseLost);
        }
        error!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts_made,
            reason = reason.as_str(),
            error = %message,
            "job failed"
        );
        self.fail_record(job).await;

        Ok(FailureDecision::Failed { reason })
    }

    /// Records of stalled jobs that ran out of attempts end `FAILED` too.
    pub async fn on_reaped(&self, outcome: &ReapOutcome) {
        for job in &outcome.exhausted {
            error!(job_id = %job.id, job_type = %job.job_type, "job stalled on its last attempt");
            self.fail_record(job).await;
        }
    }

    /// Fails `PROCESSING` records that no live job drives any more: the job
    /// ended `failed` but the record write was lost. Returns how many moved.
    pub async fn reconcile_records(&self, limit: i64) -> anyhow::Result<usize> {
        let mut moved = 0;
        for record in self.records.list_by_status(WebhookStatus::Processing, limit).await? {
            if self.jobs.find_live(&WebhookJob::filter_for(record.id)).await?.is_some() {
                continue;
            }
            match self.records.fail(record.id).await {
                Ok(_) => {
                    warn!(record_id = %record.id, "record left PROCESSING without a live job; marked failed");
                    moved += 1;
                }
                // completed since it was listed
                Err(TransitionError::Illegal { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(moved)
    }

    async fn fail_record(&self, job: &Job) {
        let Some(record_id) = WebhookJob::record_id_of(&job.payload) else {
            return;
        };
        if let Err(e) = self.records.fail(record_id).await {
            // reconcile_records picks it up on the next reap pass
            error!(job_id = %job.id, record_id = %record_id, error = %e, "could not mark webhook record failed");
        }
    }
}
