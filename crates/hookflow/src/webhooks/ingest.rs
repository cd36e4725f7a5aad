//! Webhook intake: authenticate, parse, record, enqueue.
//!
//! The HTTP layer only maps [`IngestError`] to a status code; everything the
//! sender can observe is decided here.

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::jobs::model::{JobHandle, JobRequest, JobState};
use crate::jobs::queue::{JobQueue, QueueError};
use crate::webhooks::model::{WebhookRecord, WebhookStatus};
use crate::webhooks::payload::{PayloadError, PlatformEvent, WebhookJob};
use crate::webhooks::records::{TransitionError, WebhookRecords};
use crate::webhooks::signature::{AuthError, SignatureVerifier};
use crate::webhooks::store::InsertOutcome;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("webhook record {0} not found")]
    RecordNotFound(Uuid),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IngestError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            IngestError::Auth(e) if e.is_server_error() => StatusCode::INTERNAL_SERVER_ERROR,
            IngestError::Auth(_) => StatusCode::UNAUTHORIZED,
            IngestError::Payload(_) => StatusCode::BAD_REQUEST,
            IngestError::RecordNotFound(_)
            | IngestError::Queue(QueueError::NotFound(_))
            | IngestError::Transition(TransitionError::NotFound(_)) => StatusCode::NOT_FOUND,
            IngestError::Queue(QueueError::NotFailed { .. })
            | IngestError::Transition(TransitionError::Illegal { .. }) => StatusCode::CONFLICT,
            IngestError::Queue(QueueError::Closed) => StatusCode::SERVICE_UNAVAILABLE,
            IngestError::Queue(QueueError::InvalidJob(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result of an accepted delivery.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub record: WebhookRecord,
    /// `None` for an ignored duplicate: the original record's job already
    /// covers it.
    pub job: Option<JobHandle>,
    /// Same `(producer, hash)` as an earlier delivery and nothing enqueued.
    pub duplicate: bool,
}

#[derive(Clone)]
pub struct IngestService {
    verifier: Arc<SignatureVerifier>,
    records: WebhookRecords,
    queue: JobQueue,
    job_priority: i32,
}

impl IngestService {
    pub fn new(verifier: SignatureVerifier, records: WebhookRecords, queue: JobQueue, job_priority: i32) -> Self {
        Self {
            verifier: Arc::new(verifier),
            records,
            queue,
            job_priority,
        }
    }

    pub fn records(&self) -> &WebhookRecords {
        &self.records
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Handles one delivery to `/webhooks/{platform}`. Nothing is written
    /// unless the request authenticates and its body parses.
    pub async fn accept(&self, platform: &str, headers: &HeaderMap, body: &[u8]) -> Result<Accepted, IngestError> {
        let platform = self.verifier.verify(platform, headers, body)?;
        let parsed = PlatformEvent::parse(platform, body)?;

        let record = match self.records.create(parsed.record).await? {
            InsertOutcome::Created(record) => record,
            InsertOutcome::Duplicate(record) => return self.redelivered(record, parsed.event).await,
        };

        let job = self.enqueue_for(&record, parsed.event).await?;
        info!(
            record_id = %record.id,
            job_id = %job.id,
            platform = %platform,
            scope = %record.scope,
            "webhook accepted"
        );

        Ok(Accepted {
            record,
            job: Some(job),
            duplicate: false,
        })
    }

    /// Moves a failed record back to `PENDING` and enqueues a fresh job for
    /// it.
    pub async fn retry_webhook(&self, record_id: Uuid) -> Result<JobHandle, IngestError> {
        let record = self
            .records
            .get(record_id)
            .await?
            .ok_or(IngestError::RecordNotFound(record_id))?;
        let event = PlatformEvent::from_record(&record)?;

        let record = self.records.reset_for_retry(record.id).await?;
        let job = self.enqueue_for(&record, event).await?;
        info!(record_id = %record.id, job_id = %job.id, "webhook requeued");
        Ok(job)
    }

    /// Requeues a failed job. Its record, if it ended `FAILED`, goes back
    /// to `PENDING` first so the next attempt can move it forward; if the
    /// requeue is refused the record is failed again.
    pub async fn retry_job(&self, job_id: Uuid) -> Result<JobHandle, IngestError> {
        let job = self.queue.get(job_id).await?;
        let state = job.state();
        if state != JobState::Failed {
            return Err(QueueError::NotFailed { id: job_id, state }.into());
        }

        let mut reset = None;
        if let Some(record_id) = WebhookJob::record_id_of(&job.payload) {
            match self.records.reset_for_retry(record_id).await {
                Ok(_) => reset = Some(record_id),
                Err(TransitionError::Illegal { .. }) | Err(TransitionError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        match self.queue.retry(job_id).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                if let Some(record_id) = reset {
                    error!(job_id = %job_id, record_id = %record_id, error = %err, "job retry refused; failing record again");
                    self.refail(record_id).await;
                }
                Err(err.into())
            }
        }
    }

    /// A `(producer, hash)` seen before. It is ignored unless the earlier
    /// delivery left nothing to run it: a `FAILED` record, or a `PENDING`
    /// one with no live job, goes back in line.
    async fn redelivered(&self, record: WebhookRecord, event: PlatformEvent) -> Result<Accepted, IngestError> {
        let requeue = match record.status {
            WebhookStatus::Failed => true,
            WebhookStatus::Pending => self
                .queue
                .find_live(&WebhookJob::filter_for(record.id))
                .await?
                .is_none(),
            WebhookStatus::Processing | WebhookStatus::Completed => false,
        };
        if !requeue {
            info!(
                record_id = %record.id,
                producer = %record.producer,
                hash = %record.hash,
                status = %record.status,
                "duplicate webhook ignored"
            );
            return Ok(Accepted {
                record,
                job: None,
                duplicate: true,
            });
        }

        let record = if record.status == WebhookStatus::Failed {
            match self.records.reset_for_retry(record.id).await {
                Ok(reset) => reset,
                // another redelivery already reset it
                Err(TransitionError::Illegal { .. }) => {
                    return Ok(Accepted {
                        record,
                        job: None,
                        duplicate: true,
                    })
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            record
        };

        let job = self.enqueue_for(&record, event).await?;
        warn!(record_id = %record.id, job_id = %job.id, "redelivered webhook had no live job; requeued");
        Ok(Accepted {
            record,
            job: Some(job),
            duplicate: false,
        })
    }

    async fn refail(&self, record_id: Uuid) {
        if let Err(e) = self.records.fail(record_id).await {
            error!(record_id = %record_id, error = %e, "could not mark webhook record failed");
        }
    }

    async fn enqueue_for(&self, record: &WebhookRecord, event: PlatformEvent) -> Result<JobHandle, IngestError> {
        let platform = event.platform();
        let metadata = json!({
            "platform": platform.as_str(),
            "scope": event.scope(),
            "receivedAt": Utc::now(),
        });
        let payload = serde_json::to_value(WebhookJob {
            record_id: record.id,
            event,
        })
        .map_err(anyhow::Error::from)?;

        let req = JobRequest::new(platform.job_type(), payload)
            .priority(self.job_priority)
            .metadata(metadata);

        match self.queue.enqueue(req).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                // every PENDING record must have a job behind it
                error!(record_id = %record.id, error = %err, "enqueue failed; marking record failed");
                self.refail(record.id).await;
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::FailureReason;
    use crate::jobs::queue::QueueSettings;
    use crate::jobs::store::JobStore;
    use crate::webhooks::platform::Platform;
    use crate::webhooks::signature::PlatformAuth;
    use axum::http::HeaderValue;

    fn service() -> IngestService {
        let verifier = SignatureVerifier::new()
            .with_platform(Platform::BigCommerce, PlatformAuth::shared_secret("s3cret"))
            .with_platform(Platform::Acumatica, PlatformAuth::shared_secret("acu"));
        IngestService::new(
            verifier,
            WebhookRecords::in_memory(),
            JobQueue::in_memory(QueueSettings::default()),
            5,
        )
    }

    fn bc_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-bc-secret-key", HeaderValue::from_static("s3cret"));
        headers
    }

    const ORDER: &[u8] = br#"{"store_id":"1001","producer":"stores/abc","scope":"store/order/created","hash":"h1","data":{"id":7}}"#;

    #[tokio::test]
    async fn accepted_webhook_is_recorded_and_enqueued() {
        let svc = service();
        let accepted = svc.accept("bigcommerce", &bc_headers(), ORDER).await.unwrap();

        assert!(!accepted.duplicate);
        assert_eq!(accepted.record.status, WebhookStatus::Pending);
        let handle = accepted.job.unwrap();
        assert_eq!(handle.job_type, "bigcommerce");
        assert_eq!(handle.priority, 5);

        let job = svc.queue().get(handle.id).await.unwrap();
        assert_eq!(WebhookJob::record_id_of(&job.payload), Some(accepted.record.id));
        assert_eq!(job.metadata["scope"], "store/order/created");
        assert_eq!(job.metadata["platform"], "bigcommerce");
    }

    #[tokio::test]
    async fn duplicate_delivery_creates_no_second_job() {
        let svc = service();
        let first = svc.accept("bigcommerce", &bc_headers(), ORDER).await.unwrap();
        let second = svc.accept("bigcommerce", &bc_headers(), ORDER).await.unwrap();

        assert!(second.duplicate);
        assert!(second.job.is_none());
        assert_eq!(second.record.id, first.record.id);
        assert_eq!(svc.queue().stats().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn rejected_requests_write_nothing() {
        let svc = service();

        let err = svc.accept("bigcommerce", &HeaderMap::new(), ORDER).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);

        let err = svc
            .accept("bigcommerce", &bc_headers(), br#"{"store_id":"1"}"#)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err = svc.accept("b2b-bigcommerce", &bc_headers(), ORDER).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        assert_eq!(svc.queue().stats().await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn closed_queue_fails_the_record() {
        let svc = service();
        svc.queue().close();

        let err = svc.accept("bigcommerce", &bc_headers(), ORDER).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let failed = svc.records().list_by_status(WebhookStatus::Failed, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn retry_webhook_requires_a_failed_record() {
        let svc = service();
        let accepted = svc.accept("bigcommerce", &bc_headers(), ORDER).await.unwrap();

        let err = svc.retry_webhook(accepted.record.id).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);

        let err = svc.retry_webhook(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        svc.records().fail(accepted.record.id).await.unwrap();
        let handle = svc.retry_webhook(accepted.record.id).await.unwrap();
        assert_ne!(Some(handle.id), accepted.job.map(|j| j.id));

        let record = svc.records().get(accepted.record.id).await.unwrap().unwrap();
        assert_eq!(record.status, WebhookStatus::Pending);
    }

    #[tokio::test]
    async fn redelivery_after_failed_enqueue_is_requeued() {
        let records = WebhookRecords::in_memory();
        let verifier =
            || SignatureVerifier::new().with_platform(Platform::BigCommerce, PlatformAuth::shared_secret("s3cret"));
        let closed = IngestService::new(verifier(), records.clone(), JobQueue::in_memory(QueueSettings::default()), 5);
        closed.queue().close();
        let healthy = IngestService::new(verifier(), records.clone(), JobQueue::in_memory(QueueSettings::default()), 5);

        let err = closed.accept("bigcommerce", &bc_headers(), ORDER).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let again = healthy.accept("bigcommerce", &bc_headers(), ORDER).await.unwrap();
        assert!(!again.duplicate);
        assert_eq!(again.record.status, WebhookStatus::Pending);
        let job = healthy.queue().get(again.job.unwrap().id).await.unwrap();
        assert_eq!(WebhookJob::record_id_of(&job.payload), Some(again.record.id));
        assert_eq!(healthy.queue().stats().await.unwrap().waiting, 1);

        // the record now has a live job, so the next copy is ignored
        let third = healthy.accept("bigcommerce", &bc_headers(), ORDER).await.unwrap();
        assert!(third.duplicate);
        assert!(third.job.is_none());
        assert_eq!(healthy.queue().stats().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn redelivery_of_pending_record_without_job_is_requeued() {
        let svc = service();
        let parsed = PlatformEvent::parse(Platform::BigCommerce, ORDER).unwrap();
        let orphan = match svc.records().create(parsed.record).await.unwrap() {
            InsertOutcome::Created(r) => r,
            other => panic!("expected created, got {other:?}"),
        };

        let accepted = svc.accept("bigcommerce", &bc_headers(), ORDER).await.unwrap();
        assert!(!accepted.duplicate);
        assert_eq!(accepted.record.id, orphan.id);
        assert!(accepted.job.is_some());
        assert_eq!(svc.queue().stats().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn refused_job_retry_leaves_record_failed() {
        let svc = service();
        let accepted = svc.accept("bigcommerce", &bc_headers(), ORDER).await.unwrap();
        let job_id = accepted.job.unwrap().id;
        let record_id = accepted.record.id;

        svc.queue().lease("w1", std::time::Duration::from_secs(30), 1).await.unwrap();
        assert!(svc
            .queue()
            .store()
            .fail(job_id, "w1", FailureReason::NonRetryable, "boom")
            .await
            .unwrap());
        svc.records().fail(record_id).await.unwrap();

        svc.queue().close();
        let err = svc.retry_job(job_id).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let record = svc.records().get(record_id).await.unwrap().unwrap();
        assert_eq!(record.status, WebhookStatus::Failed);
        assert_eq!(svc.queue().get_status(job_id).await.unwrap(), JobState::Failed);
    }
}
