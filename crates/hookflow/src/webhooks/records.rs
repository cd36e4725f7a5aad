use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::webhooks::memory::InMemoryWebhookStore;
use crate::webhooks::model::{NewWebhookRecord, WebhookRecord, WebhookStatus};
use crate::webhooks::store::{InsertOutcome, WebhookStore};

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("webhook record {0} not found")]
    NotFound(Uuid),
    #[error("webhook record {id} cannot move from {from} to {to}")]
    Illegal {
        id: Uuid,
        from: WebhookStatus,
        to: WebhookStatus,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// What `begin_processing` found.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// First delivery: `PENDING -> PROCESSING`.
    Started(WebhookRecord),
    /// Redelivery after a retry or a stalled lease; already `PROCESSING`.
    Resumed(WebhookRecord),
    /// A previous attempt finished the work; nothing left to do.
    AlreadyCompleted(WebhookRecord),
}

enum Cas {
    Moved(WebhookRecord),
    Rejected(WebhookRecord),
}

/// State machine over a [`WebhookStore`]. Every write names the statuses it
/// may leave from, so the sequence a record goes through is always one of
/// `PENDING, PROCESSING, COMPLETED` or `PENDING, PROCESSING, FAILED`, with
/// `FAILED -> PENDING` only through [`WebhookRecords::reset_for_retry`].
#[derive(Clone)]
pub struct WebhookRecords {
    store: Arc<dyn WebhookStore>,
}

impl WebhookRecords {
    pub fn new(store: Arc<dyn WebhookStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryWebhookStore::new()))
    }

    pub async fn create(&self, new: NewWebhookRecord) -> anyhow::Result<InsertOutcome> {
        self.store.insert(new).await
    }

    pub async fn get(&self, id: Uuid) -> anyhow::Result<Option<WebhookRecord>> {
        self.store.get(id).await
    }

    pub async fn list_by_status(&self, status: WebhookStatus, limit: i64) -> anyhow::Result<Vec<WebhookRecord>> {
        self.store.list_by_status(status, limit).await
    }

    async fn cas(&self, id: Uuid, to: WebhookStatus) -> Result<Cas, TransitionError> {
        if let Some(moved) = self.store.set_status(id, to.predecessors(), to).await? {
            debug!(record_id = %id, status = %to, "webhook record transitioned");
            return Ok(Cas::Moved(moved));
        }
        let current = self.store.get(id).await?.ok_or(TransitionError::NotFound(id))?;
        Ok(Cas::Rejected(current))
    }

    pub async fn begin_processing(&self, id: Uuid) -> Result<BeginOutcome, TransitionError> {
        match self.cas(id, WebhookStatus::Processing).await? {
            Cas::Moved(r) => Ok(BeginOutcome::Started(r)),
            Cas::Rejected(r) => match r.status {
                WebhookStatus::Processing => Ok(BeginOutcome::Resumed(r)),
                WebhookStatus::Completed => Ok(BeginOutcome::AlreadyCompleted(r)),
                from => Err(TransitionError::Illegal {
                    id,
                    from,
                    to: WebhookStatus::Processing,
                }),
            },
        }
    }

    /// `PROCESSING -> COMPLETED`. Completing twice is a no-op.
    pub async fn complete(&self, id: Uuid) -> Result<WebhookRecord, TransitionError> {
        match self.cas(id, WebhookStatus::Completed).await? {
            Cas::Moved(r) => Ok(r),
            Cas::Rejected(r) if r.status == WebhookStatus::Completed => Ok(r),
            Cas::Rejected(r) => Err(TransitionError::Illegal {
                id,
                from: r.status,
                to: WebhookStatus::Completed,
            }),
        }
    }

    /// Terminal failure. A record that never left `PENDING` (the job died
    /// before its first delivery) is walked through `PROCESSING` so no state
    /// is skipped. Failing twice is a no-op.
    pub async fn fail(&self, id: Uuid) -> Result<WebhookRecord, TransitionError> {
        let rejected = match self.cas(id, WebhookStatus::Failed).await? {
            Cas::Moved(r) => return Ok(r),
            Cas::Rejected(r) => r,
        };

        match rejected.status {
            WebhookStatus::Failed => Ok(rejected),
            WebhookStatus::Pending => {
                self.begin_processing(id).await?;
                match self.cas(id, WebhookStatus::Failed).await? {
                    Cas::Moved(r) => Ok(r),
                    Cas::Rejected(r) if r.status == WebhookStatus::Failed => Ok(r),
                    Cas::Rejected(r) => Err(TransitionError::Illegal {
                        id,
                        from: r.status,
                        to: WebhookStatus::Failed,
                    }),
                }
            }
            from => Err(TransitionError::Illegal {
                id,
                from,
                to: WebhookStatus::Failed,
            }),
        }
    }

    /// Explicit operator retry: `FAILED -> PENDING`.
    pub async fn reset_for_retry(&self, id: Uuid) -> Result<WebhookRecord, TransitionError> {
        match self.cas(id, WebhookStatus::Pending).await? {
            Cas::Moved(r) => Ok(r),
            Cas::Rejected(r) => Err(TransitionError::Illegal {
                id,
                from: r.status,
                to: WebhookStatus::Pending,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhooks::model::Category;
    use crate::webhooks::platform::Platform;
    use serde_json::json;

    fn new_record(hash: &str) -> NewWebhookRecord {
        NewWebhookRecord {
            platform: Platform::BigCommerce,
            producer: "stores/abc".into(),
            hash: hash.into(),
            store_id: "1".into(),
            scope: "store/order/created".into(),
            data: json!({}),
            category: Category::B2c,
        }
    }

    async fn created(records: &WebhookRecords, hash: &str) -> WebhookRecord {
        match records.create(new_record(hash)).await.unwrap() {
            InsertOutcome::Created(r) => r,
            other => panic!("expected created, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_key_returns_existing_record() {
        let records = WebhookRecords::in_memory();
        let first = created(&records, "h1").await;

        let second = records.create(new_record("h1")).await.unwrap();
        assert_eq!(second, InsertOutcome::Duplicate(first));
    }

    #[tokio::test]
    async fn happy_path_and_redelivery() {
        let records = WebhookRecords::in_memory();
        let r = created(&records, "h1").await;

        assert!(matches!(records.begin_processing(r.id).await.unwrap(), BeginOutcome::Started(_)));
        assert!(matches!(records.begin_processing(r.id).await.unwrap(), BeginOutcome::Resumed(_)));

        let done = records.complete(r.id).await.unwrap();
        assert_eq!(done.status, WebhookStatus::Completed);
        assert!(matches!(
            records.begin_processing(r.id).await.unwrap(),
            BeginOutcome::AlreadyCompleted(_)
        ));
    }

    #[tokio::test]
    async fn completed_record_cannot_go_back_to_pending() {
        let records = WebhookRecords::in_memory();
        let r = created(&records, "h1").await;
        records.begin_processing(r.id).await.unwrap();
        records.complete(r.id).await.unwrap();

        let err = records.reset_for_retry(r.id).await.unwrap_err();
        assert!(matches!(
            err,
            TransitionError::Illegal { from: WebhookStatus::Completed, to: WebhookStatus::Pending, .. }
        ));
        assert!(records.fail(r.id).await.is_err());
    }

    #[tokio::test]
    async fn fail_from_pending_passes_through_processing_then_retry_resets() {
        let records = WebhookRecords::in_memory();
        let r = created(&records, "h1").await;

        let failed = records.fail(r.id).await.unwrap();
        assert_eq!(failed.status, WebhookStatus::Failed);

        let reset = records.reset_for_retry(r.id).await.unwrap();
        assert_eq!(reset.status, WebhookStatus::Pending);
    }

    #[tokio::test]
    async fn unknown_record_is_not_found() {
        let records = WebhookRecords::in_memory();
        let err = records.complete(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, TransitionError::NotFound(_)));
    }
}
