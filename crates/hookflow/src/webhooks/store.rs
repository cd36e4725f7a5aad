use async_trait::async_trait;
use uuid::Uuid;

use crate::webhooks::model::{NewWebhookRecord, WebhookRecord, WebhookStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Created(WebhookRecord),
    /// A record with the same `producer` + `hash` already exists; it is
    /// returned unchanged.
    Duplicate(WebhookRecord),
}

impl InsertOutcome {
    pub fn record(&self) -> &WebhookRecord {
        match self {
            InsertOutcome::Created(r) | InsertOutcome::Duplicate(r) => r,
        }
    }
}

/// Persistence for webhook records. Status writes are compare-and-set so
/// concurrent workers cannot produce a non-monotonic sequence.
#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn insert(&self, new: NewWebhookRecord) -> anyhow::Result<InsertOutcome>;

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<WebhookRecord>>;

    /// Moves `id` to `to` only if its current status is one of `from`.
    /// Returns the updated record, or `None` when nothing matched.
    async fn set_status(
        &self,
        id: Uuid,
        from: &[WebhookStatus],
        to: WebhookStatus,
    ) -> anyhow::Result<Option<WebhookRecord>>;

    async fn list_by_status(&self, status: WebhookStatus, limit: i64) -> anyhow::Result<Vec<WebhookRecord>>;
}
