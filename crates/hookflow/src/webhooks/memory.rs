use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::webhooks::model::{NewWebhookRecord, WebhookRecord, WebhookStatus};
use crate::webhooks::store::{InsertOutcome, WebhookStore};

#[derive(Default)]
struct Inner {
    records: HashMap<Uuid, WebhookRecord>,
    by_key: HashMap<(String, String), Uuid>,
}

/// Single-process record store for tests and local runs.
#[derive(Default)]
pub struct InMemoryWebhookStore {
    inner: Mutex<Inner>,
}

impl InMemoryWebhookStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookStore for InMemoryWebhookStore {
    async fn insert(&self, new: NewWebhookRecord) -> anyhow::Result<InsertOutcome> {
        let mut inner = self.inner.lock().await;
        let key = (new.producer.clone(), new.hash.clone());

        if let Some(existing) = inner.by_key.get(&key).and_then(|id| inner.records.get(id)) {
            return Ok(InsertOutcome::Duplicate(existing.clone()));
        }

        let record = new.into_record(Utc::now());
        inner.by_key.insert(key, record.id);
        inner.records.insert(record.id, record.clone());
        Ok(InsertOutcome::Created(record))
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<WebhookRecord>> {
        Ok(self.inner.lock().await.records.get(&id).cloned())
    }

    async fn set_status(
        &self,
        id: Uuid,
        from: &[WebhookStatus],
        to: WebhookStatus,
    ) -> anyhow::Result<Option<WebhookRecord>> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.records.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&record.status) {
            return Ok(None);
        }

        record.status = to;
        record.updated_at = Utc::now();
        Ok(Some(record.clone()))
    }

    async fn list_by_status(&self, status: WebhookStatus, limit: i64) -> anyhow::Result<Vec<WebhookRecord>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<WebhookRecord> = inner
            .records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }
}
