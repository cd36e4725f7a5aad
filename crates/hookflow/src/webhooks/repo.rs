use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::webhooks::model::{NewWebhookRecord, WebhookRecord, WebhookStatus};
use crate::webhooks::store::{InsertOutcome, WebhookStore};

const COLUMNS: &str = "id, platform, producer, hash, store_id, scope, data, category, status, created_at, updated_at";

#[derive(Debug, FromRow)]
struct WebhookRecordRow {
    id: Uuid,
    platform: String,
    producer: String,
    hash: String,
    store_id: String,
    scope: String,
    data: Value,
    category: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WebhookRecordRow> for WebhookRecord {
    type Error = anyhow::Error;

    fn try_from(row: WebhookRecordRow) -> Result<Self, Self::Error> {
        Ok(WebhookRecord {
            id: row.id,
            platform: row.platform.parse()?,
            producer: row.producer,
            hash: row.hash,
            store_id: row.store_id,
            scope: row.scope,
            data: row.data,
            category: row.category.parse()?,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Postgres-backed [`WebhookStore`].
#[derive(Clone)]
pub struct WebhookRecordsRepo {
    pool: PgPool,
}

impl WebhookRecordsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_by_key(&self, producer: &str, hash: &str) -> anyhow::Result<Option<WebhookRecord>> {
        let row = sqlx::query_as::<_, WebhookRecordRow>(&format!(
            "SELECT {COLUMNS} FROM webhook_records WHERE producer = $1 AND hash = $2"
        ))
        .bind(producer)
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WebhookRecord::try_from).transpose()
    }
}

#[async_trait]
impl WebhookStore for WebhookRecordsRepo {
    async fn insert(&self, new: NewWebhookRecord) -> anyhow::Result<InsertOutcome> {
        let row = sqlx::query_as::<_, WebhookRecordRow>(&format!(
            r#"
            INSERT INTO webhook_records
                (id, platform, producer, hash, store_id, scope, data, category, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (producer, hash) DO NOTHING
            RETURNING {COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.platform.as_str())
        .bind(&new.producer)
        .bind(&new.hash)
        .bind(&new.store_id)
        .bind(&new.scope)
        .bind(&new.data)
        .bind(new.category.as_str())
        .bind(WebhookStatus::Pending.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(InsertOutcome::Created(row.try_into()?));
        }

        // Lost the race to a concurrent insert of the same event.
        let existing = self
            .find_by_key(&new.producer, &new.hash)
            .await?
            .ok_or_else(|| anyhow::anyhow!("conflicting webhook record vanished"))?;
        Ok(InsertOutcome::Duplicate(existing))
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<WebhookRecord>> {
        let row = sqlx::query_as::<_, WebhookRecordRow>(&format!(
            "SELECT {COLUMNS} FROM webhook_records WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WebhookRecord::try_from).transpose()
    }

    async fn set_status(
        &self,
        id: Uuid,
        from: &[WebhookStatus],
        to: WebhookStatus,
    ) -> anyhow::Result<Option<WebhookRecord>> {
        let from: Vec<&str> = from.iter().map(WebhookStatus::as_str).collect();

        let row = sqlx::query_as::<_, WebhookRecordRow>(&format!(
            r#"
            UPDATE webhook_records
            SET status = $2, updated_at = now()
            WHERE id = $1 AND status = ANY($3)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(to.as_str())
        .bind(&from)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WebhookRecord::try_from).transpose()
    }

    async fn list_by_status(&self, status: WebhookStatus, limit: i64) -> anyhow::Result<Vec<WebhookRecord>> {
        let rows = sqlx::query_as::<_, WebhookRecordRow>(&format!(
            r#"
            SELECT {COLUMNS} FROM webhook_records
            WHERE status = $1
            ORDER BY created_at ASC
            LIMIT $2
            "#
        ))
        .bind(status.as_str())
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WebhookRecord::try_from).collect()
    }
}
