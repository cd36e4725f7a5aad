use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::webhooks::platform::Platform;

/// Processing status of a webhook record.
///
/// Moves forward only: `PENDING -> PROCESSING -> COMPLETED | FAILED`.
/// `FAILED -> PENDING` is reserved for an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Pending => "PENDING",
            WebhookStatus::Processing => "PROCESSING",
            WebhookStatus::Completed => "COMPLETED",
            WebhookStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WebhookStatus::Completed | WebhookStatus::Failed)
    }

    /// The only statuses a record may be in right before entering `self`.
    pub fn predecessors(&self) -> &'static [WebhookStatus] {
        match self {
            WebhookStatus::Pending => &[WebhookStatus::Failed],
            WebhookStatus::Processing => &[WebhookStatus::Pending],
            WebhookStatus::Completed | WebhookStatus::Failed => &[WebhookStatus::Processing],
        }
    }

    pub fn can_transition_to(&self, next: WebhookStatus) -> bool {
        next.predecessors().contains(self)
    }
}

impl fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(WebhookStatus::Pending),
            "PROCESSING" => Ok(WebhookStatus::Processing),
            "COMPLETED" => Ok(WebhookStatus::Completed),
            "FAILED" => Ok(WebhookStatus::Failed),
            other => anyhow::bail!("unknown webhook status: {other}"),
        }
    }
}

/// Which integration variant produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    B2c,
    B2b,
    Erp,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::B2c => "b2c",
            Category::B2b => "b2b",
            Category::Erp => "erp",
        }
    }
}

impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "b2c" => Ok(Category::B2c),
            "b2b" => Ok(Category::B2b),
            "erp" => Ok(Category::Erp),
            other => anyhow::bail!("unknown category: {other}"),
        }
    }
}

/// Durable evidence of an accepted webhook. `producer` + `hash` is the
/// idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookRecord {
    pub id: Uuid,
    pub platform: Platform,
    pub producer: String,
    pub hash: String,
    pub store_id: String,
    pub scope: String,
    pub data: Value,
    pub category: Category,
    pub status: WebhookStatus,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewWebhookRecord {
    pub platform: Platform,
    pub producer: String,
    pub hash: String,
    pub store_id: String,
    pub scope: String,
    pub data: Value,
    pub category: Category,
}

impl NewWebhookRecord {
    /// Materializes a fresh record in `PENDING`.
    pub fn into_record(self, now: DateTime<Utc>) -> WebhookRecord {
        WebhookRecord {
            id: Uuid::new_v4(),
            platform: self.platform,
            producer: self.producer,
            hash: self.hash,
            store_id: self.store_id,
            scope: self.scope,
            data: self.data,
            category: self.category,
            status: WebhookStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}
