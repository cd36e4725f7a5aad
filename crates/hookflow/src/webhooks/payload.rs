use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::webhooks::model::{NewWebhookRecord, WebhookRecord};
use crate::webhooks::platform::Platform;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("body is not a JSON object: {0}")]
    Malformed(String),
    #[error("required field `{0}` is missing")]
    MissingField(&'static str),
}

/// BigCommerce (B2C and B2B) webhook body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BigCommerceEvent {
    pub store_id: String,
    pub producer: String,
    pub scope: String,
    pub hash: String,
    #[serde(default)]
    pub data: Value,
}

/// Acumatica push notification body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcumaticaEvent {
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// A validated inbound event, one variant per platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "platform")]
pub enum PlatformEvent {
    #[serde(rename = "bigcommerce")]
    BigCommerce(BigCommerceEvent),
    #[serde(rename = "b2b-bigcommerce")]
    B2bBigCommerce(BigCommerceEvent),
    #[serde(rename = "acumatica")]
    Acumatica(AcumaticaEvent),
}

/// Result of parsing a raw body: the typed event plus the record to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedWebhook {
    pub event: PlatformEvent,
    pub record: NewWebhookRecord,
}

impl PlatformEvent {
    /// Parses and validates a raw request body for `platform`.
    pub fn parse(platform: Platform, body: &[u8]) -> Result<ParsedWebhook, PayloadError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| PayloadError::Malformed(e.to_string()))?;
        let digest = body_digest(body);
        let event = Self::from_value(platform, &value, &digest)?;
        let record = event.new_record(value, &digest);
        Ok(ParsedWebhook { event, record })
    }

    /// Rebuilds the event from a stored record, for re-enqueueing a retried
    /// webhook.
    pub fn from_record(record: &WebhookRecord) -> Result<Self, PayloadError> {
        Self::from_value(record.platform, &record.data, &record.hash)
    }

    fn from_value(platform: Platform, value: &Value, fallback_hash: &str) -> Result<Self, PayloadError> {
        let obj = value
            .as_object()
            .ok_or_else(|| PayloadError::Malformed("expected an object".into()))?;

        match platform {
            Platform::BigCommerce => Ok(Self::BigCommerce(bigcommerce(obj, fallback_hash)?)),
            Platform::B2bBigCommerce => Ok(Self::B2bBigCommerce(bigcommerce(obj, fallback_hash)?)),
            Platform::Acumatica => Ok(Self::Acumatica(AcumaticaEvent {
                event_type: required_str(obj, "eventType")?,
                entity_type: optional_str(obj, "entityType"),
                tenant_id: optional_str(obj, "tenantId"),
                data: obj.get("data").cloned().unwrap_or(Value::Null),
            })),
        }
    }

    pub fn platform(&self) -> Platform {
        match self {
            Self::BigCommerce(_) => Platform::BigCommerce,
            Self::B2bBigCommerce(_) => Platform::B2bBigCommerce,
            Self::Acumatica(_) => Platform::Acumatica,
        }
    }

    /// BigCommerce scope or Acumatica event type.
    pub fn scope(&self) -> &str {
        match self {
            Self::BigCommerce(e) | Self::B2bBigCommerce(e) => &e.scope,
            Self::Acumatica(e) => &e.event_type,
        }
    }

    fn new_record(&self, data: Value, body_hash: &str) -> NewWebhookRecord {
        let platform = self.platform();
        let (producer, hash, store_id) = match self {
            Self::BigCommerce(e) | Self::B2bBigCommerce(e) => {
                (e.producer.clone(), e.hash.clone(), e.store_id.clone())
            }
            Self::Acumatica(e) => (
                "acumatica".to_string(),
                body_hash.to_string(),
                e.tenant_id.clone().unwrap_or_else(|| "default".to_string()),
            ),
        };

        NewWebhookRecord {
            platform,
            producer,
            hash,
            store_id,
            scope: self.scope().to_string(),
            data,
            category: platform.category(),
        }
    }
}

fn bigcommerce(obj: &Map<String, Value>, fallback_hash: &str) -> Result<BigCommerceEvent, PayloadError> {
    let scope = required_str(obj, "scope")?;
    // store_id arrives as a string or a bare number depending on the sender
    let store_id = match obj.get("store_id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(PayloadError::MissingField("store_id")),
    };
    let producer = optional_str(obj, "producer").unwrap_or_else(|| format!("stores/{store_id}"));
    let hash = optional_str(obj, "hash").unwrap_or_else(|| fallback_hash.to_string());

    Ok(BigCommerceEvent {
        store_id,
        producer,
        scope,
        hash,
        data: obj.get("data").cloned().unwrap_or(Value::Null),
    })
}

fn required_str(obj: &Map<String, Value>, field: &'static str) -> Result<String, PayloadError> {
    optional_str(obj, field).ok_or(PayloadError::MissingField(field))
}

fn optional_str(obj: &Map<String, Value>, field: &str) -> Option<String> {
    obj.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Hex SHA-256 of the raw body; the idempotency hash for senders that do
/// not supply one.
pub fn body_digest(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Payload of every webhook job: the record it drives plus the typed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookJob {
    pub record_id: Uuid,
    pub event: PlatformEvent,
}

impl WebhookJob {
    /// Best-effort record id lookup on a payload that may not fully decode.
    pub fn record_id_of(payload: &Value) -> Option<Uuid> {
        payload
            .get("record_id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    /// Payload fragment matching every job that drives `record_id`.
    pub fn filter_for(record_id: Uuid) -> Value {
        serde_json::json!({ "record_id": record_id })
    }
}
