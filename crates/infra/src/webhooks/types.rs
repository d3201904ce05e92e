use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use signpost_core::{DomainError, EventId};

/// Idempotency state of one provider event.
///
/// `failed` is not terminal: the next delivery may claim it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Received,
    Processing,
    Processed,
    Failed,
}

impl WebhookEventStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    /// States from which a delivery may claim the event.
    pub const fn is_claimable(&self) -> bool {
        matches!(self, Self::Received | Self::Failed)
    }
}

impl std::fmt::Display for WebhookEventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookEventStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::validation(format!("unknown webhook status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub status: WebhookEventStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn received(event_id: EventId, event_type: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            event_id,
            event_type: event_type.into(),
            status: WebhookEventStatus::Received,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Envelope of an inbound payment-provider event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl ProviderEvent {
    /// Parse a raw webhook body. The event id must be non-empty.
    pub fn parse(payload: &[u8]) -> Result<Self, DomainError> {
        let event: Self = serde_json::from_slice(payload)
            .map_err(|e| DomainError::validation(format!("malformed event payload: {e}")))?;
        EventId::new(event.id.clone())?;
        Ok(event)
    }

    pub fn event_id(&self) -> Result<EventId, DomainError> {
        EventId::new(self.id.clone())
    }

    pub fn object(&self) -> &serde_json::Value {
        &self.data.object
    }
}
