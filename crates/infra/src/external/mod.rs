//! Collaborators outside the pipeline: the render service and the payment
//! provider.

pub mod offline;
pub mod payments;
pub mod render;

#[cfg(test)]
pub(crate) mod fakes;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use signpost_core::{Order, ShippingAddress};

pub use offline::{ExistingArtifact, NoPaymentProvider};
pub use payments::HttpPaymentProvider;
pub use render::HttpRenderService;

#[derive(Debug, Clone, Error)]
pub enum ExternalError {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("not configured: {0}")]
    NotConfigured(&'static str),
}

impl From<reqwest::Error> for ExternalError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Produces the print-grade artifact for an order.
///
/// Re-rendering the same order overwrites the previous artifact.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Returns the storage key of the rendered artifact.
    async fn render(&self, order: &Order) -> Result<String, ExternalError>;
}

/// Builds listing-kit bundles.
#[async_trait]
pub trait KitGenerator: Send + Sync {
    /// Returns the storage key of the generated kit. Regenerating a kit
    /// overwrites it.
    async fn generate_kit(
        &self,
        kit_id: Option<i64>,
        order: Option<&Order>,
    ) -> Result<String, ExternalError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub id: String,
    pub status: String,
    pub customer: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
}

/// Provider view of a checkout session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub mode: Option<String>,
    pub payment_status: Option<String>,
    pub payment_intent: Option<String>,
    pub customer: Option<String>,
    pub subscription: Option<String>,
    pub client_reference_id: Option<String>,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub shipping: Option<ShippingAddress>,
    pub url: Option<String>,
}

impl CheckoutSession {
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn is_paid(&self) -> bool {
        self.payment_status.as_deref() == Some("paid")
    }

    /// Read a provider session object (API response or event payload).
    pub fn from_object(object: &Value) -> Result<Self, ExternalError> {
        let id = str_field(object, "id")
            .ok_or_else(|| ExternalError::Decode("session without id".into()))?;
        let metadata = object
            .get("metadata")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| match v {
                        Value::String(s) => Some((k.clone(), s.clone())),
                        Value::Null => None,
                        other => Some((k.clone(), other.to_string())),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let shipping = object
            .get("shipping_details")
            .filter(|v| !v.is_null())
            .or_else(|| object.get("customer_details").filter(|v| !v.is_null()))
            .map(shipping_from_details);

        Ok(Self {
            id,
            mode: str_field(object, "mode"),
            payment_status: str_field(object, "payment_status"),
            payment_intent: id_field(object, "payment_intent"),
            customer: id_field(object, "customer"),
            subscription: id_field(object, "subscription"),
            client_reference_id: str_field(object, "client_reference_id"),
            amount_total: object.get("amount_total").and_then(Value::as_i64),
            currency: str_field(object, "currency"),
            metadata,
            shipping,
            url: str_field(object, "url"),
        })
    }
}

impl SubscriptionSnapshot {
    pub fn from_object(object: &Value) -> Result<Self, ExternalError> {
        Ok(Self {
            id: str_field(object, "id")
                .ok_or_else(|| ExternalError::Decode("subscription without id".into()))?,
            status: str_field(object, "status").unwrap_or_else(|| "active".to_string()),
            customer: id_field(object, "customer"),
            current_period_end: unix_field(object, "current_period_end"),
        })
    }
}

pub(crate) fn str_field(object: &Value, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// A field that is either an id string or an expanded object with an `id`.
pub(crate) fn id_field(object: &Value, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(_) => str_field(&object[key], "id"),
        _ => None,
    }
}

pub(crate) fn unix_field(object: &Value, key: &str) -> Option<DateTime<Utc>> {
    object
        .get(key)
        .and_then(Value::as_i64)
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
}

fn shipping_from_details(details: &Value) -> ShippingAddress {
    let address = details.get("address").cloned().unwrap_or(Value::Null);
    ShippingAddress {
        name: str_field(details, "name"),
        line1: str_field(&address, "line1"),
        city: str_field(&address, "city"),
        state: str_field(&address, "state"),
        postal_code: str_field(&address, "postal_code"),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub price: String,
    pub quantity: u32,
}

/// Parameters of a new checkout session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub mode: String,
    pub line_items: Vec<LineItem>,
    pub success_url: String,
    pub cancel_url: String,
    pub customer: Option<String>,
    pub client_reference_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn retrieve_subscription(&self, id: &str)
    -> Result<SubscriptionSnapshot, ExternalError>;

    async fn retrieve_session(&self, id: &str) -> Result<CheckoutSession, ExternalError>;

    /// Create a session. The provider dedups on `idempotency_key`.
    async fn create_session(
        &self,
        request: &SessionRequest,
        idempotency_key: &str,
    ) -> Result<CheckoutSession, ExternalError>;
}

/// Resolves price lookup keys to provider price ids.
#[async_trait]
pub trait PriceCatalog: Send + Sync {
    async fn lookup_price(&self, lookup_key: &str) -> Result<Option<String>, ExternalError>;
}
