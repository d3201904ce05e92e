//! Order model (the subset the fulfillment pipeline reads and writes).

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::DomainError;
use crate::id::{OrderId, UserId};

/// Order lifecycle status.
///
/// ```text
/// pending_payment -> paid -> submitted_to_printer -> fulfilled
///                     ^  \
///                     |   -> print_failed
///                     +------/ (retry)
/// ```
///
/// `submitted_to_printer` and `fulfilled` never move back to `paid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingPayment,
    Paid,
    SubmittedToPrinter,
    Fulfilled,
    PrintFailed,
}

impl OrderStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PendingPayment => "pending_payment",
            Self::Paid => "paid",
            Self::SubmittedToPrinter => "submitted_to_printer",
            Self::Fulfilled => "fulfilled",
            Self::PrintFailed => "print_failed",
        }
    }

    /// Already handed to the printer (or done). Replays must not regress these.
    pub const fn is_submitted_or_later(&self) -> bool {
        matches!(self, Self::SubmittedToPrinter | Self::Fulfilled)
    }

    /// States from which fulfillment may be (re)attempted.
    pub const fn is_fulfillable(&self) -> bool {
        matches!(self, Self::Paid | Self::PrintFailed)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_payment" => Ok(Self::PendingPayment),
            "paid" => Ok(Self::Paid),
            "submitted_to_printer" => Ok(Self::SubmittedToPrinter),
            "fulfilled" => Ok(Self::Fulfilled),
            "print_failed" => Ok(Self::PrintFailed),
            other => Err(DomainError::validation(format!("unknown order status: {other}"))),
        }
    }
}

/// Product type of an order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OrderType {
    Sign,
    SmartSign,
    ListingKit,
    ListingUnlock,
    Other(String),
}

impl OrderType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Sign => "sign",
            Self::SmartSign => "smart_sign",
            Self::ListingKit => "listing_kit",
            Self::ListingUnlock => "listing_unlock",
            Self::Other(s) => s,
        }
    }

    /// Products this pipeline sends to the printer.
    pub fn is_physical(&self) -> bool {
        matches!(self, Self::Sign | Self::SmartSign)
    }
}

impl From<String> for OrderType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "sign" => Self::Sign,
            "smart_sign" => Self::SmartSign,
            "listing_kit" => Self::ListingKit,
            "listing_unlock" => Self::ListingUnlock,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for OrderType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<OrderType> for String {
    fn from(value: OrderType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shipping destination captured at checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingAddress {
    pub name: Option<String>,
    pub line1: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
}

/// Product metadata the print worker needs next to each job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductMetadata {
    pub print_product: Option<String>,
    pub material: Option<String>,
    pub sides: Option<String>,
    pub layout_id: Option<String>,
}

/// Payment facts recorded when a checkout completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub checkout_session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub amount_total_cents: Option<i64>,
    pub currency: Option<String>,
    pub shipping: Option<ShippingAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: Option<UserId>,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub print_size: Option<String>,
    pub quantity: i32,
    pub product: ProductMetadata,
    /// Storage key of the most recent render artifact.
    pub artifact_key: Option<String>,
    pub shipping: ShippingAddress,
    pub checkout_session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub amount_total_cents: Option<i64>,
    pub currency: Option<String>,
    pub fulfillment_error: Option<String>,
    pub provider_job_id: Option<String>,
    pub print_idempotency_key: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub fulfilled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Maximum stored length of a fulfillment error message.
pub const MAX_ERROR_LEN: usize = 500;

/// Truncate an error message to what the store keeps, on a char boundary.
pub fn truncate_error(msg: &str) -> String {
    match msg.char_indices().nth(MAX_ERROR_LEN) {
        Some((idx, _)) => msg[..idx].to_string(),
        None => msg.to_string(),
    }
}

impl Order {
    /// A new order awaiting payment.
    pub fn new(id: OrderId, order_type: impl Into<OrderType>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id: None,
            order_type: order_type.into(),
            status: OrderStatus::PendingPayment,
            print_size: None,
            quantity: 1,
            product: ProductMetadata::default(),
            artifact_key: None,
            shipping: ShippingAddress::default(),
            checkout_session_id: None,
            payment_intent_id: None,
            amount_total_cents: None,
            currency: None,
            fulfillment_error: None,
            provider_job_id: None,
            print_idempotency_key: None,
            paid_at: None,
            submitted_at: None,
            fulfilled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Deterministic print idempotency key for an order.
    pub fn print_idempotency_key_for(id: OrderId) -> String {
        format!("order_{id}")
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted_at.is_some() || self.status.is_submitted_or_later()
    }

    /// Whether a product-specific render configuration exists.
    pub fn has_render_config(&self) -> bool {
        self.product.print_product.is_some()
    }

    /// Opaque shipping payload handed to the print worker.
    pub fn shipping_payload(&self) -> serde_json::Value {
        json!({
            "order_id": self.id,
            "order_type": self.order_type.as_str(),
            "user_id": self.user_id,
            "print_size": self.print_size,
            "material": self.product.material,
            "quantity": self.quantity,
            "shipping_name": self.shipping.name,
            "shipping_address": self.shipping.line1,
            "shipping_city": self.shipping.city,
            "shipping_state": self.shipping.state,
            "shipping_zip": self.shipping.postal_code,
        })
    }
}
