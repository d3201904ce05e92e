use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use signpost_core::{DomainError, Order, OrderId, PrintJobId, ProductMetadata};

/// Print job lifecycle.
///
/// ```text
/// queued -> claimed -> downloaded -> printed
///    \________\___________\_________-> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrintJobStatus {
    Queued,
    Claimed,
    Downloaded,
    Printed,
    Cancelled,
}

impl PrintJobStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Claimed => "claimed",
            Self::Downloaded => "downloaded",
            Self::Printed => "printed",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Printed | Self::Cancelled)
    }
}

impl std::fmt::Display for PrintJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrintJobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "claimed" => Ok(Self::Claimed),
            "downloaded" => Ok(Self::Downloaded),
            "printed" => Ok(Self::Printed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(DomainError::validation(format!("unknown print job status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintJob {
    pub job_id: PrintJobId,
    /// Unique; derived from the owning order.
    pub idempotency_key: String,
    pub order_id: OrderId,
    /// Storage key of the worker-visible artifact copy.
    pub filename: String,
    pub status: PrintJobStatus,
    pub shipping_json: serde_json::Value,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub printed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PrintJob {
    pub fn new(order_id: OrderId, shipping_json: serde_json::Value, now: DateTime<Utc>) -> Self {
        let job_id = PrintJobId::new();
        Self {
            job_id,
            idempotency_key: Order::print_idempotency_key_for(order_id),
            order_id,
            filename: Self::storage_key_for(job_id),
            status: PrintJobStatus::Queued,
            shipping_json,
            attempts: 0,
            last_error: None,
            claimed_at: None,
            next_retry_at: None,
            downloaded_at: None,
            printed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Worker-visible location of a job's artifact.
    pub fn storage_key_for(job_id: PrintJobId) -> String {
        format!("print-jobs/{job_id}.pdf")
    }

    pub fn is_claimable(&self, now: DateTime<Utc>, stale_claim_after: Duration) -> bool {
        match self.status {
            PrintJobStatus::Queued => self.next_retry_at.is_none_or(|at| at <= now),
            PrintJobStatus::Claimed => self.claimed_at.is_some_and(|at| at < now - stale_claim_after),
            _ => false,
        }
    }

    pub fn mark_claimed(&mut self, now: DateTime<Utc>, retry_after: Duration) {
        self.status = PrintJobStatus::Claimed;
        self.claimed_at = Some(now);
        self.next_retry_at = Some(now + retry_after);
        self.attempts += 1;
        self.updated_at = now;
    }
}

/// Parameters of one print-worker claim.
#[derive(Debug, Clone, Copy)]
pub struct PrintClaim {
    pub limit: usize,
    pub now: DateTime<Utc>,
    pub stale_claim_after: Duration,
    pub retry_after: Duration,
}

/// A claimed job plus product metadata joined from its order.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedPrintJob {
    pub job: PrintJob,
    pub product: ProductMetadata,
}
