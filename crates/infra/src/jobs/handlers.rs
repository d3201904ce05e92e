//! Handlers for the known job types.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::types::{AsyncJob, JobPayload, JobResult};
use super::worker::JobHandler;
use crate::external::KitGenerator;
use crate::fulfillment::{FulfillmentOutcome, FulfillmentService};
use crate::orders::OrderStore;

/// `fulfill_order`: runs the orchestrator; a transient failure retries with backoff.
#[derive(Clone)]
pub struct FulfillOrderHandler {
    fulfillment: FulfillmentService,
}

impl FulfillOrderHandler {
    pub fn new(fulfillment: FulfillmentService) -> Self {
        Self { fulfillment }
    }
}

#[async_trait]
impl JobHandler for FulfillOrderHandler {
    async fn handle(&self, _job: &AsyncJob, payload: JobPayload) -> JobResult {
        let JobPayload::FulfillOrder { order_id } = payload else {
            return JobResult::Reject(format!("unexpected payload for fulfill_order: {payload:?}"));
        };
        match self.fulfillment.fulfill_order(order_id).await {
            outcome if outcome.succeeded() => JobResult::Success,
            FulfillmentOutcome::Rejected { reason } => JobResult::Reject(reason),
            FulfillmentOutcome::Failed { reason } => JobResult::Retry(reason),
            other => JobResult::Retry(format!("unexpected fulfillment outcome: {other:?}")),
        }
    }
}

/// `generate_listing_kit`: regenerates the kit for an order (or kit id).
#[derive(Clone)]
pub struct ListingKitHandler {
    orders: Arc<dyn OrderStore>,
    kits: Arc<dyn KitGenerator>,
    timeout: Duration,
}

impl std::fmt::Debug for ListingKitHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListingKitHandler")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ListingKitHandler {
    pub fn new(orders: Arc<dyn OrderStore>, kits: Arc<dyn KitGenerator>, timeout: Duration) -> Self {
        Self {
            orders,
            kits,
            timeout,
        }
    }
}

#[async_trait]
impl JobHandler for ListingKitHandler {
    async fn handle(&self, _job: &AsyncJob, payload: JobPayload) -> JobResult {
        let JobPayload::GenerateListingKit { kit_id, order_id } = payload else {
            return JobResult::Reject(format!(
                "unexpected payload for generate_listing_kit: {payload:?}"
            ));
        };

        let order = match order_id {
            Some(id) => match self.orders.get_order(id).await {
                Ok(Some(order)) => Some(order),
                Ok(None) => return JobResult::Reject(format!("order {id} not found")),
                Err(err) => return JobResult::Retry(err.to_string()),
            },
            None => None,
        };

        match tokio::time::timeout(self.timeout, self.kits.generate_kit(kit_id, order.as_ref())).await {
            Ok(Ok(key)) => {
                info!(kit_id = ?kit_id, order_id = ?order_id, artifact_key = %key, "listing kit generated");
                JobResult::Success
            }
            Ok(Err(err)) => JobResult::Retry(format!("kit generation failed: {err}")),
            Err(_) => JobResult::Retry(format!("kit generation timed out after {:?}", self.timeout)),
        }
    }
}
