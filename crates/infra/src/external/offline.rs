//! Stand-ins used when a collaborator is not configured (local dev, tests).

use async_trait::async_trait;

use signpost_core::Order;

use super::{
    CheckoutSession, ExternalError, KitGenerator, PaymentProvider, PriceCatalog, Renderer,
    SessionRequest, SubscriptionSnapshot,
};

/// Reuses the order's recorded artifact instead of rendering.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExistingArtifact;

#[async_trait]
impl Renderer for ExistingArtifact {
    async fn render(&self, order: &Order) -> Result<String, ExternalError> {
        order
            .artifact_key
            .clone()
            .ok_or(ExternalError::NotConfigured("render service"))
    }
}

#[async_trait]
impl KitGenerator for ExistingArtifact {
    async fn generate_kit(
        &self,
        _kit_id: Option<i64>,
        _order: Option<&Order>,
    ) -> Result<String, ExternalError> {
        Err(ExternalError::NotConfigured("render service"))
    }
}

/// Every call fails with `NotConfigured`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPaymentProvider;

#[async_trait]
impl PaymentProvider for NoPaymentProvider {
    async fn retrieve_subscription(
        &self,
        _id: &str,
    ) -> Result<SubscriptionSnapshot, ExternalError> {
        Err(ExternalError::NotConfigured("payment provider"))
    }

    async fn retrieve_session(&self, _id: &str) -> Result<CheckoutSession, ExternalError> {
        Err(ExternalError::NotConfigured("payment provider"))
    }

    async fn create_session(
        &self,
        _request: &SessionRequest,
        _idempotency_key: &str,
    ) -> Result<CheckoutSession, ExternalError> {
        Err(ExternalError::NotConfigured("payment provider"))
    }
}

#[async_trait]
impl PriceCatalog for NoPaymentProvider {
    async fn lookup_price(&self, _lookup_key: &str) -> Result<Option<String>, ExternalError> {
        Err(ExternalError::NotConfigured("payment provider"))
    }
}
