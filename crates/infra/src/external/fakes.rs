//! In-process collaborators for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use signpost_core::Order;

use super::{
    CheckoutSession, ExternalError, KitGenerator, PaymentProvider, PriceCatalog, Renderer,
    SessionRequest, SubscriptionSnapshot,
};
use crate::storage::BlobStore;

/// Writes a small PDF to `renders/order_{id}.pdf`.
pub(crate) struct FakeRenderer {
    pub blobs: Arc<dyn BlobStore>,
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    /// Report success without writing the blob.
    pub skip_write: AtomicBool,
}

impl FakeRenderer {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            skip_write: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn render(&self, order: &Order) -> Result<String, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ExternalError::Status {
                status: 500,
                body: "layout engine crashed".into(),
            });
        }
        let key = format!("renders/order_{}.pdf", order.id);
        if !self.skip_write.load(Ordering::SeqCst) {
            self.blobs
                .put(&key, b"%PDF-1.7 fake".to_vec())
                .await
                .map_err(|e| ExternalError::Transport(e.to_string()))?;
        }
        Ok(key)
    }
}

#[derive(Default)]
pub(crate) struct FakeKits {
    pub generated: Mutex<Vec<(Option<i64>, Option<i64>)>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl KitGenerator for FakeKits {
    async fn generate_kit(
        &self,
        kit_id: Option<i64>,
        order: Option<&Order>,
    ) -> Result<String, ExternalError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ExternalError::Timeout);
        }
        let order_id = order.map(|o| o.id.get());
        if let Ok(mut generated) = self.generated.lock() {
            generated.push((order_id, kit_id));
        }
        Ok(format!("kits/{}.zip", kit_id.or(order_id).unwrap_or_default()))
    }
}

#[derive(Default)]
pub(crate) struct FakePayments {
    pub sessions: Mutex<HashMap<String, CheckoutSession>>,
    pub subscriptions: Mutex<HashMap<String, SubscriptionSnapshot>>,
    /// Idempotency keys seen by `create_session`, in call order.
    pub created: Mutex<Vec<String>>,
    pub prices: Mutex<HashMap<String, String>>,
    pub price_lookups: AtomicUsize,
}

impl FakePayments {
    pub fn with_session(self, session: CheckoutSession) -> Self {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(session.id.clone(), session);
        }
        self
    }

    pub fn with_subscription(self, sub: SubscriptionSnapshot) -> Self {
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.insert(sub.id.clone(), sub);
        }
        self
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PaymentProvider for FakePayments {
    async fn retrieve_subscription(
        &self,
        id: &str,
    ) -> Result<SubscriptionSnapshot, ExternalError> {
        self.subscriptions
            .lock()
            .ok()
            .and_then(|s| s.get(id).cloned())
            .ok_or(ExternalError::Status {
                status: 404,
                body: format!("no such subscription: {id}"),
            })
    }

    async fn retrieve_session(&self, id: &str) -> Result<CheckoutSession, ExternalError> {
        self.sessions
            .lock()
            .ok()
            .and_then(|s| s.get(id).cloned())
            .ok_or(ExternalError::Status {
                status: 404,
                body: format!("no such session: {id}"),
            })
    }

    async fn create_session(
        &self,
        request: &SessionRequest,
        idempotency_key: &str,
    ) -> Result<CheckoutSession, ExternalError> {
        let mut created = self
            .created
            .lock()
            .map_err(|_| ExternalError::Transport("poisoned".into()))?;
        created.push(idempotency_key.to_string());
        Ok(CheckoutSession {
            id: format!("cs_{}", created.len()),
            mode: Some(request.mode.clone()),
            metadata: request.metadata.clone(),
            client_reference_id: request.client_reference_id.clone(),
            url: Some(format!("https://pay.example/cs_{}", created.len())),
            ..Default::default()
        })
    }
}

#[async_trait]
impl PriceCatalog for FakePayments {
    async fn lookup_price(&self, lookup_key: &str) -> Result<Option<String>, ExternalError> {
        self.price_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .prices
            .lock()
            .ok()
            .and_then(|p| p.get(lookup_key).cloned()))
    }
}
