//! HTTP client for the payment provider's REST API.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::instrument;

use super::{
    CheckoutSession, ExternalError, PaymentProvider, PriceCatalog, SessionRequest,
    SubscriptionSnapshot, str_field,
};

pub const DEFAULT_API_BASE: &str = "https://api.stripe.com";

#[derive(Clone)]
pub struct HttpPaymentProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for HttpPaymentProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPaymentProvider")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpPaymentProvider {
    pub fn new(
        base_url: Option<&str>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ExternalError> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(ExternalError::NotConfigured("payment api key"));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url
                .unwrap_or(DEFAULT_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            api_key,
        })
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, ExternalError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExternalError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, ExternalError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .query(query)
            .send()
            .await?;
        Self::read_json(response).await
    }
}

/// Flatten a session request into the provider's bracketed form encoding.
pub(crate) fn session_form(request: &SessionRequest) -> Vec<(String, String)> {
    let mut form = vec![
        ("mode".to_string(), request.mode.clone()),
        ("success_url".to_string(), request.success_url.clone()),
        ("cancel_url".to_string(), request.cancel_url.clone()),
    ];
    for (i, item) in request.line_items.iter().enumerate() {
        form.push((format!("line_items[{i}][price]"), item.price.clone()));
        form.push((format!("line_items[{i}][quantity]"), item.quantity.to_string()));
    }
    if let Some(customer) = &request.customer {
        form.push(("customer".to_string(), customer.clone()));
    }
    if let Some(reference) = &request.client_reference_id {
        form.push(("client_reference_id".to_string(), reference.clone()));
    }
    for (k, v) in &request.metadata {
        form.push((format!("metadata[{k}]"), v.clone()));
    }
    form
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    #[instrument(skip(self), err)]
    async fn retrieve_subscription(
        &self,
        id: &str,
    ) -> Result<SubscriptionSnapshot, ExternalError> {
        let body = self.get(&format!("/v1/subscriptions/{id}"), &[]).await?;
        SubscriptionSnapshot::from_object(&body)
    }

    #[instrument(skip(self), err)]
    async fn retrieve_session(&self, id: &str) -> Result<CheckoutSession, ExternalError> {
        let body = self
            .get(&format!("/v1/checkout/sessions/{id}"), &[])
            .await?;
        CheckoutSession::from_object(&body)
    }

    #[instrument(skip(self, request), fields(mode = %request.mode), err)]
    async fn create_session(
        &self,
        request: &SessionRequest,
        idempotency_key: &str,
    ) -> Result<CheckoutSession, ExternalError> {
        let response = self
            .client
            .post(format!("{}/v1/checkout/sessions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", idempotency_key)
            .form(&session_form(request))
            .send()
            .await?;
        let body = Self::read_json(response).await?;
        CheckoutSession::from_object(&body)
    }
}

#[async_trait]
impl PriceCatalog for HttpPaymentProvider {
    #[instrument(skip(self), err)]
    async fn lookup_price(&self, lookup_key: &str) -> Result<Option<String>, ExternalError> {
        let body = self
            .get(
                "/v1/prices",
                &[("lookup_keys[]", lookup_key), ("active", "true"), ("limit", "1")],
            )
            .await?;
        Ok(body
            .get("data")
            .and_then(Value::as_array)
            .and_then(|prices| prices.first())
            .and_then(|price| str_field(price, "id")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::LineItem;
    use std::collections::BTreeMap;

    #[test]
    fn session_form_uses_bracketed_keys() {
        let request = SessionRequest {
            mode: "payment".into(),
            line_items: vec![LineItem {
                price: "price_123".into(),
                quantity: 2,
            }],
            success_url: "https://x/ok".into(),
            cancel_url: "https://x/cancel".into(),
            customer: None,
            client_reference_id: Some("42".into()),
            metadata: BTreeMap::from([("order_id".to_string(), "42".to_string())]),
        };
        let form = session_form(&request);
        assert!(form.contains(&("line_items[0][price]".into(), "price_123".into())));
        assert!(form.contains(&("line_items[0][quantity]".into(), "2".into())));
        assert!(form.contains(&("metadata[order_id]".into(), "42".into())));
        assert!(!form.iter().any(|(k, _)| k == "customer"));
    }

    #[test]
    fn empty_api_key_is_rejected() {
        assert!(matches!(
            HttpPaymentProvider::new(None, "", Duration::from_secs(1)),
            Err(ExternalError::NotConfigured(_))
        ));
    }
}
