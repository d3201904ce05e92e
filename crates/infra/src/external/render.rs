//! HTTP client for the render service.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use signpost_core::{Order, OrderId, UserId};

use super::{ExternalError, KitGenerator, Renderer};

#[derive(Debug, Serialize)]
struct RenderRequest<'a> {
    order_id: OrderId,
    order_type: &'a str,
    print_size: Option<&'a str>,
    quantity: i32,
    print_product: Option<&'a str>,
    material: Option<&'a str>,
    sides: Option<&'a str>,
    layout_id: Option<&'a str>,
}

impl<'a> RenderRequest<'a> {
    fn for_order(order: &'a Order) -> Self {
        Self {
            order_id: order.id,
            order_type: order.order_type.as_str(),
            print_size: order.print_size.as_deref(),
            quantity: order.quantity,
            print_product: order.product.print_product.as_deref(),
            material: order.product.material.as_deref(),
            sides: order.product.sides.as_deref(),
            layout_id: order.product.layout_id.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
struct KitRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    kit_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    order_id: Option<OrderId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<UserId>,
}

#[derive(Debug, Deserialize)]
struct ArtifactResponse {
    artifact_key: String,
}

/// Renders print PDFs and listing kits through a remote service.
///
/// The service writes into the shared blob store and answers with the key.
#[derive(Debug, Clone)]
pub struct HttpRenderService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRenderService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ExternalError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<String, ExternalError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExternalError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let artifact: ArtifactResponse = response.json().await?;
        if artifact.artifact_key.is_empty() {
            return Err(ExternalError::Decode("empty artifact_key".into()));
        }
        debug!(artifact_key = %artifact.artifact_key, "render service responded");
        Ok(artifact.artifact_key)
    }
}

#[async_trait]
impl Renderer for HttpRenderService {
    #[instrument(skip(self, order), fields(order_id = %order.id), err)]
    async fn render(&self, order: &Order) -> Result<String, ExternalError> {
        self.post("/render", &RenderRequest::for_order(order)).await
    }
}

#[async_trait]
impl KitGenerator for HttpRenderService {
    #[instrument(skip(self, order), err)]
    async fn generate_kit(
        &self,
        kit_id: Option<i64>,
        order: Option<&Order>,
    ) -> Result<String, ExternalError> {
        let body = KitRequest {
            kit_id,
            order_id: order.map(|o| o.id),
            user_id: order.and_then(|o| o.user_id),
        };
        self.post("/listing-kits", &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn request_carries_product_configuration() {
        let mut order = Order::new(OrderId::new(42), "sign", Utc::now());
        order.print_size = Some("18x24".into());
        order.product.material = Some("coroplast".into());
        let body = serde_json::to_value(RenderRequest::for_order(&order)).unwrap();
        assert_eq!(body["order_id"], 42);
        assert_eq!(body["print_size"], "18x24");
        assert_eq!(body["material"], "coroplast");
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let svc = HttpRenderService::new("http://render.local/", Duration::from_secs(1)).unwrap();
        assert_eq!(svc.base_url, "http://render.local");
    }
}
