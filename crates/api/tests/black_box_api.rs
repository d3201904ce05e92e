use std::sync::Arc;

use chrono::Utc;
use reqwest::StatusCode;
use serde_json::json;
use signpost_api::app::{AppServices, router, services::in_memory_services};
use signpost_auth::WebhookSignatureVerifier;
use signpost_core::{Order, OrderId, OrderStatus};
use signpost_infra::{MemoryStore, Settings};

const PRINT_TOKEN: &str = "print-token";
const ADMIN_TOKEN: &str = "admin-token";
const WEBHOOK_SECRET: &str = "whsec_test";

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(webhook_secret: Option<&str>) -> Self {
        // Bind first so download links point back at this server.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let settings = Settings {
            public_base_url: base_url.clone(),
            print_jobs_token: Some(PRINT_TOKEN.to_string()),
            admin_token: Some(ADMIN_TOKEN.to_string()),
            webhook_secret: webhook_secret.map(str::to_string),
            ..Settings::default()
        };
        let services = Arc::new(in_memory_services(&settings, MemoryStore::arc()).unwrap());
        let app = router(services.clone());

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            services,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// A sign order awaiting payment whose print artifact is already stored.
    async fn seed_order(&self, id: i64) -> OrderId {
        let order_id = OrderId::new(id);
        let key = format!("renders/order_{id}.pdf");
        self.services
            .blobs
            .put(&key, b"%PDF-1.7 test".to_vec())
            .await
            .unwrap();
        let mut order = Order::new(order_id, "sign", Utc::now());
        order.artifact_key = Some(key);
        order.checkout_session_id = Some(format!("cs_{id}"));
        self.services.orders.insert_order(&order).await.unwrap();
        order_id
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn checkout_completed(event_id: &str, order_id: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "data": {"object": {
            "id": format!("cs_{order_id}"),
            "mode": "payment",
            "payment_status": "paid",
            "payment_intent": "pi_123",
            "amount_total": 4999,
            "currency": "usd",
            "metadata": {"order_id": order_id.to_string()}
        }}
    }))
    .unwrap()
}

async fn deliver(client: &reqwest::Client, srv: &TestServer, body: Vec<u8>) -> reqwest::Response {
    let signature = WebhookSignatureVerifier::new(Some(WEBHOOK_SECRET.to_string()), 300)
        .sign(&body, Utc::now())
        .unwrap();
    client
        .post(srv.url("/stripe/webhook"))
        .header("Stripe-Signature", signature)
        .body(body)
        .send()
        .await
        .unwrap()
}

async fn claim(client: &reqwest::Client, srv: &TestServer, limit: usize) -> Vec<serde_json::Value> {
    let res = client
        .post(srv.url(&format!("/api/print-jobs/claim?limit={limit}")))
        .bearer_auth(PRINT_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    body["jobs"].as_array().unwrap().clone()
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn(Some(WEBHOOK_SECRET)).await;
    let res = reqwest::get(srv.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn print_endpoints_require_the_print_token() {
    let srv = TestServer::spawn(Some(WEBHOOK_SECRET)).await;
    let client = reqwest::Client::new();
    let job = "00000000-0000-4000-8000-000000000000";

    let requests = [
        client.post(srv.url("/api/print-jobs/claim")),
        client.get(srv.url(&format!("/api/print-jobs/{job}/pdf"))),
        client.post(srv.url(&format!("/api/print-jobs/{job}/downloaded"))),
        client.post(srv.url(&format!("/api/print-jobs/{job}/printed"))),
    ];
    for request in requests {
        let res = request.bearer_auth("wrong").send().await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    let res = client
        .post(srv.url("/api/print-jobs/claim"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    // The admin token is not a print token.
    let res = client
        .post(srv.url("/api/print-jobs/claim"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn paid_webhook_flows_through_to_fulfilled_order() {
    let srv = TestServer::spawn(Some(WEBHOOK_SECRET)).await;
    let client = reqwest::Client::new();
    let order_id = srv.seed_order(42).await;

    let res = deliver(&client, &srv, checkout_completed("evt_paid_42", 42)).await;
    assert_eq!(res.status(), StatusCode::OK);

    // Redelivery is acknowledged without re-running side effects.
    let res = deliver(&client, &srv, checkout_completed("evt_paid_42", 42)).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["note"], "duplicate");

    let order = srv.services.orders.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::SubmittedToPrinter);

    let jobs = claim(&client, &srv, 5).await;
    assert_eq!(jobs.len(), 1);
    let job_id = jobs[0]["job_id"].as_str().unwrap().to_string();
    assert_eq!(jobs[0]["order_id"], 42);
    assert_eq!(jobs[0]["shipping_json"]["order_id"], 42);
    assert!(claim(&client, &srv, 5).await.is_empty());

    // The signed link works without the bearer token.
    let link = jobs[0]["download_url"].as_str().unwrap();
    let res = client.get(link).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers()["content-type"].to_str().unwrap(),
        "application/pdf"
    );
    assert_eq!(res.bytes().await.unwrap().as_ref(), b"%PDF-1.7 test");

    let res = client
        .post(srv.url(&format!("/api/print-jobs/{job_id}/downloaded")))
        .bearer_auth(PRINT_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    for note in [None, Some("already_printed")] {
        let res = client
            .post(srv.url(&format!("/api/print-jobs/{job_id}/printed")))
            .bearer_auth(PRINT_TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = res.json().await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["note"].as_str(), note);
    }

    let order = srv.services.orders.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Fulfilled);
    assert!(order.fulfilled_at.is_some());
}

#[tokio::test]
async fn unknown_print_job_is_not_found() {
    let srv = TestServer::spawn(Some(WEBHOOK_SECRET)).await;
    let client = reqwest::Client::new();
    let job = "00000000-0000-4000-8000-000000000000";

    for path in [format!("/api/print-jobs/{job}/printed"), format!("/api/print-jobs/{job}/downloaded")] {
        let res = client
            .post(srv.url(&path))
            .bearer_auth(PRINT_TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
    let res = client
        .get(srv.url(&format!("/api/print-jobs/{job}/pdf")))
        .bearer_auth(PRINT_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancelled_job_acks_are_conflicts() {
    let srv = TestServer::spawn(Some(WEBHOOK_SECRET)).await;
    let client = reqwest::Client::new();
    srv.seed_order(7).await;
    let res = deliver(&client, &srv, checkout_completed("evt_paid_7", 7)).await;
    assert_eq!(res.status(), StatusCode::OK);

    let jobs = claim(&client, &srv, 1).await;
    let job_id = jobs[0]["job_id"].as_str().unwrap().to_string();

    let res = client
        .post(srv.url(&format!("/admin/print-jobs/{job_id}/cancel")))
        .bearer_auth(PRINT_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .post(srv.url(&format!("/admin/print-jobs/{job_id}/cancel")))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .post(srv.url(&format!("/api/print-jobs/{job_id}/printed")))
        .bearer_auth(PRINT_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["retryable"], false);
    assert_eq!(body["current"], "cancelled");
}

#[tokio::test]
async fn webhook_rejects_bad_signatures_and_missing_secret() {
    let srv = TestServer::spawn(Some(WEBHOOK_SECRET)).await;
    let client = reqwest::Client::new();
    let order_id = srv.seed_order(9).await;

    let res = client
        .post(srv.url("/stripe/webhook"))
        .header("Stripe-Signature", "t=1,v1=deadbeef")
        .body(checkout_completed("evt_forged", 9))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = deliver(&client, &srv, b"not json".to_vec()).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let order = srv.services.orders.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::PendingPayment);

    let unconfigured = TestServer::spawn(None).await;
    let res = deliver(&client, &unconfigured, checkout_completed("evt_x", 9)).await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn failed_webhook_handling_answers_5xx() {
    let srv = TestServer::spawn(Some(WEBHOOK_SECRET)).await;
    let client = reqwest::Client::new();

    // No such order: the handler fails and the provider should retry later.
    let res = deliver(&client, &srv, checkout_completed("evt_missing", 404)).await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["event_id"], "evt_missing");
}

#[tokio::test]
async fn admin_job_endpoints_report_queue_state() {
    let srv = TestServer::spawn(Some(WEBHOOK_SECRET)).await;
    let client = reqwest::Client::new();

    let res = client
        .get(srv.url("/admin/jobs/stats"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let stats: serde_json::Value = res.json().await.unwrap();
    assert_eq!(stats["dead"], 0);

    let res = client
        .get(srv.url("/admin/jobs?status=bogus"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(srv.url("/admin/reconcile?hours=1&dry_run=true"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let report: serde_json::Value = res.json().await.unwrap();
    assert_eq!(report["dry_run"], true);
    assert_eq!(report["checked"], 0);
}
