//! Infrastructure wiring: picks the store backend and the external
//! collaborators from [`Settings`] and assembles the services the routes use.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use signpost_auth::{DownloadUrlSigner, StaticTokenVerifier, TokenVerifier, WebhookSignatureVerifier};
use signpost_core::{Clock, SystemClock};
use signpost_infra::checkout::{CheckoutAttemptStore, CheckoutAttempts, PriceCache};
use signpost_infra::external::{
    ExistingArtifact, HttpPaymentProvider, HttpRenderService, KitGenerator, NoPaymentProvider,
    PaymentProvider, PriceCatalog, Renderer,
};
use signpost_infra::jobs::{JobQueue, JobStore};
use signpost_infra::orders::OrderStore;
use signpost_infra::print_queue::{PrintJobStore, PrintQueue};
use signpost_infra::storage::{BlobStore, LocalBlobStore, MemoryBlobStore};
use signpost_infra::webhooks::{
    PaymentEventHandler, SubscriptionStore, WebhookEventStore, WebhookProcessor,
};
use signpost_infra::{FulfillmentService, MemoryStore, PgStore, Reconciler, Settings};

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a request handler (or the job worker) needs.
#[derive(Clone)]
pub struct AppServices {
    pub settings: Settings,
    pub clock: Arc<dyn Clock>,
    pub orders: Arc<dyn OrderStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub kits: Arc<dyn KitGenerator>,
    pub jobs: JobQueue,
    pub print_queue: PrintQueue,
    pub fulfillment: FulfillmentService,
    pub webhooks: WebhookProcessor,
    pub attempts: CheckoutAttempts,
    pub prices: Arc<PriceCache>,
    pub reconciler: Reconciler,
    pub print_token: Arc<dyn TokenVerifier>,
    pub admin_token: Arc<dyn TokenVerifier>,
    pub webhook_verifier: WebhookSignatureVerifier,
}

/// External collaborators, configured or falling back to offline stand-ins.
struct Collaborators {
    blobs: Arc<dyn BlobStore>,
    renderer: Arc<dyn Renderer>,
    kits: Arc<dyn KitGenerator>,
    provider: Arc<dyn PaymentProvider>,
    catalog: Arc<dyn PriceCatalog>,
}

fn collaborators(settings: &Settings) -> anyhow::Result<Collaborators> {
    let blobs: Arc<dyn BlobStore> = match &settings.storage_root {
        Some(root) => Arc::new(LocalBlobStore::new(root.clone())),
        None => {
            warn!("STORAGE_ROOT not set; keeping artifacts in memory");
            Arc::new(MemoryBlobStore::new())
        }
    };

    let renderer: Arc<dyn Renderer>;
    let kits: Arc<dyn KitGenerator>;
    match &settings.render_service_url {
        Some(url) => {
            let service = Arc::new(
                HttpRenderService::new(url.as_str(), settings.render_timeout)
                    .context("building render service client")?,
            );
            renderer = service.clone();
            kits = service;
        }
        None => {
            warn!("RENDER_SERVICE_URL not set; fulfillment uses stored artifacts only");
            renderer = Arc::new(ExistingArtifact);
            kits = Arc::new(ExistingArtifact);
        }
    }

    let provider: Arc<dyn PaymentProvider>;
    let catalog: Arc<dyn PriceCatalog>;
    match &settings.payment_api_key {
        Some(key) => {
            let client = Arc::new(
                HttpPaymentProvider::new(
                    Some(settings.payment_api_base.as_str()),
                    key.as_str(),
                    PROVIDER_TIMEOUT,
                )
                .context("building payment provider client")?,
            );
            provider = client.clone();
            catalog = client;
        }
        None => {
            warn!("PAYMENT_API_KEY not set; payment provider calls are disabled");
            provider = Arc::new(NoPaymentProvider);
            catalog = Arc::new(NoPaymentProvider);
        }
    }

    Ok(Collaborators {
        blobs,
        renderer,
        kits,
        provider,
        catalog,
    })
}

/// Build services on Postgres when `DATABASE_URL` is set, otherwise in memory.
pub async fn build_services(settings: &Settings) -> anyhow::Result<AppServices> {
    let collaborators = collaborators(settings)?;
    match &settings.database_url {
        Some(url) => {
            let store = Arc::new(PgStore::connect(url).await.context("connecting to Postgres")?);
            store.migrate().await.context("applying schema")?;
            info!("using Postgres stores");
            Ok(assemble(store, collaborators, settings))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory stores");
            Ok(assemble(MemoryStore::arc(), collaborators, settings))
        }
    }
}

/// In-memory services over the given store (tests, single-process dev runs).
pub fn in_memory_services(settings: &Settings, store: Arc<MemoryStore>) -> anyhow::Result<AppServices> {
    Ok(assemble(store, collaborators(settings)?, settings))
}

fn assemble<S>(store: Arc<S>, c: Collaborators, settings: &Settings) -> AppServices
where
    S: OrderStore
        + JobStore
        + PrintJobStore
        + WebhookEventStore
        + SubscriptionStore
        + CheckoutAttemptStore
        + 'static,
{
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // The print token doubles as the download-link secret; without one the
    // links only need to survive this process.
    let download_secret = settings
        .print_jobs_token
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let signer = DownloadUrlSigner::new(download_secret, settings.print.download_url_ttl);

    let jobs = JobQueue::new(store.clone(), clock.clone(), settings.jobs.clone());
    let print_queue = PrintQueue::new(
        store.clone(),
        c.blobs.clone(),
        clock.clone(),
        signer,
        settings.public_base_url.as_str(),
        settings.print.clone(),
    );
    let fulfillment = FulfillmentService::new(
        store.clone(),
        print_queue.clone(),
        c.renderer,
        c.blobs.clone(),
        clock.clone(),
        settings.render_timeout,
    );
    let attempts = CheckoutAttempts::new(store.clone(), c.provider.clone(), clock.clone());
    let prices = Arc::new(PriceCache::new(
        c.catalog,
        clock.clone(),
        chrono::Duration::seconds(settings.price_cache_ttl.as_secs() as i64),
    ));
    let handler = PaymentEventHandler::new(
        store.clone(),
        store.clone(),
        attempts.clone(),
        fulfillment.clone(),
        jobs.clone(),
        c.provider.clone(),
        clock.clone(),
    );
    let webhooks = WebhookProcessor::new(store.clone(), Arc::new(handler.clone()), clock.clone());
    let reconciler = Reconciler::new(store.clone(), c.provider, handler, clock.clone());

    AppServices {
        settings: settings.clone(),
        clock,
        orders: store,
        blobs: c.blobs,
        kits: c.kits,
        jobs,
        print_queue,
        fulfillment,
        webhooks,
        attempts,
        prices,
        reconciler,
        print_token: Arc::new(StaticTokenVerifier::new(settings.print_jobs_token.as_deref())),
        admin_token: Arc::new(StaticTokenVerifier::new(settings.admin_token.as_deref())),
        webhook_verifier: WebhookSignatureVerifier::new(
            settings.webhook_secret.clone(),
            settings.webhook_tolerance_secs,
        ),
    }
}
