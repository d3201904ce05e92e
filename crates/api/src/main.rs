use anyhow::Context;
use signpost_infra::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    signpost_observability::init();

    let settings = Settings::from_env().context("loading configuration")?;
    if settings.print_jobs_token.is_none() {
        tracing::warn!("PRINT_JOBS_TOKEN not set; print-worker endpoints will refuse every request");
    }
    if settings.webhook_secret.is_none() {
        tracing::warn!("PAYMENT_WEBHOOK_SECRET not set; webhook deliveries will be refused");
    }

    let app = signpost_api::app::build_app(&settings).await?;

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
