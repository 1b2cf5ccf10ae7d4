use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use relay_infra::config::RelayConfig;
use relay_infra::jobs::PostgresPendingTriggerStore;
use relay_infra::notify::TracingNotifier;
use relay_infra::tenants::PostgresTenantDirectory;
use relay_infra::upstream::HttpTriggerUpstream;
use relay_infra::TriggerRelay;

use relay_daemon::{router, RelayHandles};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relay_observability::init();

    let config = RelayConfig::from_env().context("failed to load relay configuration")?;
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let upstream_url =
        std::env::var("PROCESS_MANAGER_URL").context("PROCESS_MANAGER_URL must be set")?;
    let listen_addr =
        std::env::var("RELAY_LISTEN_ADDR").unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());

    let pool = PgPoolOptions::new()
        .max_connections(16)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await
        .context("failed to connect to postgres")?;

    let store = PostgresPendingTriggerStore::new(pool.clone(), config.schema_prefix.clone());
    let directory = PostgresTenantDirectory::new(pool);
    let upstream = HttpTriggerUpstream::new(&upstream_url);

    tracing::info!(endpoint = upstream.endpoint(), "starting trigger relay");
    let relay = TriggerRelay::start(
        config,
        Arc::new(store),
        Arc::new(directory),
        Arc::new(upstream),
        Arc::new(TracingNotifier),
    )
    .await
    .context("failed to start trigger relay")?;

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    tracing::info!(
        addr = %listener.local_addr().context("listener has no local address")?,
        tenants = relay.bootstrap_report().started.len(),
        retry_interval_ms = relay.config().retry_interval.as_millis() as u64,
        failed = relay.bootstrap_report().failed.len(),
        "trigger relay listening"
    );

    let app = router(RelayHandles::from_relay(&relay));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    tracing::info!("shutdown requested");
    relay.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
