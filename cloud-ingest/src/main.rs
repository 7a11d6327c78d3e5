use anyhow::Context;
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use cloud_ingest::config::EngineConfig;
use cloud_ingest::database;
use cloud_ingest::logging;
use cloud_ingest::services::ServiceContainer;
use cloud_ingest::utils::http_client::install_rustls_provider;
use cloud_ingest::vendor::VendorRegistry;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env().context("loading configuration")?;

    let (logging_config, _log_guard) = logging::init_logging(&config.log_dir, config.log_json)
        .context("initializing logging")?;
    let log_cancel = CancellationToken::new();
    logging_config.start_retention_cleanup(log_cancel.clone());

    install_rustls_provider();

    let pool = database::init_pool(&config.database_url)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;
    database::run_migrations(&pool)
        .await
        .context("running migrations")?;

    // Datum sources are registered by the embedding deployment.
    let vendors = VendorRegistry::new();

    let container = ServiceContainer::new(pool, config, vendors);
    container.initialize();
    info!("cloud-ingest started");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    container.shutdown().await;
    log_cancel.cancel();
    Ok(())
}
