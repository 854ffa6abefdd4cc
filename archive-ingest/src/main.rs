use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use archive_ingest::{
    config::{Config, LogFormat},
    server,
    service::ArchiveIngestService,
};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_with_defaults().context(
        "Failed to load configuration from environment variables. Please check your environment setup.",
    )?;
    init_tracing(config.log_format);

    info!("Starting archive ingest service");
    info!(
        source = ?config.source.source_type,
        store = ?config.store.store_type,
        catalog = ?config.catalog.catalog_type,
        bucket = config.store.store_primary_bucket,
        "Configuration loaded"
    );

    let router = server::router().context("Failed to install metrics recorder")?;
    let bind = config.bind_address();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::serve(router, &bind).await {
            error!("Health and metrics server failed: {e:#}");
        }
    });
    info!("Started metrics server on {}", config.bind_address());

    let service = ArchiveIngestService::new(config)
        .await
        .context("Failed to create archive ingest service. Check the source, store and catalog settings.")?;

    let summary = service.run().await?;
    info!(?summary, "Archive ingest service stopped");

    server_handle.abort();
    Ok(())
}
