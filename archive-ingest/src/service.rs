use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::{
    catalog::{Catalog, MemoryCatalog, PostgresCatalog},
    config::{CatalogConfig, CatalogType, Config, SourceConfig, SourceType, StoreConfig, StoreType},
    pipeline::{Pipeline, RunSummary},
    source::{mock::parse_scenarios, KafkaSource, MockSource, StreamSource},
    store::{MemoryObjectClient, ObjectClient, ObjectStore, S3Impl},
};

pub fn build_source(config: &SourceConfig) -> Result<Box<dyn StreamSource>> {
    match config.source_type {
        SourceType::Kafka => {
            let source = KafkaSource::new(config).with_context(|| {
                format!("Failed to create Kafka source for {}", config.source_broker_url)
            })?;
            Ok(Box::new(source))
        }
        SourceType::Mock => {
            let scenarios = parse_scenarios(&config.source_mock_scenarios)?;
            let source = MockSource::with_scenarios(&scenarios, chrono::Utc::now().timestamp_millis());
            Ok(Box::new(if config.source_until_eos {
                source
            } else {
                source.unbounded()
            }))
        }
    }
}

pub async fn build_store(config: &StoreConfig) -> Arc<ObjectStore> {
    let client: Arc<dyn ObjectClient> = match config.store_type {
        StoreType::S3 => Arc::new(S3Impl::from_config(config).await),
        StoreType::Mock => Arc::new(MemoryObjectClient::new()),
    };
    Arc::new(
        ObjectStore::new(
            client,
            config.store_primary_bucket.clone(),
            config.store_backup_bucket.clone(),
        )
        .with_log_every(config.store_log_every),
    )
}

/// Connects the catalog and brings its schema up to date.
pub async fn build_catalog(config: &CatalogConfig) -> Result<Arc<dyn Catalog>> {
    let catalog: Arc<dyn Catalog> = match config.catalog_type {
        CatalogType::Postgres => Arc::new(
            PostgresCatalog::connect(config)
                .await
                .context("Failed to connect to the catalog database")?,
        ),
        CatalogType::Mock => Arc::new(MemoryCatalog::new()),
    };
    catalog
        .make_schema()
        .await
        .context("Failed to create catalog schema")?;
    Ok(catalog)
}

/// Archives every message from the configured source until shutdown or end of stream.
pub struct ArchiveIngestService {
    config: Config,
    source: Box<dyn StreamSource>,
    pipeline: Pipeline,
}

impl ArchiveIngestService {
    pub async fn new(config: Config) -> Result<Self> {
        let source = build_source(&config.source)?;
        let store = build_store(&config.store).await;
        let catalog = build_catalog(&config.catalog).await?;
        Ok(Self::with_backends(config, source, store, catalog))
    }

    /// Create a service over already constructed backends (useful for testing)
    pub fn with_backends(
        config: Config,
        source: Box<dyn StreamSource>,
        store: Arc<ObjectStore>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        let pipeline = Pipeline::new(store, catalog)
            .with_message_timeout(config.message_timeout())
            .with_verify_after_store(config.verify_after_store)
            .with_reconnect_backoff(
                config.reconnect_backoff_ms.0,
                config.max_reconnect_backoff_ms.0,
            );
        Self {
            config,
            source,
            pipeline,
        }
    }

    /// Run the service until ctrl+c or the end of the stream
    pub async fn run(self) -> Result<RunSummary> {
        self.run_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl+c signal: {e:#}");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run the service with a custom shutdown signal (useful for testing)
    pub async fn run_with_shutdown(
        self,
        shutdown_signal: impl std::future::Future<Output = ()>,
    ) -> Result<RunSummary> {
        let Self {
            config,
            mut source,
            pipeline,
        } = self;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        info!("Starting archive ingest pipeline");
        let mut pipeline_handle = tokio::spawn(async move {
            pipeline
                .run(source.as_mut(), async {
                    shutdown_rx.await.ok();
                })
                .await
        });

        tokio::select! {
            finished = &mut pipeline_handle => {
                return finished.context("Pipeline task panicked");
            }
            _ = shutdown_signal => {}
        }

        info!("Received shutdown signal, draining in-flight message...");
        shutdown_tx.send(()).ok();

        match tokio::time::timeout(config.shutdown_timeout(), &mut pipeline_handle).await {
            Ok(Ok(summary)) => {
                info!(?summary, "Pipeline stopped normally");
                Ok(summary)
            }
            Ok(Err(e)) => Err(e).context("Pipeline task panicked"),
            Err(_) => {
                pipeline_handle.abort();
                Err(anyhow!(
                    "Pipeline shutdown timed out after {:?}",
                    config.shutdown_timeout()
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use envconfig::Envconfig;

    use super::*;
    use crate::source::MockScenario;

    fn mock_config(extra: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = [
            ("SOURCE_TYPE", "mock"),
            ("STORE_TYPE", "mock"),
            ("CATALOG_TYPE", "mock"),
            ("SOURCE_UNTIL_EOS", "true"),
            ("MESSAGE_TIMEOUT_MS", "5000"),
        ]
        .into_iter()
        .chain(extra.iter().copied())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Config::init_from_hashmap(&env).unwrap()
    }

    #[tokio::test]
    async fn test_mock_service_runs_to_end_of_stream() {
        let config = mock_config(&[]);
        let service = ArchiveIngestService::new(config).await.unwrap();
        let summary = service
            .run_with_shutdown(std::future::pending())
            .await
            .unwrap();
        assert_eq!(summary.archived, 4);
        assert_eq!(summary.skipped, 4);
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_unbounded_source() {
        let config = mock_config(&[("SOURCE_UNTIL_EOS", "false")]);
        let source = MockSource::with_scenarios(&[MockScenario::ClientUuidRecent], 0).unbounded();
        let catalog = Arc::new(MemoryCatalog::new());
        let store = build_store(&config.store).await;
        let service =
            ArchiveIngestService::with_backends(config, Box::new(source.clone()), store, catalog.clone());

        let summary = service
            .run_with_shutdown(tokio::time::sleep(std::time::Duration::from_millis(200)))
            .await
            .unwrap();
        assert_eq!(summary.archived, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(catalog.rows().await.len(), 1);
        assert_eq!(source.committed().await, 2);
    }

    #[test]
    fn test_unknown_scenario_is_a_config_error() {
        let config = mock_config(&[("SOURCE_MOCK_SCENARIOS", "sideways")]);
        assert!(build_source(&config.source).is_err());
    }
}
