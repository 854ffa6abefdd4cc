use std::{future::Future, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::{
    catalog::{Catalog, CatalogError, NewCatalogRow},
    decision::is_duplicate,
    identity,
    metrics_const::{
        DUPLICATES_SKIPPED, MESSAGES_ARCHIVED, MESSAGES_REJECTED, PROCESSING_DURATION,
        PROCESSING_FAILURES, SERVER_IDENTITIES,
    },
    source::{ReceivedMessage, SourceError, StreamSource},
    store::{ObjectStore, StoreError},
    types::{Message, Metadata},
};

/// Where a message is in its processing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Identified,
    DuplicateChecked,
    Skipped,
    Stored,
    Cataloged,
    Committed,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Duplicate check failed: {0}")]
    DuplicateCheck(#[source] CatalogError),
    #[error("Store failed: {0}")]
    Store(#[source] StoreError),
    #[error("Catalog insert failed: {0}")]
    Catalog(#[source] CatalogError),
    #[error("Read-back verification failed: {0}")]
    Verify(#[source] StoreError),
    #[error("Mark done failed: {0}")]
    Commit(#[source] SourceError),
    #[error("Processing did not finish within {0:?}")]
    Timeout(Duration),
}

impl PipelineError {
    /// The last stage the message reached before the failure.
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::DuplicateCheck(_) => Stage::Identified,
            PipelineError::Store(_) => Stage::DuplicateChecked,
            PipelineError::Catalog(_) => Stage::Stored,
            PipelineError::Verify(_) | PipelineError::Commit(_) => Stage::Cataloged,
            PipelineError::Timeout(_) => Stage::Received,
        }
    }

    /// Data-integrity failures repeat on every redelivery; everything else is infra
    /// and may clear after a reconnect.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            PipelineError::Verify(StoreError::VerifyMismatch { .. })
                | PipelineError::Verify(StoreError::Bundle(_))
                | PipelineError::Store(StoreError::Bundle(_))
                | PipelineError::Catalog(CatalogError::OutOfRange { .. })
        )
    }
}

/// How one message left the pipeline, before its offset was committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Archived { id: i64, key: String },
    Skipped { is_client_uuid: bool },
    /// A data failure that redelivery cannot fix. Acknowledged without a complete archive.
    Rejected { stage: Stage, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub archived: u64,
    pub skipped: u64,
    pub rejected: u64,
    pub failures: u64,
    pub connects: u64,
}

impl RunSummary {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Archived { .. } => self.archived += 1,
            Outcome::Skipped { .. } => self.skipped += 1,
            Outcome::Rejected { .. } => self.rejected += 1,
        }
    }
}

enum SessionEnd {
    EndOfStream,
    Shutdown,
    Failed,
}

/// Single-worker archiving loop: one message end to end, then the next.
pub struct Pipeline {
    store: Arc<ObjectStore>,
    catalog: Arc<dyn Catalog>,
    message_timeout: Duration,
    verify_after_store: bool,
    reconnect_backoff: Duration,
    max_reconnect_backoff: Duration,
}

impl Pipeline {
    pub fn new(store: Arc<ObjectStore>, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            store,
            catalog,
            message_timeout: Duration::from_secs(30),
            verify_after_store: false,
            reconnect_backoff: Duration::from_secs(1),
            max_reconnect_backoff: Duration::from_secs(60),
        }
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn with_verify_after_store(mut self, verify: bool) -> Self {
        self.verify_after_store = verify;
        self
    }

    pub fn with_reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_backoff = initial;
        self.max_reconnect_backoff = max.max(initial);
        self
    }

    /// Identifies, dedups, stores and catalogs one message. Does not commit.
    pub async fn process(
        &self,
        message: &Message,
        metadata: &Metadata,
    ) -> Result<Outcome, PipelineError> {
        let annotations = identity::annotate(message, metadata);
        Span::current().record("uuid", annotations.text_uuid.as_str());
        if !annotations.is_client_uuid {
            metrics::counter!(SERVER_IDENTITIES).increment(1);
        }

        let duplicate = is_duplicate(self.catalog.as_ref(), &annotations, metadata)
            .await
            .map_err(PipelineError::DuplicateCheck)?;
        if duplicate {
            let kind = if annotations.is_client_uuid { "client" } else { "server" };
            metrics::counter!(DUPLICATES_SKIPPED, "identity" => kind).increment(1);
            debug!(identity = kind, "Duplicate acknowledged without storing");
            return Ok(Outcome::Skipped {
                is_client_uuid: annotations.is_client_uuid,
            });
        }

        let stored = self
            .store
            .store(message, metadata, &annotations)
            .await
            .map_err(PipelineError::Store)?;

        let row = NewCatalogRow::new(metadata, &stored).map_err(PipelineError::Catalog)?;
        let id = self
            .catalog
            .insert(&row)
            .await
            .map_err(PipelineError::Catalog)?;

        if self.verify_after_store {
            self.store
                .verify_stored(message, metadata, &stored)
                .await
                .map_err(PipelineError::Verify)?;
        }

        metrics::counter!(MESSAGES_ARCHIVED).increment(1);
        Ok(Outcome::Archived {
            id,
            key: stored.store.key,
        })
    }

    /// Processes one received message and, only if that succeeded, marks it done.
    /// A data failure is logged and acknowledged so it cannot stall the stream.
    pub async fn handle(
        &self,
        source: &mut dyn StreamSource,
        received: &ReceivedMessage,
    ) -> Result<Outcome, PipelineError> {
        let span = info_span!(
            "archive",
            topic = %received.metadata.topic,
            timestamp = received.metadata.timestamp,
            uuid = tracing::field::Empty,
        );
        let start = Instant::now();

        let result = tokio::time::timeout(self.message_timeout, async {
            let outcome = self.process(&received.message, &received.metadata).await?;
            source
                .mark_done(&received.token)
                .await
                .map_err(PipelineError::Commit)?;
            Ok::<_, PipelineError>(outcome)
        })
        .instrument(span.clone())
        .await
        .unwrap_or(Err(PipelineError::Timeout(self.message_timeout)));

        metrics::histogram!(PROCESSING_DURATION).record(start.elapsed().as_secs_f64());
        let e = match result {
            Ok(outcome) => return Ok(outcome),
            Err(e) => e,
        };
        let stage = format!("{:?}", e.stage());
        let class = if e.is_transient() { "transient" } else { "data" };
        metrics::counter!(PROCESSING_FAILURES, "stage" => stage, "class" => class).increment(1);
        if e.is_transient() {
            span.in_scope(|| error!("Message processing aborted, offset left uncommitted: {e:#}"));
            return Err(e);
        }
        self.reject(source, received, e).instrument(span).await
    }

    async fn reject(
        &self,
        source: &mut dyn StreamSource,
        received: &ReceivedMessage,
        cause: PipelineError,
    ) -> Result<Outcome, PipelineError> {
        error!(
            partition = received.token.partition(),
            offset = received.token.offset(),
            format = %received.message.format,
            size = received.message.content.len(),
            headers = ?received.metadata.headers,
            "Message cannot be archived, acknowledging it: {cause:#}"
        );
        source
            .mark_done(&received.token)
            .await
            .map_err(PipelineError::Commit)?;
        let stage = cause.stage();
        metrics::counter!(MESSAGES_REJECTED, "stage" => format!("{stage:?}")).increment(1);
        Ok(Outcome::Rejected {
            stage,
            reason: cause.to_string(),
        })
    }

    /// Runs sessions until the stream ends or `shutdown` resolves, reconnecting with
    /// backoff after any failure so uncommitted messages are read again.
    pub async fn run(
        &self,
        source: &mut dyn StreamSource,
        shutdown: impl Future<Output = ()>,
    ) -> RunSummary {
        tokio::pin!(shutdown);
        let mut summary = RunSummary::default();
        let mut backoff = self.reconnect_backoff;

        loop {
            let end = match source.connect().await {
                Ok(()) => {
                    summary.connects += 1;
                    self.run_session(source, &mut shutdown, &mut summary, &mut backoff)
                        .await
                }
                Err(e) => {
                    error!("Failed to connect stream source: {e:#}");
                    SessionEnd::Failed
                }
            };
            if let Err(e) = source.close().await {
                warn!("Failed to close stream source: {e:#}");
            }

            match end {
                SessionEnd::EndOfStream => {
                    info!(?summary, "Stream exhausted");
                    return summary;
                }
                SessionEnd::Shutdown => {
                    info!(?summary, "Pipeline shut down");
                    return summary;
                }
                SessionEnd::Failed => {
                    warn!(?backoff, "Reconnecting after failure");
                    tokio::select! {
                        _ = &mut shutdown => {
                            info!(?summary, "Pipeline shut down while backing off");
                            return summary;
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.max_reconnect_backoff);
                }
            }
        }
    }

    async fn run_session<F: Future<Output = ()>>(
        &self,
        source: &mut dyn StreamSource,
        shutdown: &mut std::pin::Pin<&mut F>,
        summary: &mut RunSummary,
        backoff: &mut Duration,
    ) -> SessionEnd {
        loop {
            let next = tokio::select! {
                _ = shutdown.as_mut() => return SessionEnd::Shutdown,
                next = source.next_message() => next,
            };
            let received = match next {
                Ok(Some(received)) => received,
                Ok(None) => return SessionEnd::EndOfStream,
                Err(e) => {
                    error!("Stream source failed: {e:#}");
                    summary.failures += 1;
                    return SessionEnd::Failed;
                }
            };

            match self.handle(source, &received).await {
                Ok(outcome) => {
                    summary.record(&outcome);
                    *backoff = self.reconnect_backoff;
                }
                Err(_) => {
                    summary.failures += 1;
                    return SessionEnd::Failed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::MemoryCatalog,
        source::{MockScenario, MockSource, OffsetToken},
        store::{MemoryObjectClient, ObjectClient, ObjectVersion},
        types::{Header, IDENTITY_HEADER},
    };

    fn pipeline() -> (Pipeline, Arc<MemoryObjectClient>, Arc<MemoryCatalog>) {
        let client = Arc::new(MemoryObjectClient::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let store = Arc::new(ObjectStore::new(client.clone(), "archive-devel", None));
        (Pipeline::new(store, catalog.clone()), client, catalog)
    }

    fn message(topic: &str, timestamp: i64, headers: Vec<Header>, payload: &[u8]) -> (Message, Metadata) {
        (
            Message::from_headers(&headers, payload.to_vec()),
            Metadata {
                topic: topic.to_string(),
                timestamp,
                headers,
            },
        )
    }

    #[tokio::test]
    async fn test_process_archives_then_skips() {
        let (pipeline, client, catalog) = pipeline();
        let uuid = uuid::Uuid::new_v4();
        let (m, md) = message("t1", 1000, vec![Header::text(IDENTITY_HEADER, uuid.to_string())], b"a");

        let first = pipeline.process(&m, &md).await.unwrap();
        assert!(matches!(first, Outcome::Archived { .. }));
        let second = pipeline.process(&m, &md).await.unwrap();
        assert_eq!(second, Outcome::Skipped { is_client_uuid: true });

        assert_eq!(catalog.rows().await.len(), 1);
        assert_eq!(client.put_count(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_writes_no_row_and_commits_nothing() {
        let (pipeline, client, catalog) = pipeline();
        client.set_fail_puts(true);
        let (m, md) = message("t1", 1000, vec![], b"a");
        let mut source = MockSource::with_messages(vec![(m, md)]);
        source.connect().await.unwrap();
        let received = source.next_message().await.unwrap().unwrap();

        let result = pipeline.handle(&mut source, &received).await;
        assert!(matches!(result, Err(PipelineError::Store(_))));
        assert_eq!(result.unwrap_err().stage(), Stage::DuplicateChecked);
        assert!(catalog.rows().await.is_empty());
        assert_eq!(source.committed().await, 0);
    }

    #[tokio::test]
    async fn test_commit_failure_is_reported() {
        let (pipeline, _, _) = pipeline();
        let (m, md) = message("t1", 1000, vec![], b"a");
        let mut source = MockSource::new();
        source.connect().await.unwrap();
        let received = ReceivedMessage {
            message: m,
            metadata: md,
            token: OffsetToken::new("t1", 0, 99),
        };
        let result = pipeline.handle(&mut source, &received).await;
        assert!(matches!(result, Err(PipelineError::Commit(_))));
    }

    #[tokio::test]
    async fn test_run_reconnects_after_source_failure() {
        let (pipeline, _, catalog) = pipeline();
        let pipeline = pipeline.with_reconnect_backoff(Duration::from_millis(1), Duration::from_millis(2));
        let mut source = MockSource::with_scenarios(&MockScenario::ALL, 1_700_000_000_000);
        source.fail_next_reads(1).await;

        let summary = pipeline.run(&mut source, std::future::pending()).await;
        assert_eq!(summary.connects, 2);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.archived, 4);
        assert_eq!(summary.skipped, 4);
        assert_eq!(catalog.rows().await.len(), 4);
        assert_eq!(source.committed().await, 8);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (pipeline, _, _) = pipeline();
        let mut source = MockSource::new().unbounded();
        let summary = pipeline.run(&mut source, async {}).await;
        assert_eq!(summary, RunSummary { connects: 1, ..Default::default() });
    }

    #[tokio::test]
    async fn test_run_archives_past_out_of_range_timestamp() {
        let (pipeline, _, catalog) = pipeline();
        // a producer stamping nanoseconds instead of milliseconds
        let nanos = 1_709_622_489_000_000_000;
        let mut source = MockSource::with_messages(vec![
            message("t1", nanos, vec![], b"a"),
            message("t1", 1000, vec![], b"b"),
        ]);

        let summary = tokio::time::timeout(
            Duration::from_secs(2),
            pipeline.run(&mut source, std::future::pending()),
        )
        .await
        .unwrap();
        assert_eq!(
            summary,
            RunSummary {
                archived: 2,
                connects: 1,
                ..Default::default()
            }
        );
        assert_eq!(source.committed().await, 2);
        let rows = catalog.rows().await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp, nanos);
        assert!(rows[1].key.starts_with("t1/1970/1/1/0/"));
    }

    /// Hands back a damaged body for every key under `bad/`.
    struct DamagedReads(MemoryObjectClient);

    #[async_trait::async_trait]
    impl ObjectClient for DamagedReads {
        async fn put_object(
            &self,
            bucket: &str,
            key: &str,
            body: Vec<u8>,
        ) -> Result<(), StoreError> {
            self.0.put_object(bucket, key, body).await
        }
        async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
            let mut body = self.0.get_object(bucket, key).await?;
            if key.starts_with("bad/") {
                if let Some(last) = body.last_mut() {
                    *last ^= 0xff;
                }
            }
            Ok(body)
        }
        async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<u64>, StoreError> {
            self.0.head_object(bucket, key).await
        }
        async fn list_object_versions(
            &self,
            bucket: &str,
            prefix: &str,
        ) -> Result<Vec<ObjectVersion>, StoreError> {
            self.0.list_object_versions(bucket, prefix).await
        }
        async fn delete_object_version(
            &self,
            bucket: &str,
            key: &str,
            version_id: Option<&str>,
        ) -> Result<(), StoreError> {
            self.0.delete_object_version(bucket, key, version_id).await
        }
    }

    #[tokio::test]
    async fn test_data_failure_is_acknowledged_and_stream_moves_on() {
        let store = Arc::new(ObjectStore::new(
            Arc::new(DamagedReads(MemoryObjectClient::new())),
            "archive-devel",
            None,
        ));
        let catalog = Arc::new(MemoryCatalog::new());
        let pipeline = Pipeline::new(store, catalog.clone())
            .with_verify_after_store(true)
            .with_reconnect_backoff(Duration::from_millis(1), Duration::from_millis(2));

        let (m, md) = message("bad", 1000, vec![], b"a");
        let mut source = MockSource::with_messages(vec![(m, md)]);
        source.connect().await.unwrap();
        let received = source.next_message().await.unwrap().unwrap();
        let outcome = pipeline.handle(&mut source, &received).await.unwrap();
        assert!(matches!(
            outcome,
            Outcome::Rejected {
                stage: Stage::Cataloged,
                ref reason,
            } if reason.contains("bundle checksum")
        ));
        assert_eq!(source.committed().await, 1);

        let mut source = MockSource::with_messages(vec![
            message("bad", 2000, vec![], b"b"),
            message("t1", 2000, vec![], b"c"),
        ]);
        let summary = tokio::time::timeout(
            Duration::from_secs(2),
            pipeline.run(&mut source, std::future::pending()),
        )
        .await
        .unwrap();
        assert_eq!(
            summary,
            RunSummary {
                archived: 1,
                rejected: 1,
                connects: 1,
                ..Default::default()
            }
        );
        assert_eq!(source.committed().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wedged_catalog_times_out() {
        struct Wedged;

        #[async_trait::async_trait]
        impl Catalog for Wedged {
            async fn make_schema(&self) -> Result<(), CatalogError> {
                Ok(())
            }
            async fn insert(&self, _: &NewCatalogRow) -> Result<i64, CatalogError> {
                std::future::pending().await
            }
            async fn query(
                &self,
                _: &crate::catalog::RowFilter,
            ) -> Result<Vec<crate::catalog::CatalogRow>, CatalogError> {
                Ok(vec![])
            }
            async fn exists(&self, _: &crate::catalog::RowFilter) -> Result<bool, CatalogError> {
                Ok(false)
            }
            async fn delete(&self, _: &crate::catalog::RowFilter) -> Result<u64, CatalogError> {
                Ok(0)
            }
            async fn topics(&self, _: &str) -> Result<Vec<String>, CatalogError> {
                Ok(vec![])
            }
            async fn duplicate_groups(
                &self,
                _: crate::catalog::DuplicateKind,
                _: i64,
            ) -> Result<Vec<crate::catalog::DuplicateGroup>, CatalogError> {
                Ok(vec![])
            }
            async fn topic_stats(
                &self,
                _: i64,
            ) -> Result<Vec<crate::catalog::TopicStats>, CatalogError> {
                Ok(vec![])
            }
        }

        let store = Arc::new(ObjectStore::new(
            Arc::new(MemoryObjectClient::new()),
            "archive-devel",
            None,
        ));
        let pipeline = Pipeline::new(store, Arc::new(Wedged))
            .with_message_timeout(Duration::from_secs(5));
        let (m, md) = message("t1", 1000, vec![], b"a");
        let mut source = MockSource::with_messages(vec![(m, md)]);
        source.connect().await.unwrap();
        let received = source.next_message().await.unwrap().unwrap();

        let result = pipeline.handle(&mut source, &received).await;
        assert!(matches!(result, Err(PipelineError::Timeout(_))));
        assert_eq!(source.committed().await, 0);
    }
}
