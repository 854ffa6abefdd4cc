use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{info, warn};

use super::{AuditError, Auditor};
use crate::{
    catalog::RowFilter,
    source::StreamSource,
    store::{is_disposable, keys::topic_prefix, StoreError},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanSummary {
    pub rows_deleted: u64,
    pub objects_deleted: u64,
    pub versions_deleted: u64,
}

impl Auditor {
    /// Removes every catalog row and every stored version for the given test topics,
    /// including objects that never reached the catalog. Refuses before deleting
    /// anything if a key is not clearly a test or mock artifact.
    pub async fn clean_test_data(&self, topics: &[String]) -> Result<CleanSummary, AuditError> {
        let mut summary = CleanSummary::default();
        for topic in topics {
            let mut keys: BTreeSet<String> = self
                .catalog
                .query(&RowFilter::Topic(topic.clone()))
                .await?
                .into_iter()
                .map(|row| row.key)
                .collect();
            keys.extend(
                self.store
                    .list_object_versions(&topic_prefix(topic, None))
                    .await?
                    .into_iter()
                    .map(|version| version.key),
            );

            for key in &keys {
                if let Some(bucket) = self.store.buckets().find(|b| !is_disposable(b, key)) {
                    return Err(StoreError::DeepDeleteRefused {
                        bucket: bucket.to_string(),
                        key: key.clone(),
                    }
                    .into());
                }
            }

            // rows first: an interrupted clean leaves orphaned objects, never dangling rows
            let rows = self.catalog.delete(&RowFilter::Topic(topic.clone())).await?;
            summary.rows_deleted += rows;
            for key in &keys {
                let versions = self.store.deep_delete_everywhere(key).await?;
                if versions > 0 {
                    summary.objects_deleted += 1;
                    summary.versions_deleted += versions as u64;
                }
            }
            info!(topic, rows, objects = keys.len(), "Cleaned test topic");
        }
        Ok(summary)
    }
}

/// Acknowledges every message left on a bounded source without archiving it.
/// Returns the number of messages drained.
pub async fn drain(source: &mut dyn StreamSource) -> Result<u64, AuditError> {
    source.connect().await?;
    let mut drained = 0;
    let result = async {
        while let Some(received) = source.next_message().await? {
            source.mark_done(&received.token).await?;
            drained += 1;
        }
        Ok::<_, AuditError>(())
    }
    .await;
    if let Err(e) = source.close().await {
        warn!("Failed to close source after drain: {e:#}");
    }
    result?;
    info!(drained, "Drained source");
    Ok(drained)
}
