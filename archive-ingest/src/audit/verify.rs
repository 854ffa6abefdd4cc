use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use super::{Anomaly, AuditError, AuditReport, Auditor};
use crate::{
    catalog::RowFilter,
    store::{keys::topic_prefix, ObjectVersion},
};

impl Auditor {
    /// Catalog rows whose object is missing or whose recorded size differs.
    /// `sample` limits the check to a random subset of rows.
    pub async fn verify_db_to_store(
        &self,
        topic_like: &str,
        sample: Option<i64>,
    ) -> Result<AuditReport, AuditError> {
        let rows = self
            .catalog
            .query(&RowFilter::TopicLike {
                pattern: topic_like.to_string(),
                sample,
            })
            .await?;

        let mut report = AuditReport::default();
        for row in rows {
            report.checked += 1;
            let summary = self.store.get_object_summary(&row.bucket, &row.key).await?;
            if !summary.exists {
                report.push(Anomaly::MissingObject {
                    bucket: row.bucket,
                    key: row.key,
                });
            } else if u64::try_from(row.size).ok() != Some(summary.size) {
                report.push(Anomaly::SizeMismatch {
                    key: row.key,
                    catalog_size: row.size,
                    object_size: summary.size,
                });
            } else {
                debug!(key = row.key, "key is ok");
            }
        }
        info!(
            checked = report.checked,
            anomalies = report.anomalies.len(),
            "Verified catalog against store"
        );
        Ok(report)
    }

    /// Objects under each cataloged topic (optionally one month of it) that have no
    /// catalog row, a different size, or more than one stored version. A pattern
    /// without wildcards is also listed when the catalog has never seen that topic.
    pub async fn verify_store_to_db(
        &self,
        topic_like: &str,
        year_month: Option<(i32, u32)>,
    ) -> Result<AuditReport, AuditError> {
        let mut topics: BTreeSet<String> =
            self.catalog.topics(topic_like).await?.into_iter().collect();
        if is_literal_topic(topic_like) {
            topics.insert(topic_like.to_string());
        }

        let mut report = AuditReport::default();
        for topic in topics {
            let prefix = topic_prefix(&topic, year_month);
            let versions = self.store.list_object_versions(&prefix).await?;

            let mut by_key: BTreeMap<&str, Vec<&ObjectVersion>> = BTreeMap::new();
            for version in &versions {
                by_key.entry(version.key.as_str()).or_default().push(version);
            }

            for (key, versions) in by_key {
                let Some(latest) = versions
                    .iter()
                    .find(|v| v.is_latest && !v.is_delete_marker)
                else {
                    // deleted
                    continue;
                };
                report.checked += 1;

                let written = versions.iter().filter(|v| !v.is_delete_marker).count();
                if written > 1 {
                    report.push(Anomaly::MultipleVersions {
                        key: key.to_string(),
                        versions: written,
                    });
                }

                let rows = self.catalog.query(&RowFilter::Key(key.to_string())).await?;
                match rows.first() {
                    None => report.push(Anomaly::Uncataloged {
                        key: key.to_string(),
                    }),
                    Some(row) if u64::try_from(row.size).ok() != Some(latest.size) => {
                        report.push(Anomaly::SizeMismatch {
                            key: key.to_string(),
                            catalog_size: row.size,
                            object_size: latest.size,
                        })
                    }
                    Some(_) => {}
                }
            }
            info!(topic, prefix, "Verified store prefix against catalog");
        }
        Ok(report)
    }
}

fn is_literal_topic(pattern: &str) -> bool {
    !pattern.is_empty() && !pattern.contains(['%', '_', '\\'])
}
