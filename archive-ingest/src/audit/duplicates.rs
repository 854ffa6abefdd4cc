use tracing::info;

use super::{Anomaly, AuditError, AuditReport, Auditor};
use crate::{
    catalog::{DuplicateKind, RowFilter},
    decision::{confirm_identical_content, ContentVerdict},
};

impl Auditor {
    /// Groups of catalog rows that share an identity: a client uuid, or for server
    /// identities `(topic, timestamp, message_crc32)`. With `confirm`, each group's
    /// bundles are fetched and their payloads compared.
    pub async fn duplicates(&self, limit: i64, confirm: bool) -> Result<AuditReport, AuditError> {
        let mut report = AuditReport::default();
        for kind in [DuplicateKind::ClientUuid, DuplicateKind::ServerContent] {
            let groups = self.catalog.duplicate_groups(kind, limit).await?;
            info!(?kind, groups = groups.len(), "Found duplicate candidates");

            for group in groups {
                report.checked += 1;
                let verdict = if confirm {
                    let rows = self.catalog.query(&RowFilter::Ids(group.ids.clone())).await?;
                    Some(describe(&confirm_identical_content(&self.store, &rows).await?))
                } else {
                    None
                };
                report.push(Anomaly::DuplicateCandidate {
                    identity: group.identity,
                    ids: group.ids,
                    verdict,
                });
            }
        }
        Ok(report)
    }
}

fn describe(verdict: &ContentVerdict) -> String {
    match verdict {
        ContentVerdict::Identical { message_crc32 } => {
            format!("identical content, crc32 {message_crc32:#010x}")
        }
        ContentVerdict::Differs { checksums } => {
            format!("content differs across {} payloads", checksums.len())
        }
        ContentVerdict::Unreadable { key, reason } => format!("unreadable {key}: {reason}"),
    }
}
