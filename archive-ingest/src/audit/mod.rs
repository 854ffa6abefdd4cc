//! Offline consistency checks between the catalog and the object store.
//!
//! Every check returns an [`AuditReport`]; the CLI prints one line per anomaly and
//! exits with the anomaly count.

use std::{fmt, sync::Arc};

use serde::Serialize;
use thiserror::Error;

use crate::{
    catalog::{Catalog, CatalogError},
    source::SourceError,
    store::{ObjectStore, StoreError},
};

pub mod clean;
pub mod duplicates;
pub mod inspect;
pub mod status;
pub mod verify;

pub use clean::{drain, CleanSummary};
pub use inspect::InspectedObject;
pub use status::StatusSection;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Source error: {0}")]
    Source(#[from] SourceError),
    #[error("No catalog row for uuid {0}")]
    UnknownUuid(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "anomaly", rename_all = "snake_case")]
pub enum Anomaly {
    /// Catalog row whose object is gone.
    MissingObject { bucket: String, key: String },
    SizeMismatch {
        key: String,
        catalog_size: i64,
        object_size: u64,
    },
    /// Stored object no catalog row points at.
    Uncataloged { key: String },
    /// Stored object that was written more than once.
    MultipleVersions { key: String, versions: usize },
    UnreadableBundle { key: String, reason: String },
    DuplicateCandidate {
        identity: String,
        ids: Vec<i64>,
        verdict: Option<String>,
    },
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::MissingObject { bucket, key } => {
                write!(f, "object does not exist: {bucket}/{key}")
            }
            Anomaly::SizeMismatch {
                key,
                catalog_size,
                object_size,
            } => write!(
                f,
                "size mismatch: {key} (catalog {catalog_size}, object {object_size})"
            ),
            Anomaly::Uncataloged { key } => write!(f, "object not in catalog: {key}"),
            Anomaly::MultipleVersions { key, versions } => {
                write!(f, "object has {versions} versions: {key}")
            }
            Anomaly::UnreadableBundle { key, reason } => {
                write!(f, "bundle unreadable: {key}: {reason}")
            }
            Anomaly::DuplicateCandidate {
                identity,
                ids,
                verdict,
            } => {
                write!(f, "duplicate candidate {identity}: rows {ids:?}")?;
                if let Some(verdict) = verdict {
                    write!(f, " ({verdict})")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub checked: u64,
    pub anomalies: Vec<Anomaly>,
}

impl AuditReport {
    fn push(&mut self, anomaly: Anomaly) {
        self.anomalies.push(anomaly);
    }

    /// Anomaly count as a process exit status. Saturates so a count never wraps to success.
    pub fn exit_code(&self) -> u8 {
        u8::try_from(self.anomalies.len()).unwrap_or(u8::MAX)
    }
}

/// Runs audit checks against one store and one catalog.
pub struct Auditor {
    store: Arc<ObjectStore>,
    catalog: Arc<dyn Catalog>,
}

impl Auditor {
    pub fn new(store: Arc<ObjectStore>, catalog: Arc<dyn Catalog>) -> Self {
        Self { store, catalog }
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn catalog(&self) -> &dyn Catalog {
        self.catalog.as_ref()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_saturates() {
        let mut report = AuditReport::default();
        assert_eq!(report.exit_code(), 0);
        for n in 0..300 {
            report.push(Anomaly::Uncataloged {
                key: format!("t/{n}"),
            });
        }
        assert_eq!(report.exit_code(), 255);
    }

    #[test]
    fn test_anomaly_lines() {
        let missing = Anomaly::MissingObject {
            bucket: "b".to_string(),
            key: "t/2024/3/5/7/u.bundle".to_string(),
        };
        assert_eq!(
            missing.to_string(),
            "object does not exist: b/t/2024/3/5/7/u.bundle"
        );
        let dup = Anomaly::DuplicateCandidate {
            identity: "u".to_string(),
            ids: vec![1, 2],
            verdict: Some("identical".to_string()),
        };
        assert_eq!(dup.to_string(), "duplicate candidate u: rows [1, 2] (identical)");
    }

    #[test]
    fn test_anomaly_json_is_tagged() {
        let mismatch = Anomaly::SizeMismatch {
            key: "t/u.bundle".to_string(),
            catalog_size: 10,
            object_size: 12,
        };
        assert_eq!(
            serde_json::to_value(&mismatch).unwrap(),
            serde_json::json!({
                "anomaly": "size_mismatch",
                "key": "t/u.bundle",
                "catalog_size": 10,
                "object_size": 12,
            })
        );
    }
}
