use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use thiserror::Error;
use tracing::{info, warn};

use crate::{
    identity::checksum,
    metrics_const::{BUNDLES_STORED, BUNDLE_BYTES_STORED, DEEP_DELETED_VERSIONS},
    types::{Annotations, Bundle, Message, Metadata, StoreInfo, StoredAnnotations},
};

pub mod bundle;
pub mod client;
pub mod keys;
pub mod memory;

pub use bundle::{BundleError, BUNDLE_EXTENSION};
pub use client::{ObjectClient, ObjectVersion, S3Impl};
pub use keys::key_for;
pub use memory::MemoryObjectClient;

// Always log the first few writes, then every `log_every`.
const ALWAYS_LOG_FIRST: u64 = 5;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Store operation failed: {0}")]
    OperationFailed(String),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error("Refusing to deep delete {bucket}/{key}: not a test or mock artifact")]
    DeepDeleteRefused { bucket: String, key: String },
    #[error("Read-back of {key} does not match what was stored: {reason}")]
    VerifyMismatch { key: String, reason: String },
}

/// Existence and size of an object, fetched without its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectSummary {
    pub exists: bool,
    pub size: u64,
}

/// Writes and reads message bundles in a primary bucket, with an optional backup
/// bucket that deep deletes also cover.
pub struct ObjectStore {
    client: Arc<dyn ObjectClient>,
    primary_bucket: String,
    backup_bucket: Option<String>,
    log_every: u64,
    n_stored: AtomicU64,
}

impl ObjectStore {
    pub fn new(
        client: Arc<dyn ObjectClient>,
        primary_bucket: impl Into<String>,
        backup_bucket: Option<String>,
    ) -> Self {
        Self {
            client,
            primary_bucket: primary_bucket.into(),
            backup_bucket,
            log_every: 100,
            n_stored: AtomicU64::new(0),
        }
    }

    pub fn with_log_every(mut self, log_every: u64) -> Self {
        self.log_every = log_every.max(1);
        self
    }

    pub fn primary_bucket(&self) -> &str {
        &self.primary_bucket
    }

    pub fn buckets(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary_bucket.as_str()).chain(self.backup_bucket.as_deref())
    }

    pub fn n_stored(&self) -> u64 {
        self.n_stored.load(Ordering::Relaxed)
    }

    /// Serializes the bundle and puts it at its derived key in the primary bucket.
    pub async fn store(
        &self,
        message: &Message,
        metadata: &Metadata,
        annotations: &Annotations,
    ) -> Result<StoredAnnotations, StoreError> {
        if !keys::in_calendar_range(metadata.timestamp) {
            warn!(
                topic = %metadata.topic,
                timestamp = metadata.timestamp,
                "Timestamp has no calendar date, clamping it in the object key"
            );
        }
        let key = key_for(&metadata.topic, metadata.timestamp, &annotations.text_uuid);
        let bundle = Bundle {
            message: message.clone(),
            metadata: metadata.clone(),
            annotations: annotations.clone(),
        };
        let body = bundle::encode(&bundle)?;
        let size = body.len() as u64;
        let bundle_crc32 = checksum(&body);

        self.client
            .put_object(&self.primary_bucket, &key, body)
            .await?;

        metrics::counter!(BUNDLES_STORED).increment(1);
        metrics::counter!(BUNDLE_BYTES_STORED).increment(size);
        let n_stored = self.n_stored.fetch_add(1, Ordering::Relaxed) + 1;
        if n_stored <= ALWAYS_LOG_FIRST || n_stored % self.log_every == 0 {
            info!(
                n_stored,
                bucket = %self.primary_bucket,
                key = %key,
                size,
                "Stored bundle"
            );
        }

        Ok(StoredAnnotations {
            identity: annotations.clone(),
            store: StoreInfo {
                size,
                key,
                bucket: self.primary_bucket.clone(),
                bundle_crc32,
            },
        })
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        self.client.get_object(bucket, key).await
    }

    pub async fn get_bundle(&self, bucket: &str, key: &str) -> Result<Bundle, StoreError> {
        let body = self.get_object(bucket, key).await?;
        Ok(bundle::decode(&body)?)
    }

    /// Missing objects are reported as `exists: false`, not as an error.
    pub async fn get_object_summary(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<ObjectSummary, StoreError> {
        Ok(match self.client.head_object(bucket, key).await? {
            Some(size) => ObjectSummary { exists: true, size },
            None => ObjectSummary {
                exists: false,
                size: 0,
            },
        })
    }

    /// Every version and delete marker under `prefix` in the primary bucket.
    pub async fn list_object_versions(
        &self,
        prefix: &str,
    ) -> Result<Vec<ObjectVersion>, StoreError> {
        self.client
            .list_object_versions(&self.primary_bucket, prefix)
            .await
    }

    /// Reads a freshly stored bundle back and checks it against what was written.
    pub async fn verify_stored(
        &self,
        message: &Message,
        metadata: &Metadata,
        stored: &StoredAnnotations,
    ) -> Result<(), StoreError> {
        let key = &stored.store.key;
        let body = self.get_object(&stored.store.bucket, key).await?;
        let mismatch = |reason: &str| StoreError::VerifyMismatch {
            key: key.clone(),
            reason: reason.to_string(),
        };
        if body.len() as u64 != stored.store.size {
            return Err(mismatch("size"));
        }
        if checksum(&body) != stored.store.bundle_crc32 {
            return Err(mismatch("bundle checksum"));
        }
        let bundle = bundle::decode(&body)?;
        if &bundle.message != message {
            return Err(mismatch("message"));
        }
        if &bundle.metadata != metadata {
            return Err(mismatch("metadata"));
        }
        if bundle.annotations != stored.identity {
            return Err(mismatch("annotations"));
        }
        Ok(())
    }

    /// Removes every version and delete marker of exactly `key` from `bucket`.
    /// Only allowed for test and mock artifacts. Returns the number of versions removed.
    pub async fn deep_delete(&self, bucket: &str, key: &str) -> Result<usize, StoreError> {
        if !is_disposable(bucket, key) {
            return Err(StoreError::DeepDeleteRefused {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        let versions = self.client.list_object_versions(bucket, key).await?;
        let mut removed = 0;
        for version in versions.iter().filter(|v| v.key == key) {
            self.client
                .delete_object_version(bucket, key, version.version_id.as_deref())
                .await?;
            removed += 1;
        }
        metrics::counter!(DEEP_DELETED_VERSIONS).increment(removed as u64);
        if removed == 0 {
            warn!(bucket, key, "Deep delete found nothing to remove");
        } else {
            info!(bucket, key, removed, "Deep deleted object versions");
        }
        Ok(removed)
    }

    /// Deep delete across the primary and backup buckets.
    pub async fn deep_delete_everywhere(&self, key: &str) -> Result<usize, StoreError> {
        let mut removed = 0;
        for bucket in self.buckets() {
            removed += self.deep_delete(bucket, key).await?;
        }
        Ok(removed)
    }
}

const DISPOSABLE_TOPIC_MARKERS: [&str; 2] = ["test", "mock"];
const DISPOSABLE_BUCKET_MARKERS: [&str; 3] = ["test", "mock", "devel"];

/// Keys and buckets that clearly hold test or mock artifacts: a non-production bucket
/// and a key whose topic has a `test` or `mock` component, such as `archive.test`.
pub fn is_disposable(bucket: &str, key: &str) -> bool {
    let topic = key.split('/').next().unwrap_or_default();
    let test_topic = topic
        .split(['.', '-', '_'])
        .any(|part| DISPOSABLE_TOPIC_MARKERS.contains(&part));
    let test_bucket = bucket
        .split(['.', '-', '_'])
        .any(|part| DISPOSABLE_BUCKET_MARKERS.contains(&part));
    test_topic && test_bucket
}
