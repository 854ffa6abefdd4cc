use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    client::{ObjectClient, ObjectVersion},
    StoreError,
};

struct StoredVersion {
    version_id: String,
    // None is a delete marker
    body: Option<Vec<u8>>,
}

/// Versioned in-memory bucket store, behaving like a versioning-enabled S3 bucket.
/// Always available so services and tests can run without infrastructure.
#[derive(Default)]
pub struct MemoryObjectClient {
    objects: Mutex<BTreeMap<(String, String), Vec<StoredVersion>>>,
    next_version: AtomicU64,
    puts: AtomicU64,
    fail_puts: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryObjectClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent put fail until reset.
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent get/head/list fail until reset.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Number of successful puts since creation.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    /// Keys whose latest version is live.
    pub async fn live_keys(&self, bucket: &str) -> Vec<String> {
        let objects = self.objects.lock().await;
        objects
            .iter()
            .filter(|((b, _), versions)| {
                b == bucket && versions.last().is_some_and(|v| v.body.is_some())
            })
            .map(|((_, k), _)| k.clone())
            .collect()
    }

    fn check_reads(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::OperationFailed("injected read failure".to_string()));
        }
        Ok(())
    }

    fn version_id(&self) -> String {
        format!("v{}", self.next_version.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ObjectClient for MemoryObjectClient {
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StoreError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::OperationFailed("injected put failure".to_string()));
        }
        let version_id = self.version_id();
        self.objects
            .lock()
            .await
            .entry((bucket.to_string(), key.to_string()))
            .or_default()
            .push(StoredVersion {
                version_id,
                body: Some(body),
            });
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        self.check_reads()?;
        let objects = self.objects.lock().await;
        objects
            .get(&(bucket.to_string(), key.to_string()))
            .and_then(|versions| versions.last())
            .and_then(|v| v.body.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<u64>, StoreError> {
        self.check_reads()?;
        let objects = self.objects.lock().await;
        Ok(objects
            .get(&(bucket.to_string(), key.to_string()))
            .and_then(|versions| versions.last())
            .and_then(|v| v.body.as_ref())
            .map(|body| body.len() as u64))
    }

    async fn list_object_versions(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectVersion>, StoreError> {
        self.check_reads()?;
        let objects = self.objects.lock().await;
        let mut listed = Vec::new();
        for ((b, key), versions) in objects.iter() {
            if b != bucket || !key.starts_with(prefix) {
                continue;
            }
            let latest = versions.len().saturating_sub(1);
            for (i, v) in versions.iter().enumerate().rev() {
                listed.push(ObjectVersion {
                    key: key.clone(),
                    version_id: Some(v.version_id.clone()),
                    size: v.body.as_ref().map_or(0, |body| body.len() as u64),
                    is_latest: i == latest,
                    is_delete_marker: v.body.is_none(),
                });
            }
        }
        Ok(listed)
    }

    async fn delete_object_version(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let map_key = (bucket.to_string(), key.to_string());
        let mut objects = self.objects.lock().await;
        match version_id {
            Some(id) => {
                if let Some(versions) = objects.get_mut(&map_key) {
                    versions.retain(|v| v.version_id != id);
                    if versions.is_empty() {
                        objects.remove(&map_key);
                    }
                }
            }
            None => {
                let version_id = self.version_id();
                objects.entry(map_key).or_default().push(StoredVersion {
                    version_id,
                    body: None,
                });
            }
        }
        Ok(())
    }
}
