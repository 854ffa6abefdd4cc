use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{primitives::ByteStream, Client as AwsS3SdkClient};
use tracing::debug;

use super::StoreError;
use crate::config::StoreConfig;

/// One version (or delete marker) of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectVersion {
    pub key: String,
    pub version_id: Option<String>,
    pub size: u64,
    pub is_latest: bool,
    pub is_delete_marker: bool,
}

/// Minimal bucket operations the archive needs. Implemented by S3 and by an in-memory store.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StoreError>;

    /// Returns `StoreError::NotFound` when the key has no live version.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Size of the live version, `None` when absent.
    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<u64>, StoreError>;

    async fn list_object_versions(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectVersion>, StoreError>;

    async fn delete_object_version(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<(), StoreError>;
}

pub struct S3Impl {
    client: AwsS3SdkClient,
}

impl S3Impl {
    pub fn new(client: AwsS3SdkClient) -> Self {
        Self { client }
    }

    pub async fn from_config(config: &StoreConfig) -> Self {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.store_region.clone()));

        if let Some(endpoint) = &config.store_endpoint {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if config.store_endpoint.is_some() {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Self::new(AwsS3SdkClient::from_conf(s3_config_builder.build()))
    }
}

#[async_trait]
impl ObjectClient for S3Impl {
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                StoreError::OperationFailed(format!("Failed to put s3://{bucket}/{key}: {e}"))
            })?;
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let error_message = format!("Failed to get s3://{bucket}/{key}: {e}");
                if let aws_sdk_s3::operation::get_object::GetObjectError::NoSuchKey(_) =
                    e.into_service_error()
                {
                    StoreError::NotFound(key.to_string())
                } else {
                    StoreError::OperationFailed(error_message)
                }
            })?;

        let body = output.body.collect().await.map_err(|e| {
            StoreError::OperationFailed(format!("Failed to read s3://{bucket}/{key} body: {e}"))
        })?;
        Ok(body.to_vec())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<u64>, StoreError> {
        let result = self.client.head_object().bucket(bucket).key(key).send().await;
        match result {
            Ok(head) => Ok(Some(
                head.content_length
                    .and_then(|len| u64::try_from(len).ok())
                    .unwrap_or(0),
            )),
            Err(e) => {
                let error_message = format!("Failed to head s3://{bucket}/{key}: {e}");
                if let aws_sdk_s3::operation::head_object::HeadObjectError::NotFound(_) =
                    e.into_service_error()
                {
                    Ok(None)
                } else {
                    Err(StoreError::OperationFailed(error_message))
                }
            }
        }
    }

    async fn list_object_versions(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectVersion>, StoreError> {
        let mut versions = Vec::new();
        let mut key_marker = None;
        let mut version_id_marker = None;
        loop {
            let output = self
                .client
                .list_object_versions()
                .bucket(bucket)
                .prefix(prefix)
                .set_key_marker(key_marker.take())
                .set_version_id_marker(version_id_marker.take())
                .send()
                .await
                .map_err(|e| {
                    StoreError::OperationFailed(format!(
                        "Failed to list versions under s3://{bucket}/{prefix}: {e}"
                    ))
                })?;

            for v in output.versions.unwrap_or_default() {
                versions.push(ObjectVersion {
                    key: v.key.unwrap_or_default(),
                    version_id: v.version_id,
                    size: v.size.and_then(|s| u64::try_from(s).ok()).unwrap_or(0),
                    is_latest: v.is_latest.unwrap_or(false),
                    is_delete_marker: false,
                });
            }
            for m in output.delete_markers.unwrap_or_default() {
                versions.push(ObjectVersion {
                    key: m.key.unwrap_or_default(),
                    version_id: m.version_id,
                    size: 0,
                    is_latest: m.is_latest.unwrap_or(false),
                    is_delete_marker: true,
                });
            }

            if !output.is_truncated.unwrap_or(false) {
                break;
            }
            key_marker = output.next_key_marker;
            version_id_marker = output.next_version_id_marker;
            debug!(bucket, prefix, ?key_marker, "Fetching next page of object versions");
        }
        Ok(versions)
    }

    async fn delete_object_version(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .set_version_id(version_id.map(str::to_string))
            .send()
            .await
            .map_err(|e| {
                StoreError::OperationFailed(format!(
                    "Failed to delete s3://{bucket}/{key} version {version_id:?}: {e}"
                ))
            })?;
        Ok(())
    }
}
