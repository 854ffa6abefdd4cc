use std::collections::BTreeSet;

use crate::{
    catalog::{Catalog, CatalogError, CatalogRow, RowFilter},
    identity::checksum,
    store::{ObjectStore, StoreError},
    types::{Annotations, Metadata},
};

/// Catalog lookup used to recognize a message that was already archived.
pub fn identity_filter(annotations: &Annotations, metadata: &Metadata) -> RowFilter {
    if annotations.is_client_uuid {
        RowFilter::Uuid(annotations.text_uuid.clone())
    } else {
        // a server uuid changes on every redelivery, so match on content instead
        RowFilter::Content {
            topic: metadata.topic.clone(),
            timestamp: metadata.timestamp,
            message_crc32: annotations.message_crc32,
        }
    }
}

/// Whether this message already has a catalog row. Read only.
pub async fn is_duplicate(
    catalog: &dyn Catalog,
    annotations: &Annotations,
    metadata: &Metadata,
) -> Result<bool, CatalogError> {
    catalog
        .exists(&identity_filter(annotations, metadata))
        .await
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentVerdict {
    /// Every bundle decoded to the same payload checksum.
    Identical { message_crc32: u32 },
    /// At least two bundles carry different payloads.
    Differs { checksums: Vec<u32> },
    /// A bundle could not be read or decoded.
    Unreadable { key: String, reason: String },
}

/// Fetches the bundles behind a candidate duplicate set and compares their decoded
/// payload checksums. Slower than [`is_duplicate`]; meant for audits.
pub async fn confirm_identical_content(
    store: &ObjectStore,
    rows: &[CatalogRow],
) -> Result<ContentVerdict, StoreError> {
    let mut checksums = BTreeSet::new();
    for row in rows {
        let bundle = match store.get_bundle(&row.bucket, &row.key).await {
            Ok(bundle) => bundle,
            Err(e @ (StoreError::NotFound(_) | StoreError::Bundle(_))) => {
                return Ok(ContentVerdict::Unreadable {
                    key: row.key.clone(),
                    reason: e.to_string(),
                })
            }
            Err(e) => return Err(e),
        };
        checksums.insert(checksum(&bundle.message.content));
    }

    let checksums: Vec<u32> = checksums.into_iter().collect();
    match checksums.as_slice() {
        [] => Ok(ContentVerdict::Identical { message_crc32: 0 }),
        [only] => Ok(ContentVerdict::Identical {
            message_crc32: *only,
        }),
        _ => Ok(ContentVerdict::Differs { checksums }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        catalog::{MemoryCatalog, NewCatalogRow},
        store::MemoryObjectClient,
        types::Message,
    };

    fn annotations(uuid: &str, is_client_uuid: bool, payload: &[u8]) -> Annotations {
        Annotations {
            text_uuid: uuid.to_string(),
            is_client_uuid,
            message_crc32: checksum(payload),
        }
    }

    fn metadata(topic: &str, timestamp: i64) -> Metadata {
        Metadata {
            topic: topic.to_string(),
            timestamp,
            headers: vec![],
        }
    }

    async fn archive(
        store: &ObjectStore,
        catalog: &MemoryCatalog,
        payload: &[u8],
        annotations: &Annotations,
        metadata: &Metadata,
    ) -> CatalogRow {
        let message = Message::new("blob", payload.to_vec());
        let stored = store.store(&message, metadata, annotations).await.unwrap();
        let row = NewCatalogRow::new(metadata, &stored).unwrap();
        let id = catalog.insert(&row).await.unwrap();
        catalog
            .query(&RowFilter::Ids(vec![id]))
            .await
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn test_client_uuid_duplicate_by_uuid_only() {
        let catalog = MemoryCatalog::new();
        let store = ObjectStore::new(Arc::new(MemoryObjectClient::new()), "archive", None);
        let first = annotations("u1", true, b"a");
        archive(&store, &catalog, b"a", &first, &metadata("t1", 1000)).await;

        // same uuid, different topic and payload: still the same logical event
        let again = annotations("u1", true, b"b");
        assert!(is_duplicate(&catalog, &again, &metadata("t9", 5)).await.unwrap());
        let other = annotations("u2", true, b"a");
        assert!(!is_duplicate(&catalog, &other, &metadata("t1", 1000)).await.unwrap());
    }

    #[tokio::test]
    async fn test_server_uuid_duplicate_by_content() {
        let catalog = MemoryCatalog::new();
        let store = ObjectStore::new(Arc::new(MemoryObjectClient::new()), "archive", None);
        let first = annotations("s1", false, b"x");
        archive(&store, &catalog, b"x", &first, &metadata("t2", 2000)).await;

        let redelivered = annotations("s2", false, b"x");
        assert!(is_duplicate(&catalog, &redelivered, &metadata("t2", 2000)).await.unwrap());
        assert!(!is_duplicate(&catalog, &redelivered, &metadata("t2", 2001)).await.unwrap());
        let changed = annotations("s3", false, b"y");
        assert!(!is_duplicate(&catalog, &changed, &metadata("t2", 2000)).await.unwrap());
    }

    #[tokio::test]
    async fn test_confirm_identical_content() {
        let catalog = MemoryCatalog::new();
        let store = ObjectStore::new(Arc::new(MemoryObjectClient::new()), "archive", None);
        let m = metadata("t2", 2000);
        let a = archive(&store, &catalog, b"x", &annotations("s1", false, b"x"), &m).await;
        let b = archive(&store, &catalog, b"x", &annotations("s2", false, b"x"), &m).await;
        let c = archive(&store, &catalog, b"y", &annotations("s3", false, b"y"), &m).await;

        assert_eq!(
            confirm_identical_content(&store, &[a.clone(), b.clone()]).await.unwrap(),
            ContentVerdict::Identical {
                message_crc32: checksum(b"x")
            }
        );
        assert!(matches!(
            confirm_identical_content(&store, &[a.clone(), c]).await.unwrap(),
            ContentVerdict::Differs { .. }
        ));

        let mut missing = b;
        missing.key = "t2/1970/1/1/0/gone.bundle".to_string();
        assert!(matches!(
            confirm_identical_content(&store, &[a, missing]).await.unwrap(),
            ContentVerdict::Unreadable { .. }
        ));
    }
}
