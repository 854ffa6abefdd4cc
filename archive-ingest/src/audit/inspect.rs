use std::path::{Path, PathBuf};

use serde::Serialize;

use super::{Anomaly, AuditError, Auditor};
use crate::{
    catalog::{CatalogRow, RowFilter},
    store::{bundle, StoreError, BUNDLE_EXTENSION},
    types::Bundle,
};

/// A catalog row for a uuid and whatever could be read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InspectedObject {
    pub row: CatalogRow,
    #[serde(skip)]
    pub body: Option<Vec<u8>>,
    pub bundle: Option<Bundle>,
    pub anomaly: Option<Anomaly>,
}

impl InspectedObject {
    /// Writes the raw bundle to `dir/<uuid>.bundle` (with the row id appended when a
    /// uuid has several rows). Returns `None` when there is nothing to write.
    pub fn write_to(&self, dir: &Path, disambiguate: bool) -> Result<Option<PathBuf>, AuditError> {
        let Some(body) = &self.body else {
            return Ok(None);
        };
        let name = if disambiguate {
            format!("{}-{}.{BUNDLE_EXTENSION}", self.row.uuid, self.row.id)
        } else {
            format!("{}.{BUNDLE_EXTENSION}", self.row.uuid)
        };
        let path = dir.join(name);
        std::fs::write(&path, body)?;
        Ok(Some(path))
    }
}

impl Auditor {
    /// Catalog rows for `uuid` with their decoded bundles.
    pub async fn inspect(&self, uuid: &str) -> Result<Vec<InspectedObject>, AuditError> {
        let rows = self.catalog.query(&RowFilter::Uuid(uuid.to_string())).await?;
        if rows.is_empty() {
            return Err(AuditError::UnknownUuid(uuid.to_string()));
        }

        let mut inspected = Vec::with_capacity(rows.len());
        for row in rows {
            let mut object = InspectedObject {
                body: None,
                bundle: None,
                anomaly: None,
                row,
            };
            match self.store.get_object(&object.row.bucket, &object.row.key).await {
                Ok(body) => {
                    match bundle::decode(&body) {
                        Ok(decoded) => object.bundle = Some(decoded),
                        Err(e) => {
                            object.anomaly = Some(Anomaly::UnreadableBundle {
                                key: object.row.key.clone(),
                                reason: e.to_string(),
                            })
                        }
                    }
                    object.body = Some(body);
                }
                Err(StoreError::NotFound(_)) => {
                    object.anomaly = Some(Anomaly::MissingObject {
                        bucket: object.row.bucket.clone(),
                        key: object.row.key.clone(),
                    })
                }
                Err(e) => return Err(e.into()),
            }
            inspected.push(object);
        }
        Ok(inspected)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::fixture;
    use super::*;
    use crate::store::ObjectClient;

    const ID: &str = "7d2f6b1c-0f0e-4a4e-8c43-2b9a5d6c1e00";

    #[tokio::test]
    async fn test_inspect_decodes_and_writes_bundle() {
        let fx = fixture();
        fx.archive("t1", 1000, Some(ID), b"payload").await;

        let objects = fx.auditor.inspect(ID).await.unwrap();
        assert_eq!(objects.len(), 1);
        let object = &objects[0];
        assert!(object.anomaly.is_none());
        let decoded = object.bundle.as_ref().unwrap();
        assert_eq!(decoded.message.content, b"payload");
        assert_eq!(decoded.annotations.text_uuid, ID);

        let dir = tempfile::tempdir().unwrap();
        let path = object.write_to(dir.path(), false).unwrap().unwrap();
        assert_eq!(path.file_name().unwrap(), format!("{ID}.bundle").as_str());
        assert_eq!(
            std::fs::read(&path).unwrap().len() as i64,
            object.row.size
        );
    }

    #[tokio::test]
    async fn test_inspect_reports_missing_and_garbled_objects() {
        let fx = fixture();
        let key = fx.archive("t1", 1000, Some(ID), b"payload").await;
        fx.client
            .put_object("archive-devel", &key, b"garbage".to_vec())
            .await
            .unwrap();
        let objects = fx.auditor.inspect(ID).await.unwrap();
        assert!(matches!(
            objects[0].anomaly,
            Some(Anomaly::UnreadableBundle { .. })
        ));

        fx.client
            .delete_object_version("archive-devel", &key, None)
            .await
            .unwrap();
        let objects = fx.auditor.inspect(ID).await.unwrap();
        assert!(matches!(objects[0].anomaly, Some(Anomaly::MissingObject { .. })));
        assert!(objects[0].write_to(Path::new("."), false).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_inspect_unknown_uuid() {
        let fx = fixture();
        assert!(matches!(
            fx.auditor.inspect(ID).await,
            Err(AuditError::UnknownUuid(_))
        ));
    }
}
