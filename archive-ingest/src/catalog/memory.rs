use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, AtomicI64, Ordering},
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    like_matches, Catalog, CatalogError, CatalogRow, DuplicateGroup, DuplicateKind,
    NewCatalogRow, RowFilter, TopicStats,
};

/// In-memory catalog with the same predicates as the Postgres one.
#[derive(Default)]
pub struct MemoryCatalog {
    rows: Mutex<Vec<CatalogRow>>,
    // last id handed out; never reused, like a sequence
    last_id: AtomicI64,
    fail_inserts: AtomicBool,
    fail_queries: AtomicBool,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    pub async fn rows(&self) -> Vec<CatalogRow> {
        self.rows.lock().await.clone()
    }

    fn check_queries(&self) -> Result<(), CatalogError> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(CatalogError::Unavailable("injected query failure".to_string()));
        }
        Ok(())
    }
}

fn row_matches(row: &CatalogRow, filter: &RowFilter) -> bool {
    match filter {
        RowFilter::Uuid(uuid) => &row.uuid == uuid,
        RowFilter::Content {
            topic,
            timestamp,
            message_crc32,
        } => {
            &row.topic == topic
                && row.timestamp == *timestamp
                && row.message_crc32 == i64::from(*message_crc32)
        }
        RowFilter::Key(key) => &row.key == key,
        RowFilter::Topic(topic) => &row.topic == topic,
        RowFilter::TopicLike { pattern, .. } => like_matches(pattern, &row.topic),
        RowFilter::Ids(ids) => ids.contains(&row.id),
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn make_schema(&self) -> Result<(), CatalogError> {
        self.check_queries()
    }

    async fn insert(&self, row: &NewCatalogRow) -> Result<i64, CatalogError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(CatalogError::Unavailable("injected insert failure".to_string()));
        }
        let mut rows = self.rows.lock().await;
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        rows.push(CatalogRow {
            id,
            topic: row.topic.clone(),
            timestamp: row.timestamp,
            uuid: row.uuid.clone(),
            size: row.size,
            key: row.key.clone(),
            bucket: row.bucket.clone(),
            crc32: row.crc32,
            is_client_uuid: row.is_client_uuid,
            message_crc32: row.message_crc32,
        });
        Ok(id)
    }

    async fn query(&self, filter: &RowFilter) -> Result<Vec<CatalogRow>, CatalogError> {
        self.check_queries()?;
        let rows = self.rows.lock().await;
        let mut matched: Vec<CatalogRow> = rows
            .iter()
            .filter(|r| row_matches(r, filter))
            .cloned()
            .collect();
        // not random, but bounded like the sampled query
        if let RowFilter::TopicLike {
            sample: Some(n), ..
        } = filter
        {
            matched.truncate(usize::try_from(*n).unwrap_or(0));
        }
        Ok(matched)
    }

    async fn exists(&self, filter: &RowFilter) -> Result<bool, CatalogError> {
        self.check_queries()?;
        let rows = self.rows.lock().await;
        Ok(rows.iter().any(|r| row_matches(r, filter)))
    }

    async fn delete(&self, filter: &RowFilter) -> Result<u64, CatalogError> {
        self.check_queries()?;
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|r| !row_matches(r, filter));
        Ok((before - rows.len()) as u64)
    }

    async fn topics(&self, pattern: &str) -> Result<Vec<String>, CatalogError> {
        self.check_queries()?;
        let rows = self.rows.lock().await;
        let mut topics: Vec<String> = rows
            .iter()
            .filter(|r| like_matches(pattern, &r.topic))
            .map(|r| r.topic.clone())
            .collect();
        topics.sort();
        topics.dedup();
        Ok(topics)
    }

    async fn duplicate_groups(
        &self,
        kind: DuplicateKind,
        limit: i64,
    ) -> Result<Vec<DuplicateGroup>, CatalogError> {
        self.check_queries()?;
        let rows = self.rows.lock().await;
        let mut groups: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        for row in rows.iter() {
            let identity = match kind {
                DuplicateKind::ClientUuid if row.is_client_uuid => row.uuid.clone(),
                DuplicateKind::ServerContent if !row.is_client_uuid => {
                    format!("{}:{}:{}", row.topic, row.timestamp, row.message_crc32)
                }
                _ => continue,
            };
            groups.entry(identity).or_default().push(row.id);
        }
        let mut groups: Vec<DuplicateGroup> = groups
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(identity, ids)| DuplicateGroup {
                kind,
                identity,
                ids,
            })
            .collect();
        groups.sort_by_key(|g| g.ids[0]);
        groups.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(groups)
    }

    async fn topic_stats(&self, since_ms: i64) -> Result<Vec<TopicStats>, CatalogError> {
        self.check_queries()?;
        let rows = self.rows.lock().await;
        let mut stats: BTreeMap<&str, TopicStats> = BTreeMap::new();
        for row in rows.iter().filter(|r| r.timestamp >= since_ms) {
            let entry = stats.entry(row.topic.as_str()).or_insert_with(|| TopicStats {
                topic: row.topic.clone(),
                messages: 0,
                bytes: 0,
                earliest: row.timestamp,
                latest: row.timestamp,
                sample_uuid: row.uuid.clone(),
            });
            entry.messages += 1;
            entry.bytes += row.size;
            entry.earliest = entry.earliest.min(row.timestamp);
            entry.latest = entry.latest.max(row.timestamp);
            if row.uuid < entry.sample_uuid {
                entry.sample_uuid = row.uuid.clone();
            }
        }
        Ok(stats.into_values().collect())
    }
}
