use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::types::{Metadata, StoredAnnotations};

pub mod memory;
pub mod postgres;

pub use memory::MemoryCatalog;
pub use postgres::PostgresCatalog;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("Catalog unavailable: {0}")]
    Unavailable(String),
    #[error("Value out of range for column {column}: {value}")]
    OutOfRange { column: &'static str, value: u64 },
}

/// One archived message as recorded in the `messages` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct CatalogRow {
    pub id: i64,
    pub topic: String,
    pub timestamp: i64,
    pub uuid: String,
    pub size: i64,
    pub key: String,
    pub bucket: String,
    pub crc32: i64,
    pub is_client_uuid: bool,
    pub message_crc32: i64,
}

/// A row to insert; `id` is assigned by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCatalogRow {
    pub topic: String,
    pub timestamp: i64,
    pub uuid: String,
    pub size: i64,
    pub key: String,
    pub bucket: String,
    pub crc32: i64,
    pub is_client_uuid: bool,
    pub message_crc32: i64,
}

impl NewCatalogRow {
    pub fn new(metadata: &Metadata, annotations: &StoredAnnotations) -> Result<Self, CatalogError> {
        let size = i64::try_from(annotations.store.size).map_err(|_| CatalogError::OutOfRange {
            column: "size",
            value: annotations.store.size,
        })?;
        Ok(Self {
            topic: metadata.topic.clone(),
            timestamp: metadata.timestamp,
            uuid: annotations.identity.text_uuid.clone(),
            size,
            key: annotations.store.key.clone(),
            bucket: annotations.store.bucket.clone(),
            crc32: i64::from(annotations.store.bundle_crc32),
            is_client_uuid: annotations.identity.is_client_uuid,
            message_crc32: i64::from(annotations.identity.message_crc32),
        })
    }
}

/// Row predicates. Each maps to one parameterized `WHERE` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    /// `uuid = $1`
    Uuid(String),
    /// `topic = $1 AND timestamp = $2 AND message_crc32 = $3`
    Content {
        topic: String,
        timestamp: i64,
        message_crc32: u32,
    },
    /// `key = $1`
    Key(String),
    /// `topic = $1`
    Topic(String),
    /// `topic LIKE $1`, optionally a random sample of at most `sample` rows.
    TopicLike {
        pattern: String,
        sample: Option<i64>,
    },
    /// `id = ANY($1)`
    Ids(Vec<i64>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DuplicateKind {
    /// Rows sharing a client-supplied uuid.
    ClientUuid,
    /// Server-identified rows sharing `(topic, timestamp, message_crc32)`.
    ServerContent,
}

/// Rows the index-based test considers the same logical message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub kind: DuplicateKind,
    pub identity: String,
    pub ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct TopicStats {
    pub topic: String,
    pub messages: i64,
    pub bytes: i64,
    pub earliest: i64,
    pub latest: i64,
    pub sample_uuid: String,
}

/// Relational index over the archive. Writes happen only after a successful store.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Creates the table and indexes if absent. Safe to call repeatedly.
    async fn make_schema(&self) -> Result<(), CatalogError>;

    /// Appends one row, returning its id.
    async fn insert(&self, row: &NewCatalogRow) -> Result<i64, CatalogError>;

    async fn query(&self, filter: &RowFilter) -> Result<Vec<CatalogRow>, CatalogError>;

    async fn exists(&self, filter: &RowFilter) -> Result<bool, CatalogError>;

    /// Removes matching rows, returning how many went.
    async fn delete(&self, filter: &RowFilter) -> Result<u64, CatalogError>;

    /// Distinct topics matching a LIKE pattern.
    async fn topics(&self, pattern: &str) -> Result<Vec<String>, CatalogError>;

    async fn duplicate_groups(
        &self,
        kind: DuplicateKind,
        limit: i64,
    ) -> Result<Vec<DuplicateGroup>, CatalogError>;

    /// Per-topic totals over rows with `timestamp >= since_ms`.
    async fn topic_stats(&self, since_ms: i64) -> Result<Vec<TopicStats>, CatalogError>;
}

/// SQL LIKE semantics: `%` any run, `_` any single character, `\` escapes.
pub fn like_matches(pattern: &str, value: &str) -> bool {
    fn matches(p: &[char], v: &[char]) -> bool {
        match p.split_first() {
            None => v.is_empty(),
            Some(('%', rest)) => (0..=v.len()).any(|i| matches(rest, &v[i..])),
            Some(('_', rest)) => !v.is_empty() && matches(rest, &v[1..]),
            Some(('\\', rest)) if !rest.is_empty() => {
                v.first() == Some(&rest[0]) && matches(&rest[1..], &v[1..])
            }
            Some((c, rest)) => v.first() == Some(c) && matches(rest, &v[1..]),
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();
    matches(&p, &v)
}
