use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder};
use tracing::info;

use super::{
    Catalog, CatalogError, CatalogRow, DuplicateGroup, DuplicateKind, NewCatalogRow, RowFilter,
    TopicStats,
};
use crate::{config::CatalogConfig, metrics_const::CATALOG_ROWS_INSERTED};

const SELECT_ROWS: &str = "SELECT id, topic, timestamp, uuid, size, key, bucket, crc32, \
     is_client_uuid, message_crc32 FROM messages WHERE ";

const CLIENT_DUPLICATES: &str = "SELECT uuid AS identity, array_agg(id ORDER BY id) AS ids \
     FROM messages WHERE is_client_uuid \
     GROUP BY uuid HAVING COUNT(*) > 1 ORDER BY MIN(id) LIMIT $1";

const SERVER_DUPLICATES: &str = "SELECT topic || ':' || timestamp::TEXT || ':' || message_crc32::TEXT AS identity, \
     array_agg(id ORDER BY id) AS ids \
     FROM messages WHERE NOT is_client_uuid \
     GROUP BY topic, timestamp, message_crc32 HAVING COUNT(*) > 1 ORDER BY MIN(id) LIMIT $1";

pub struct PostgresCatalog {
    pool: PgPool,
    log_every: u64,
    n_inserted: AtomicU64,
}

impl PostgresCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            log_every: 100,
            n_inserted: AtomicU64::new(0),
        }
    }

    pub async fn connect(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_pg_connections)
            .connect(&config.database_url)
            .await?;
        Ok(Self::new(pool).with_log_every(config.catalog_log_every))
    }

    pub fn with_log_every(mut self, log_every: u64) -> Self {
        self.log_every = log_every.max(1);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn push_predicate(qb: &mut QueryBuilder<'_, Postgres>, filter: &RowFilter) {
    match filter {
        RowFilter::Uuid(uuid) => {
            qb.push("uuid = ").push_bind(uuid.clone());
        }
        RowFilter::Content {
            topic,
            timestamp,
            message_crc32,
        } => {
            qb.push("topic = ")
                .push_bind(topic.clone())
                .push(" AND timestamp = ")
                .push_bind(*timestamp)
                .push(" AND message_crc32 = ")
                .push_bind(i64::from(*message_crc32));
        }
        RowFilter::Key(key) => {
            qb.push("key = ").push_bind(key.clone());
        }
        RowFilter::Topic(topic) => {
            qb.push("topic = ").push_bind(topic.clone());
        }
        RowFilter::TopicLike { pattern, .. } => {
            qb.push("topic LIKE ").push_bind(pattern.clone());
        }
        RowFilter::Ids(ids) => {
            qb.push("id = ANY(").push_bind(ids.clone()).push(")");
        }
    }
}

#[async_trait]
impl Catalog for PostgresCatalog {
    async fn make_schema(&self) -> Result<(), CatalogError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn insert(&self, row: &NewCatalogRow) -> Result<i64, CatalogError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO messages
                (topic, timestamp, uuid, size, key, bucket, crc32, is_client_uuid, message_crc32)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(&row.topic)
        .bind(row.timestamp)
        .bind(&row.uuid)
        .bind(row.size)
        .bind(&row.key)
        .bind(&row.bucket)
        .bind(row.crc32)
        .bind(row.is_client_uuid)
        .bind(row.message_crc32)
        .fetch_one(&self.pool)
        .await?;

        metrics::counter!(CATALOG_ROWS_INSERTED).increment(1);
        let n_inserted = self.n_inserted.fetch_add(1, Ordering::Relaxed) + 1;
        if n_inserted <= 5 || n_inserted % self.log_every == 0 {
            info!(n_inserted, id, topic = %row.topic, uuid = %row.uuid, "Inserted catalog row");
        }
        Ok(id)
    }

    async fn query(&self, filter: &RowFilter) -> Result<Vec<CatalogRow>, CatalogError> {
        let mut qb = QueryBuilder::<Postgres>::new(SELECT_ROWS);
        push_predicate(&mut qb, filter);
        match filter {
            RowFilter::TopicLike {
                sample: Some(n), ..
            } => {
                qb.push(" ORDER BY random() LIMIT ").push_bind(*n);
            }
            _ => {
                qb.push(" ORDER BY id");
            }
        }
        let rows = qb
            .build_query_as::<CatalogRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn exists(&self, filter: &RowFilter) -> Result<bool, CatalogError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT EXISTS(SELECT 1 FROM messages WHERE ");
        push_predicate(&mut qb, filter);
        qb.push(")");
        let found = qb
            .build_query_scalar::<bool>()
            .fetch_one(&self.pool)
            .await?;
        Ok(found)
    }

    async fn delete(&self, filter: &RowFilter) -> Result<u64, CatalogError> {
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM messages WHERE ");
        push_predicate(&mut qb, filter);
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn topics(&self, pattern: &str) -> Result<Vec<String>, CatalogError> {
        let topics = sqlx::query_scalar(
            "SELECT DISTINCT topic FROM messages WHERE topic LIKE $1 ORDER BY topic",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(topics)
    }

    async fn duplicate_groups(
        &self,
        kind: DuplicateKind,
        limit: i64,
    ) -> Result<Vec<DuplicateGroup>, CatalogError> {
        let sql = match kind {
            DuplicateKind::ClientUuid => CLIENT_DUPLICATES,
            DuplicateKind::ServerContent => SERVER_DUPLICATES,
        };
        let groups: Vec<(String, Vec<i64>)> = sqlx::query_as(sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(groups
            .into_iter()
            .map(|(identity, ids)| DuplicateGroup {
                kind,
                identity,
                ids,
            })
            .collect())
    }

    async fn topic_stats(&self, since_ms: i64) -> Result<Vec<TopicStats>, CatalogError> {
        let stats = sqlx::query_as::<_, TopicStats>(
            r#"
            SELECT topic,
                   COUNT(*) AS messages,
                   COALESCE(SUM(size), 0)::BIGINT AS bytes,
                   MIN(timestamp) AS earliest,
                   MAX(timestamp) AS latest,
                   MIN(uuid) AS sample_uuid
            FROM messages
            WHERE timestamp >= $1
            GROUP BY topic
            ORDER BY topic
            "#,
        )
        .bind(since_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(stats)
    }
}
