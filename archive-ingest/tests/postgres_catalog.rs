use archive_ingest::catalog::{
    Catalog, DuplicateKind, NewCatalogRow, PostgresCatalog, RowFilter,
};
use sqlx::PgPool;

fn row(topic: &str, timestamp: i64, uuid: &str, is_client_uuid: bool, crc: i64) -> NewCatalogRow {
    NewCatalogRow {
        topic: topic.to_string(),
        timestamp,
        uuid: uuid.to_string(),
        size: 100,
        key: format!("{topic}/1970/1/1/0/{uuid}.bundle"),
        bucket: "archive-devel".to_string(),
        crc32: 7,
        is_client_uuid,
        message_crc32: crc,
    }
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires postgres"]
async fn insert_and_query(db: PgPool) {
    let catalog = PostgresCatalog::new(db);
    catalog.make_schema().await.unwrap();

    let id = catalog.insert(&row("t1", 1000, "u1", true, 11)).await.unwrap();
    catalog.insert(&row("t1", 2000, "u2", false, 22)).await.unwrap();
    catalog.insert(&row("t2", 2000, "u3", false, 22)).await.unwrap();

    let rows = catalog.query(&RowFilter::Uuid("u1".to_string())).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, id);
    assert_eq!(rows[0].message_crc32, 11);

    assert!(catalog
        .exists(&RowFilter::Content {
            topic: "t1".to_string(),
            timestamp: 2000,
            message_crc32: 22,
        })
        .await
        .unwrap());
    assert!(!catalog
        .exists(&RowFilter::Content {
            topic: "t1".to_string(),
            timestamp: 2001,
            message_crc32: 22,
        })
        .await
        .unwrap());

    let sampled = catalog
        .query(&RowFilter::TopicLike {
            pattern: "t%".to_string(),
            sample: Some(2),
        })
        .await
        .unwrap();
    assert_eq!(sampled.len(), 2);
    assert_eq!(
        catalog.topics("%").await.unwrap(),
        vec!["t1".to_string(), "t2".to_string()]
    );

    assert_eq!(catalog.delete(&RowFilter::Topic("t1".to_string())).await.unwrap(), 2);
    let remaining = catalog
        .query(&RowFilter::TopicLike {
            pattern: "%".to_string(),
            sample: None,
        })
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires postgres"]
async fn large_checksums_round_trip(db: PgPool) {
    let catalog = PostgresCatalog::new(db);
    let crc = i64::from(u32::MAX);
    catalog.insert(&row("t1", 1000, "u1", false, crc)).await.unwrap();
    assert!(catalog
        .exists(&RowFilter::Content {
            topic: "t1".to_string(),
            timestamp: 1000,
            message_crc32: u32::MAX,
        })
        .await
        .unwrap());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires postgres"]
async fn duplicate_groups_and_stats(db: PgPool) {
    let catalog = PostgresCatalog::new(db);
    let a = catalog.insert(&row("t1", 1000, "dup", true, 1)).await.unwrap();
    let b = catalog.insert(&row("t1", 9000, "dup", true, 1)).await.unwrap();
    let c = catalog.insert(&row("t2", 2000, "s1", false, 5)).await.unwrap();
    let d = catalog.insert(&row("t2", 2000, "s2", false, 5)).await.unwrap();
    catalog.insert(&row("t2", 2000, "s3", false, 6)).await.unwrap();

    let client = catalog
        .duplicate_groups(DuplicateKind::ClientUuid, 10)
        .await
        .unwrap();
    assert_eq!(client.len(), 1);
    assert_eq!(client[0].identity, "dup");
    assert_eq!(client[0].ids, vec![a, b]);

    let server = catalog
        .duplicate_groups(DuplicateKind::ServerContent, 10)
        .await
        .unwrap();
    assert_eq!(server.len(), 1);
    assert_eq!(server[0].identity, "t2:2000:5");
    assert_eq!(server[0].ids, vec![c, d]);

    let stats = catalog.topic_stats(1500).await.unwrap();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0].topic, "t1");
    assert_eq!(stats[0].messages, 1);
    assert_eq!(stats[1].messages, 3);
    assert_eq!(stats[1].bytes, 300);
    assert_eq!(stats[1].earliest, 2000);
}
