//! DB-backed integration tests for the PostgreSQL checkpoint store
//!
//! Run with: DATABASE_URL=postgres://... cargo test -p strand-store --features postgres -- --ignored

#![cfg(feature = "postgres")]

use sqlx::PgPool;
use std::sync::Arc;
use strand_store::{CheckpointStore, PgCheckpointStore};

#[sqlx::test(migrations = "../migrations/postgres")]
#[ignore = "requires DATABASE_URL"]
async fn test_save_get_reset(pool: PgPool) {
    let store = PgCheckpointStore::new(pool);

    assert_eq!(store.get("balances", None).await.unwrap(), None);

    store.save("balances", None, 9).await.unwrap();
    assert_eq!(store.get("balances", None).await.unwrap(), Some(9));

    store.reset("balances", None).await.unwrap();
    assert_eq!(store.get("balances", None).await.unwrap(), None);
}

#[sqlx::test(migrations = "../migrations/postgres")]
#[ignore = "requires DATABASE_URL"]
async fn test_partition_keys_and_listing(pool: PgPool) {
    let store = PgCheckpointStore::new(pool);

    store.save("p", None, 2).await.unwrap();
    store.save("p", Some("b"), 8).await.unwrap();
    store.save("p", Some("a"), 5).await.unwrap();

    let listed = store.list("p").await.unwrap();
    let keys: Vec<Option<&str>> = listed.iter().map(|c| c.partition.as_deref()).collect();
    assert_eq!(keys, vec![None, Some("a"), Some("b")]);

    assert_eq!(store.reset_all("p").await.unwrap(), 3);
    assert!(store.list("p").await.unwrap().is_empty());
}

#[sqlx::test(migrations = "../migrations/postgres")]
#[ignore = "requires DATABASE_URL"]
async fn test_concurrent_saves_leave_one_written_value(pool: PgPool) {
    let store = Arc::new(PgCheckpointStore::new(pool));

    let mut handles = Vec::new();
    for position in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.save("p", Some("k"), position).await.unwrap() }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let value = store.get("p", Some("k")).await.unwrap().unwrap();
    assert!((0..16).contains(&value));
    assert_eq!(store.list("p").await.unwrap().len(), 1);
}
