//! Store smoke tests against a live Postgres. Skipped unless
//! `TEST_DATABASE_URL` points at a database with the project schema.

mod common;

use prediction_indexer::services::store::Store;

#[tokio::test]
async fn store_connects_and_pings() {
    let Some(url) = common::test_database_url() else {
        eprintln!("TEST_DATABASE_URL unset, skipping store integration test");
        return;
    };

    let store = Store::connect(&url).await.expect("store should connect");
    assert!(store.ping().await, "liveness probe should succeed");
}

#[tokio::test]
async fn hot_table_sweep_is_idempotent() {
    let Some(url) = common::test_database_url() else {
        eprintln!("TEST_DATABASE_URL unset, skipping store integration test");
        return;
    };

    let store = Store::connect(&url).await.expect("store should connect");
    // Sweeping below epoch 0 can never match rows; both calls must succeed
    // and report zero deletions.
    assert_eq!(store.sweep_realbets_below(0).await.unwrap(), 0);
    assert_eq!(store.sweep_realbets_below(0).await.unwrap(), 0);
}
