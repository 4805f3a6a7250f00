//! Integration tests for dataframe caching

mod common;

use common::{sorted_rows, test_env};
use lakebook_core::functions::{col, lit};
use lakebook_core::{SaveMode, StorageLevel, conf};

#[tokio::test]
async fn test_cache_returns_identical_results() {
    let env = test_env();
    let df = env.sample().await;
    let expected = sorted_rows(&df).await;

    let cached = df.cache().await.unwrap();
    assert!(cached.is_cached().await);
    assert_eq!(cached.storage_level().await, StorageLevel::MemoryAndDisk);
    // caching registers session state but keeps the plan
    assert_eq!(cached.logical_plan(), df.logical_plan());

    assert_eq!(sorted_rows(&cached).await, expected);
    assert_eq!(sorted_rows(&cached).await, expected);
    let manager = env.session.cache_manager();
    let entry = manager.entry(df.logical_plan()).await.unwrap();
    assert!(entry.is_materialized());
    assert!(!entry.is_on_disk());
    assert!(manager.stats().await.hit_count > 0);

    // derived dataframes read the cached rows too
    let derived = cached.filter(col("column1").gt(lit(100))).unwrap();
    assert_eq!(derived.count().await.unwrap(), 4);

    let released = cached.unpersist().await.unwrap();
    assert!(!released.is_cached().await);
    assert_eq!(released.storage_level().await, StorageLevel::None);
    assert!(manager.is_empty().await);
    assert_eq!(sorted_rows(&released).await, expected);
}

#[tokio::test]
async fn test_disk_levels_spill_to_local_dir() {
    let env = test_env();
    let df = env.sample().await.select(&["id", "target"]).unwrap();
    let persisted = df.persist(StorageLevel::DiskOnly).await.unwrap();
    assert_eq!(persisted.count().await.unwrap(), 6);

    let manager = env.session.cache_manager();
    let entry = manager.entry(df.logical_plan()).await.unwrap();
    assert!(entry.is_on_disk());
    assert_eq!(sorted_rows(&persisted).await, sorted_rows(&df).await);

    // memory-and-disk spills once the relation exceeds the memory budget
    env.session.conf().set(conf::CACHE_MAX_MEMORY_BYTES, "1").unwrap();
    let other = env.sample().await.select(&["column1"]).unwrap();
    let spilled = other.cache().await.unwrap();
    assert_eq!(spilled.count().await.unwrap(), 6);
    assert!(manager.entry(other.logical_plan()).await.unwrap().is_on_disk());

    manager.clear().await;
    assert!(manager.is_empty().await);
    assert!(df.persist(StorageLevel::None).await.is_err());
}

#[tokio::test]
async fn test_writes_invalidate_cached_tables() {
    let env = test_env();
    let df = env.sample().await;
    df.write()
        .format("delta")
        .save_as_table("cached_table")
        .await
        .unwrap();

    let table = env.session.table("cached_table").await.unwrap();
    let cached = table.cache().await.unwrap();
    assert_eq!(cached.count().await.unwrap(), 6);

    df.write()
        .format("delta")
        .mode(SaveMode::Append)
        .save_as_table("cached_table")
        .await
        .unwrap();
    assert!(!cached.is_cached().await);
    let fresh = env.session.table("cached_table").await.unwrap();
    assert_eq!(fresh.count().await.unwrap(), 12);
}

#[tokio::test]
async fn test_uncached_actions_count_as_misses() {
    let env = test_env();
    let manager = env.session.cache_manager();
    let df = env.sample().await;

    assert_eq!(df.count().await.unwrap(), 6);
    let stats = manager.stats().await;
    assert_eq!(stats.hit_count, 0);
    assert!(stats.miss_count > 0);

    // with something cached, an unrelated plan is still a miss
    let cached = df.select(&["id"]).unwrap().cache().await.unwrap();
    cached.count().await.unwrap();
    let misses = manager.stats().await.miss_count;
    df.select(&["column1"]).unwrap().count().await.unwrap();
    assert_eq!(manager.stats().await.miss_count, misses + 1);

    // serving the cached plan records a hit, not a miss
    let hits = manager.stats().await.hit_count;
    cached.count().await.unwrap();
    let stats = manager.stats().await;
    assert!(stats.hit_count > hits);
    assert_eq!(stats.miss_count, misses + 1);
}
