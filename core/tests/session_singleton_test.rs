//! The active session is process-wide, so this binary holds a single test.

use lakebook_core::{Session, conf};
use tracing_test::traced_test;

#[tokio::test]
#[traced_test]
async fn test_get_or_create_reuses_the_active_session() {
    let dir = tempfile::tempdir().unwrap();
    let warehouse = dir.path().join("warehouse").to_string_lossy().into_owned();
    let dbfs = dir.path().join("dbfs").to_string_lossy().into_owned();
    assert!(Session::active().is_none());

    let spark = Session::builder()
        .app_name("Databricks Tutorial")
        .config(conf::WAREHOUSE_DIR, warehouse.clone())
        .config(conf::DBFS_ROOT, dbfs.clone())
        .get_or_create()
        .unwrap();
    assert_eq!(spark.app_name(), "Databricks Tutorial");
    assert!(!spark.version().is_empty());
    assert_eq!(Session::active().unwrap().id(), spark.id());

    // static configs are ignored with a warning, runtime configs apply
    let again = Session::builder()
        .config(conf::DRIVER_MEMORY, "4g")
        .config(conf::SHUFFLE_PARTITIONS, "3")
        .get_or_create()
        .unwrap();
    assert_eq!(again.id(), spark.id());
    assert!(logs_contain("cannot be changed"));
    assert_eq!(spark.conf().get(conf::DRIVER_MEMORY), None);
    assert_eq!(
        spark.conf().get(conf::SHUFFLE_PARTITIONS).as_deref(),
        Some("3")
    );
    assert_eq!(
        spark
            .ctx()
            .state()
            .config()
            .options()
            .execution
            .target_partitions,
        3
    );
    assert!(spark.conf().set(conf::WAREHOUSE_DIR, "/elsewhere").is_err());

    let df = spark.range(0, 5).unwrap();
    assert_eq!(df.count().await.unwrap(), 5);

    spark.stop();
    assert!(Session::active().is_none());
    let fresh = Session::builder()
        .config(conf::WAREHOUSE_DIR, warehouse)
        .config(conf::DBFS_ROOT, dbfs)
        .get_or_create()
        .unwrap();
    assert_ne!(fresh.id(), spark.id());
    fresh.stop();
}
