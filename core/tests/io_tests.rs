//! Integration tests for reading and writing files

mod common;

use common::{sorted_rows, test_env};
use lakebook_core::{LakebookError, SaveMode};

#[tokio::test]
async fn test_parquet_overwrite_round_trip() {
    let env = test_env();
    let df = env.sample().await;

    df.write()
        .mode(SaveMode::Overwrite)
        .parquet("dbfs:/FileStore/output_data")
        .await
        .unwrap();
    assert!(env.dir.path().join("dbfs/FileStore/output_data").is_dir());

    // a second overwrite replaces the data instead of adding to it
    df.write()
        .mode("overwrite")
        .parquet("dbfs:/FileStore/output_data")
        .await
        .unwrap();
    let back = env
        .session
        .read()
        .parquet("dbfs:/FileStore/output_data")
        .await
        .unwrap();
    assert_eq!(back.schema().fields().len(), df.schema().fields().len());
    for (read, written) in back.schema().fields().iter().zip(df.schema().fields()) {
        assert_eq!(read.name(), written.name());
        assert_eq!(read.data_type(), written.data_type());
    }
    assert_eq!(sorted_rows(&back).await, sorted_rows(&df).await);
}

#[tokio::test]
async fn test_save_modes_on_paths() {
    let env = test_env();
    let df = env.sample().await;
    let path = env.path("out");

    df.write().parquet(&path).await.unwrap();
    assert!(matches!(
        df.write().parquet(&path).await,
        Err(LakebookError::PathAlreadyExists(_))
    ));
    df.write().mode("ignore").parquet(&path).await.unwrap();
    df.write().mode("append").parquet(&path).await.unwrap();
    let back = env.session.read().parquet(&path).await.unwrap();
    assert_eq!(back.count().await.unwrap(), 12);

    assert!(matches!(
        df.write().mode("sometimes").parquet(&path).await,
        Err(LakebookError::IllegalArgument(_))
    ));
    assert!(matches!(
        df.write().format("avro").save(&path).await,
        Err(LakebookError::NotSupported(_))
    ));
}

#[tokio::test]
async fn test_csv_write_and_read_back() {
    let env = test_env();
    let df = env.sample().await.select(&["id", "column1"]).unwrap();
    let path = env.path("csv_out");
    df.write()
        .option("header", "true")
        .option("sep", "|")
        .csv(&path)
        .await
        .unwrap();

    let back = env
        .session
        .read()
        .option("header", true)
        .option("sep", "|")
        .option("inferSchema", true)
        .csv(&path)
        .await
        .unwrap();
    assert_eq!(back.columns(), vec!["id", "column1"]);
    assert_eq!(sorted_rows(&back).await, sorted_rows(&df).await);
}

#[tokio::test]
async fn test_catalog_table_read() {
    let env = test_env();
    let df = env.sample().await;
    df.write()
        .format("parquet")
        .save_as_table("default.sample_table")
        .await
        .unwrap();

    let table = env.session.table("default.sample_table").await.unwrap();
    let via_reader = env.session.read().table("sample_table").await.unwrap();
    assert_eq!(sorted_rows(&table).await, sorted_rows(&via_reader).await);

    // two reads of the same table can be joined on their own columns
    let joined = df
        .join(&table, df.col("id").unwrap().eq(table.col("id").unwrap()), "inner")
        .unwrap();
    assert_eq!(joined.count().await.unwrap(), 6);
}

#[tokio::test]
async fn test_missing_input_and_duplicate_columns() {
    let env = test_env();
    let err = env
        .session
        .read()
        .csv("dbfs:/FileStore/sample_data.csv")
        .await
        .unwrap_err();
    assert!(matches!(err, LakebookError::Analysis(_)));

    let df = env.sample().await;
    let other = env.sample().await;
    let joined = df
        .join(&other, df.col("id").unwrap().eq(other.col("id").unwrap()), "inner")
        .unwrap();
    assert!(matches!(
        joined.write().parquet(&env.path("dup")).await,
        Err(LakebookError::Analysis(_))
    ));
}
