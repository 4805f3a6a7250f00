//! Integration tests for SQL over views, tables and UDFs

mod common;

use common::{sorted_rows, test_env};
use datafusion::arrow::datatypes::DataType;
use datafusion::common::ScalarValue;
use lakebook_core::functions::{col, count_star, udf};
use lakebook_core::{LakebookError, SaveMode, TableFormat};

#[tokio::test]
async fn test_view_query_matches_group_by() {
    let env = test_env();
    let df = env.sample().await;
    df.create_or_replace_temp_view("temp_table").unwrap();

    let result = env
        .session
        .sql("SELECT column1, COUNT(*) FROM temp_table GROUP BY column1")
        .await
        .unwrap();
    let expected = df
        .group_by(&["column1"])
        .unwrap()
        .agg(vec![count_star()])
        .unwrap();
    assert_eq!(sorted_rows(&result).await, sorted_rows(&expected).await);

    // the result is a regular dataframe
    let filtered = result.filter(col("column1").eq(datafusion::prelude::lit(150))).unwrap();
    assert_eq!(filtered.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_temp_view_lifecycle() {
    let env = test_env();
    let df = env.sample().await;
    df.create_temp_view("events").unwrap();
    assert!(matches!(
        df.create_temp_view("events"),
        Err(LakebookError::TableAlreadyExists(_))
    ));
    df.limit(1).unwrap().create_or_replace_temp_view("events").unwrap();
    let count = env.session.sql("SELECT * FROM events").await.unwrap();
    assert_eq!(count.count().await.unwrap(), 1);

    env.session.sql("DROP VIEW events").await.unwrap();
    assert!(env.session.sql("SELECT * FROM events").await.is_err());
    assert!(env.session.sql("DROP VIEW IF EXISTS events").await.is_ok());
    assert!(matches!(
        env.session.sql("DROP VIEW events").await,
        Err(LakebookError::TableNotFound(_))
    ));
}

#[tokio::test]
async fn test_temp_view_is_not_in_default_database() {
    let env = test_env();
    let df = env.sample().await;
    df.create_or_replace_temp_view("scratch").unwrap();

    let view = env.session.table("scratch").await.unwrap();
    assert_eq!(view.count().await.unwrap(), 6);
    assert!(matches!(
        env.session.table("default.scratch").await,
        Err(LakebookError::TableNotFound(_))
    ));
    assert!(env.session.sql("SELECT * FROM default.scratch").await.is_err());
    assert!(!env.session.catalog().table_exists("default.scratch").unwrap());

    // a stored table of the same name stays reachable through its database
    df.write()
        .mode(SaveMode::Overwrite)
        .format("delta")
        .save_as_table("default.scratch")
        .await
        .unwrap();
    let stored = env.session.sql("SELECT * FROM default.scratch").await.unwrap();
    assert_eq!(stored.count().await.unwrap(), 6);
    let view = env.session.sql("SELECT * FROM scratch WHERE id < 3").await.unwrap();
    assert_eq!(view.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_registered_udf_in_sql() {
    let env = test_env();
    let df = env.sample().await;
    df.create_or_replace_temp_view("numbers").unwrap();

    let doubled = udf(
        "my_function",
        vec![DataType::Int64],
        DataType::Utf8,
        |args: &[ScalarValue]| match &args[0] {
            ScalarValue::Int64(Some(x)) => Ok(ScalarValue::from((x * 2).to_string())),
            _ => Ok(ScalarValue::Null),
        },
    );
    env.session.udf().register(&doubled);

    let result = env
        .session
        .sql("SELECT id, my_function(column1) AS result FROM numbers WHERE id <= 2")
        .await
        .unwrap();
    assert_eq!(sorted_rows(&result).await, vec!["1|100", "2|300"]);

    let via_api = df
        .with_column("result", doubled.call(vec![col("column1")]))
        .unwrap()
        .select(&["id", "result"])
        .unwrap()
        .filter(col("id").lt_eq(datafusion::prelude::lit(2)))
        .unwrap();
    assert_eq!(sorted_rows(&via_api).await, vec!["1|100", "2|300"]);
}

#[tokio::test]
async fn test_databases_and_tables() {
    let env = test_env();
    let catalog = env.session.catalog();

    env.session.sql("CREATE DATABASE sales").await.unwrap();
    assert!(catalog.database_exists("sales"));
    assert!(env.session.sql("CREATE DATABASE sales").await.is_err());
    env.session
        .sql("CREATE SCHEMA IF NOT EXISTS sales")
        .await
        .unwrap();
    assert_eq!(catalog.list_databases(), vec!["default", "sales"]);

    let df = env.sample().await;
    df.write()
        .mode(SaveMode::Overwrite)
        .format("parquet")
        .save_as_table("sales.orders")
        .await
        .unwrap();
    assert!(catalog.table_exists("sales.orders").unwrap());
    assert_eq!(catalog.list_tables(Some("sales")).unwrap(), vec!["orders"]);
    assert_eq!(
        catalog.table_format("sales.orders").await.unwrap(),
        Some(TableFormat::Parquet)
    );

    let total = env
        .session
        .sql("SELECT SUM(column2) AS total FROM sales.orders")
        .await
        .unwrap();
    assert_eq!(sorted_rows(&total).await, vec!["78"]);

    let table = env.session.table("sales.orders").await.unwrap();
    assert_eq!(table.count().await.unwrap(), 6);

    env.session.sql("DROP TABLE sales.orders").await.unwrap();
    assert!(!catalog.table_exists("sales.orders").unwrap());
    assert!(matches!(
        env.session.table("sales.orders").await,
        Err(LakebookError::TableNotFound(_))
    ));
    env.session
        .sql("DROP TABLE IF EXISTS sales.orders")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_explain_statement_is_not_aliased() {
    let env = test_env();
    env.sample().await.create_or_replace_temp_view("t").unwrap();
    let explained = env.session.sql("EXPLAIN SELECT * FROM t").await.unwrap();
    assert_eq!(explained.columns(), vec!["plan_type", "plan"]);
}
