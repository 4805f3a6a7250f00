//! Integration tests for feature assembly and linear regression

mod common;

use common::{NULLS_CSV, test_env};
use datafusion::arrow::array::{Array, AsArray};
use datafusion::arrow::datatypes::{DataType, Float64Type};
use lakebook_core::LakebookError;
use lakebook_core::ml::{HandleInvalid, LinearRegression, Solver, VectorAssembler};

#[tokio::test]
async fn test_assemble_fit_and_predict() {
    let env = test_env();
    let df = env.sample().await;

    let assembler = VectorAssembler::new(&["column1", "column2"], "features");
    let df_ml = assembler.transform(&df).await.unwrap();
    assert_eq!(df_ml.columns().last().map(String::as_str), Some("features"));
    assert!(matches!(
        df_ml.schema().field_with_name("features").unwrap().data_type(),
        DataType::List(_)
    ));

    let model = LinearRegression::new()
        .features_col("features")
        .label_col("target")
        .fit(&df_ml)
        .await
        .unwrap();
    assert!((model.intercept() - 1.0).abs() < 1e-6);
    assert!((model.coefficients()[0] - 2.0).abs() < 1e-6);
    assert!((model.coefficients()[1] - 3.0).abs() < 1e-6);
    let summary = model.summary();
    assert_eq!(summary.num_instances, 6);
    assert!(summary.root_mean_squared_error < 1e-6);
    assert!(summary.mean_absolute_error < 1e-6);

    let predictions = model.transform(&df_ml).unwrap();
    let batches = predictions
        .select(&["target", "prediction"])
        .unwrap()
        .collect()
        .await
        .unwrap();
    let mut rows = 0;
    for batch in batches {
        let targets = datafusion::arrow::compute::cast(batch.column(0), &DataType::Float64).unwrap();
        let targets = targets.as_primitive::<Float64Type>();
        let predicted = batch.column(1).as_primitive::<Float64Type>();
        for i in 0..batch.num_rows() {
            assert!((targets.value(i) - predicted.value(i)).abs() < 1e-6);
            rows += 1;
        }
    }
    assert_eq!(rows, 6);
}

#[tokio::test]
async fn test_gradient_descent_matches_normal_equations() {
    let env = test_env();
    let df_ml = VectorAssembler::new(&["column1", "column2"], "features")
        .transform(&env.sample().await)
        .await
        .unwrap();

    let exact = LinearRegression::new()
        .label_col("target")
        .solver(Solver::Normal)
        .fit(&df_ml)
        .await
        .unwrap();
    let iterative = LinearRegression::new()
        .label_col("target")
        .solver(Solver::Sgd)
        .max_iter(50_000)
        .tol(1e-14)
        .fit(&df_ml)
        .await
        .unwrap();
    for (a, b) in exact.coefficients().iter().zip(iterative.coefficients()) {
        assert!((a - b).abs() < 1e-3, "{a} vs {b}");
    }
    assert!(iterative.summary().total_iterations > 0);

    let ridge = LinearRegression::new()
        .label_col("target")
        .reg_param(10.0)
        .fit(&df_ml)
        .await
        .unwrap();
    // the penalty shrinks the coefficients
    let norm = |c: &[f64]| c.iter().map(|v| v * v).sum::<f64>();
    assert!(norm(ridge.coefficients()) < norm(exact.coefficients()));
}

#[tokio::test]
async fn test_assembler_null_policies() {
    let env = test_env();
    let path = env.write_file("nulls.csv", NULLS_CSV);
    let df = env
        .session
        .read()
        .option("header", true)
        .option("inferSchema", true)
        .csv(&path)
        .await
        .unwrap();

    let err = VectorAssembler::new(&["id", "score"], "features")
        .transform(&df)
        .await
        .unwrap_err();
    assert!(matches!(err, LakebookError::IllegalArgument(_)));

    let skipped = VectorAssembler::new(&["id", "score"], "features")
        .handle_invalid(HandleInvalid::Skip)
        .transform(&df)
        .await
        .unwrap();
    assert_eq!(skipped.count().await.unwrap(), 2);

    let kept = VectorAssembler::new(&["id", "score", "active"], "features")
        .handle_invalid("keep".parse().unwrap())
        .transform(&df)
        .await
        .unwrap();
    let batches = kept.select(&["features"]).unwrap().collect().await.unwrap();
    let mut null_elements = 0;
    for batch in &batches {
        let vectors = batch.column(0).as_list::<i32>();
        for i in 0..vectors.len() {
            null_elements += vectors.value(i).null_count();
        }
    }
    assert_eq!(null_elements, 4);

    // strings cannot be assembled
    assert!(
        VectorAssembler::new(&["name"], "features")
            .transform(&df)
            .await
            .is_err()
    );
    // null features cannot be fitted
    let err = LinearRegression::new()
        .label_col("id")
        .fit(&kept)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("null"));
}
