//! Linear regression estimator and model.

use datafusion::arrow::array::Array;
use datafusion::arrow::compute::cast as arrow_cast;
use datafusion::arrow::datatypes::DataType;
use datafusion::common::cast::{as_float64_array, as_list_array};
use datafusion::functions_nested::expr_fn::array_element;
use datafusion::logical_expr::{Expr, cast, lit};
use tracing::{info, warn};

use super::solver::{self, GradientDescentParams, Solution, Solver};
use crate::dataframe::DataFrame;
use crate::error::{LakebookError, Result};

/// Linear regression with optional L2 regularization.
#[derive(Debug, Clone)]
pub struct LinearRegression {
    features_col: String,
    label_col: String,
    prediction_col: String,
    fit_intercept: bool,
    reg_param: f64,
    max_iter: usize,
    tol: f64,
    learning_rate: f64,
    solver: Solver,
}

impl Default for LinearRegression {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearRegression {
    pub fn new() -> Self {
        Self {
            features_col: "features".to_string(),
            label_col: "label".to_string(),
            prediction_col: "prediction".to_string(),
            fit_intercept: true,
            reg_param: 0.0,
            max_iter: 100,
            tol: 1e-6,
            learning_rate: 0.1,
            solver: Solver::Auto,
        }
    }

    pub fn features_col(mut self, name: &str) -> Self {
        self.features_col = name.to_string();
        self
    }

    pub fn label_col(mut self, name: &str) -> Self {
        self.label_col = name.to_string();
        self
    }

    pub fn prediction_col(mut self, name: &str) -> Self {
        self.prediction_col = name.to_string();
        self
    }

    pub fn fit_intercept(mut self, fit_intercept: bool) -> Self {
        self.fit_intercept = fit_intercept;
        self
    }

    pub fn reg_param(mut self, reg_param: f64) -> Self {
        self.reg_param = reg_param;
        self
    }

    /// Iteration cap for gradient descent.
    pub fn max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    pub fn learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn solver(mut self, solver: Solver) -> Self {
        self.solver = solver;
        self
    }

    /// Train on the rows of `df`.
    pub async fn fit(&self, df: &DataFrame) -> Result<LinearRegressionModel> {
        if self.reg_param < 0.0 {
            return Err(LakebookError::invalid("regParam must be non-negative"));
        }
        let (features, labels) = self.training_data(df).await?;
        let num_features = features[0].len();
        info!(
            "Fitting linear regression on {} instances with {} features",
            labels.len(),
            num_features
        );

        let gd_params = GradientDescentParams {
            max_iter: self.max_iter,
            learning_rate: self.learning_rate,
            tolerance: self.tol,
        };
        let gradient_descent = || {
            solver::gradient_descent(
                &features,
                &labels,
                self.fit_intercept,
                self.reg_param,
                &gd_params,
            )
        };
        let solution = match self.solver {
            Solver::Sgd => gradient_descent(),
            Solver::Normal => {
                solver::normal_equations(&features, &labels, self.fit_intercept, self.reg_param)
                    .ok_or_else(|| {
                        LakebookError::invalid(
                            "the normal equations are singular; use the gradient descent solver \
                             or set regParam > 0",
                        )
                    })?
            }
            Solver::Auto => {
                match solver::normal_equations(
                    &features,
                    &labels,
                    self.fit_intercept,
                    self.reg_param,
                ) {
                    Some(solution) => solution,
                    None => {
                        warn!("Normal equations are singular, falling back to gradient descent");
                        gradient_descent()
                    }
                }
            }
        };

        let summary = LinearRegressionSummary::evaluate(&solution, &features, &labels);
        info!(
            "Fitted linear regression: intercept={:.6}, coefficients={:?}, r2={:.6}",
            solution.intercept, solution.coefficients, summary.r2
        );
        Ok(LinearRegressionModel {
            coefficients: solution.coefficients,
            intercept: solution.intercept,
            features_col: self.features_col.clone(),
            prediction_col: self.prediction_col.clone(),
            summary,
        })
    }

    async fn training_data(&self, df: &DataFrame) -> Result<(Vec<Vec<f64>>, Vec<f64>)> {
        let selected = df.select_exprs(vec![
            df.col(&self.features_col)?,
            cast(df.col(&self.label_col)?, DataType::Float64).alias(&self.label_col),
        ])?;
        let mut features = Vec::new();
        let mut labels = Vec::new();
        for batch in selected.collect().await? {
            let vectors = as_list_array(batch.column(0)).map_err(|_| {
                LakebookError::invalid(format!(
                    "column {} must be a feature vector (list<double>)",
                    self.features_col
                ))
            })?;
            let label_values = as_float64_array(batch.column(1))?;
            for row in 0..batch.num_rows() {
                if label_values.is_null(row) {
                    return Err(LakebookError::invalid(format!(
                        "label column {} contains null",
                        self.label_col
                    )));
                }
                if vectors.is_null(row) {
                    return Err(LakebookError::invalid(format!(
                        "features column {} contains null",
                        self.features_col
                    )));
                }
                let values = dense_values(&vectors.value(row))?.ok_or_else(|| {
                    LakebookError::invalid(format!(
                        "features column {} contains null elements",
                        self.features_col
                    ))
                })?;
                features.push(values);
                labels.push(label_values.value(row));
            }
        }
        if labels.is_empty() {
            return Err(LakebookError::invalid(
                "cannot fit a linear regression on an empty dataset",
            ));
        }
        let dimension = features[0].len();
        if features.iter().any(|f| f.len() != dimension) {
            return Err(LakebookError::invalid(
                "feature vectors must all have the same length",
            ));
        }
        Ok((features, labels))
    }
}

/// Elements of one feature vector as `f64`, or `None` if any is null.
fn dense_values(array: &dyn Array) -> Result<Option<Vec<f64>>> {
    let casted = arrow_cast(array, &DataType::Float64)?;
    let values = as_float64_array(&casted)?;
    if values.null_count() > 0 {
        return Ok(None);
    }
    Ok(Some(values.values().to_vec()))
}

/// Training metrics of a fitted model.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearRegressionSummary {
    pub r2: f64,
    pub root_mean_squared_error: f64,
    pub mean_absolute_error: f64,
    pub num_instances: usize,
    /// Gradient descent iterations; 0 for the closed-form solution.
    pub total_iterations: usize,
}

impl LinearRegressionSummary {
    fn evaluate(solution: &Solution, features: &[Vec<f64>], labels: &[f64]) -> Self {
        let n = labels.len() as f64;
        let mean = labels.iter().sum::<f64>() / n;
        let mut ss_res = 0.0;
        let mut ss_tot = 0.0;
        let mut abs_err = 0.0;
        for (x, &y) in features.iter().zip(labels) {
            let prediction = solution.intercept
                + x.iter()
                    .zip(&solution.coefficients)
                    .map(|(v, c)| v * c)
                    .sum::<f64>();
            ss_res += (y - prediction).powi(2);
            ss_tot += (y - mean).powi(2);
            abs_err += (y - prediction).abs();
        }
        Self {
            r2: if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { f64::NAN },
            root_mean_squared_error: (ss_res / n).sqrt(),
            mean_absolute_error: abs_err / n,
            num_instances: labels.len(),
            total_iterations: solution.iterations,
        }
    }
}

/// A fitted linear model.
#[derive(Debug, Clone)]
pub struct LinearRegressionModel {
    coefficients: Vec<f64>,
    intercept: f64,
    features_col: String,
    prediction_col: String,
    summary: LinearRegressionSummary,
}

impl LinearRegressionModel {
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    pub fn num_features(&self) -> usize {
        self.coefficients.len()
    }

    pub fn summary(&self) -> &LinearRegressionSummary {
        &self.summary
    }

    pub fn predict(&self, features: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(features)
                .map(|(c, x)| c * x)
                .sum::<f64>()
    }

    /// Append the prediction column. The prediction is a lazy expression
    /// over the features column.
    pub fn transform(&self, df: &DataFrame) -> Result<DataFrame> {
        let features = df.col(&self.features_col)?;
        let prediction = self
            .coefficients
            .iter()
            .enumerate()
            .fold(lit(self.intercept), |acc: Expr, (i, coefficient)| {
                acc + lit(*coefficient) * array_element(features.clone(), lit(i as i64 + 1))
            });
        df.with_column(&self.prediction_col, prediction)
    }
}

#[cfg(test)]
mod tests {
    use datafusion::arrow::array::{Float64Array, Int64Array, RecordBatch};
    use datafusion::arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::conf;
    use crate::ml::VectorAssembler;
    use crate::session::Session;

    /// A session whose directories live in `dir`, which must outlive it.
    fn session() -> (TempDir, Session) {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::builder()
            .app_name("regression-test")
            .master("local[2]")
            .config(conf::WAREHOUSE_DIR, dir.path().join("warehouse").to_string_lossy())
            .config(conf::DBFS_ROOT, dir.path().join("dbfs").to_string_lossy())
            .create()
            .unwrap();
        (dir, session)
    }

    fn training_frame(session: &Session) -> DataFrame {
        // label = 2 + 3 * x1 - 0.5 * x2
        let x1: Vec<i64> = (0..12).collect();
        let x2: Vec<f64> = (0..12).map(|i| ((i * 7) % 5) as f64).collect();
        let label: Vec<f64> = x1
            .iter()
            .zip(&x2)
            .map(|(a, b)| 2.0 + 3.0 * *a as f64 - 0.5 * b)
            .collect();
        let schema = Arc::new(Schema::new(vec![
            Field::new("x1", DataType::Int64, true),
            Field::new("x2", DataType::Float64, true),
            Field::new("label", DataType::Float64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(x1)),
                Arc::new(Float64Array::from(x2)),
                Arc::new(Float64Array::from(label)),
            ],
        )
        .unwrap();
        session.create_dataframe_from_batch(batch).unwrap()
    }

    #[tokio::test]
    async fn test_fit_recovers_coefficients() {
        let (dir, session) = session();
        assert_eq!(session.warehouse_dir(), dir.path().join("warehouse"));
        let df = training_frame(&session);
        let assembled = VectorAssembler::new(&["x1", "x2"], "features")
            .transform(&df)
            .await
            .unwrap();
        let model = LinearRegression::new().fit(&assembled).await.unwrap();
        assert_eq!(model.num_features(), 2);
        assert!((model.intercept() - 2.0).abs() < 1e-6);
        assert!((model.coefficients()[0] - 3.0).abs() < 1e-6);
        assert!((model.coefficients()[1] + 0.5).abs() < 1e-6);
        assert!((model.summary().r2 - 1.0).abs() < 1e-9);
        assert_eq!(model.summary().num_instances, 12);
        assert!((model.predict(&[1.0, 2.0]) - 4.0).abs() < 1e-6);

        let predicted = model.transform(&assembled).unwrap();
        assert_eq!(
            predicted.columns(),
            vec!["x1", "x2", "label", "features", "prediction"]
        );
        let batches = predicted
            .select(&["label", "prediction"])
            .unwrap()
            .collect()
            .await
            .unwrap();
        for batch in batches {
            let labels = as_float64_array(batch.column(0)).unwrap();
            let predictions = as_float64_array(batch.column(1)).unwrap();
            for i in 0..batch.num_rows() {
                assert!((labels.value(i) - predictions.value(i)).abs() < 1e-6);
            }
        }
    }

    #[tokio::test]
    async fn test_fit_rejects_bad_input() {
        let (_dir, session) = session();
        let df = training_frame(&session);
        let err = LinearRegression::new().fit(&df).await.unwrap_err();
        assert!(err.to_string().contains("features"));

        let assembled = VectorAssembler::new(&["x1"], "features")
            .transform(&df)
            .await
            .unwrap();
        let empty = assembled.filter(lit(false)).unwrap();
        let err = LinearRegression::new().fit(&empty).await.unwrap_err();
        assert!(err.to_string().contains("empty"));

        let err = LinearRegression::new()
            .reg_param(-1.0)
            .fit(&assembled)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("regParam"));
    }

    #[tokio::test]
    async fn test_singular_normal_solver() {
        let (_dir, session) = session();
        let df = training_frame(&session);
        let assembled = VectorAssembler::new(&["x1", "x1"], "features")
            .transform(&df)
            .await
            .unwrap();
        assert!(
            LinearRegression::new()
                .solver(Solver::Normal)
                .fit(&assembled)
                .await
                .is_err()
        );
        let model = LinearRegression::new()
            .max_iter(5000)
            .fit(&assembled)
            .await
            .unwrap();
        assert!(model.summary().total_iterations > 0);
    }
}
