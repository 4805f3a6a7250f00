use datafusion::functions_aggregate::expr_fn::{avg, count, max, min, sum};
use datafusion::logical_expr::Expr;

use super::{DataFrame, with_output_name};
use crate::error::{LakebookError, Result};
use crate::functions::count_star;

/// Result of [`DataFrame::group_by`].
#[derive(Debug, Clone)]
pub struct GroupedData {
    df: DataFrame,
    group_exprs: Vec<Expr>,
}

impl GroupedData {
    pub(crate) fn new(df: DataFrame, group_exprs: Vec<Expr>) -> Self {
        Self { df, group_exprs }
    }

    pub fn agg(&self, aggregates: Vec<Expr>) -> Result<DataFrame> {
        let aggregates = aggregates
            .into_iter()
            .map(with_output_name)
            .collect::<Result<Vec<_>>>()?;
        let inner = self
            .df
            .inner
            .clone()
            .aggregate(self.group_exprs.clone(), aggregates)?;
        Ok(self.df.derive(inner))
    }

    /// Aggregate `(column, function)` pairs, naming each output `function(column)`.
    pub fn agg_map(&self, pairs: &[(&str, &str)]) -> Result<DataFrame> {
        let aggregates = pairs
            .iter()
            .map(|(column, function)| self.aggregate(column, function))
            .collect::<Result<Vec<_>>>()?;
        self.agg(aggregates)
    }

    /// Row count per group, in a column named `count`.
    pub fn count(&self) -> Result<DataFrame> {
        self.agg(vec![count_star().alias("count")])
    }

    pub fn sum(&self, columns: &[&str]) -> Result<DataFrame> {
        self.apply_all("sum", columns)
    }

    pub fn avg(&self, columns: &[&str]) -> Result<DataFrame> {
        self.apply_all("avg", columns)
    }

    pub fn mean(&self, columns: &[&str]) -> Result<DataFrame> {
        self.apply_all("avg", columns)
    }

    pub fn max(&self, columns: &[&str]) -> Result<DataFrame> {
        self.apply_all("max", columns)
    }

    pub fn min(&self, columns: &[&str]) -> Result<DataFrame> {
        self.apply_all("min", columns)
    }

    fn apply_all(&self, function: &str, columns: &[&str]) -> Result<DataFrame> {
        let aggregates = columns
            .iter()
            .map(|column| self.aggregate(column, function))
            .collect::<Result<Vec<_>>>()?;
        self.agg(aggregates)
    }

    fn aggregate(&self, column: &str, function: &str) -> Result<Expr> {
        let function = function.to_lowercase();
        let input = self.df.col(column)?;
        let (name, expr) = match function.as_str() {
            "sum" => ("sum", sum(input)),
            "avg" | "mean" => ("avg", avg(input)),
            "max" => ("max", max(input)),
            "min" => ("min", min(input)),
            "count" => ("count", count(input)),
            other => {
                return Err(LakebookError::unsupported(format!(
                    "aggregate function '{other}'"
                )));
            }
        };
        Ok(expr.alias(format!("{name}({column})")))
    }
}
