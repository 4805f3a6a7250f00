//! Feature transformers.

use std::str::FromStr;

use datafusion::arrow::datatypes::DataType;
use datafusion::functions_nested::expr_fn::make_array;
use datafusion::logical_expr::{Expr, cast};
use tracing::debug;

use crate::dataframe::{DataFrame, resolve_column};
use crate::error::{LakebookError, Result};

/// How [`VectorAssembler`] treats rows with null inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HandleInvalid {
    /// Fail the transform.
    #[default]
    Error,
    /// Drop the row.
    Skip,
    /// Keep the row with null elements.
    Keep,
}

impl FromStr for HandleInvalid {
    type Err = LakebookError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "error" => Ok(HandleInvalid::Error),
            "skip" => Ok(HandleInvalid::Skip),
            "keep" => Ok(HandleInvalid::Keep),
            other => Err(LakebookError::invalid(format!(
                "handleInvalid must be one of error, skip, keep; got '{other}'"
            ))),
        }
    }
}

/// Combines numeric columns into a `list<double>` feature vector.
#[derive(Debug, Clone)]
pub struct VectorAssembler {
    input_cols: Vec<String>,
    output_col: String,
    handle_invalid: HandleInvalid,
}

impl VectorAssembler {
    pub fn new<S: AsRef<str>>(input_cols: &[S], output_col: &str) -> Self {
        Self {
            input_cols: input_cols.iter().map(|c| c.as_ref().to_string()).collect(),
            output_col: output_col.to_string(),
            handle_invalid: HandleInvalid::default(),
        }
    }

    pub fn handle_invalid(mut self, handle_invalid: HandleInvalid) -> Self {
        self.handle_invalid = handle_invalid;
        self
    }

    pub fn input_cols(&self) -> &[String] {
        &self.input_cols
    }

    pub fn output_col(&self) -> &str {
        &self.output_col
    }

    pub async fn transform(&self, df: &DataFrame) -> Result<DataFrame> {
        if self.input_cols.is_empty() {
            return Err(LakebookError::invalid("VectorAssembler needs at least one input column"));
        }
        let schema = df.df_schema();
        let mut inputs = Vec::with_capacity(self.input_cols.len());
        for name in &self.input_cols {
            let column = resolve_column(schema, name)?;
            let data_type = schema.field_from_column(&column)?.data_type();
            if !(data_type.is_numeric() || data_type == &DataType::Boolean) {
                return Err(LakebookError::invalid(format!(
                    "data type {data_type} of column {name} is not supported by VectorAssembler"
                )));
            }
            inputs.push(Expr::Column(column));
        }

        let any_null = inputs
            .iter()
            .map(|e| e.clone().is_null())
            .reduce(Expr::or)
            .ok_or_else(|| LakebookError::invalid("no input columns"))?;
        let df = match self.handle_invalid {
            HandleInvalid::Keep => df.clone(),
            HandleInvalid::Skip => df.filter(!any_null)?,
            HandleInvalid::Error => {
                let invalid = df.filter(any_null)?.count().await?;
                if invalid > 0 {
                    return Err(LakebookError::invalid(format!(
                        "encountered null while assembling a row with handleInvalid = \"error\"; \
                         {invalid} rows have nulls in {:?}. Consider removing nulls from the \
                         dataset or using handleInvalid = \"keep\" or \"skip\"",
                        self.input_cols
                    )));
                }
                df.clone()
            }
        };

        let elements: Vec<Expr> = inputs
            .into_iter()
            .map(|e| cast(e, DataType::Float64))
            .collect();
        debug!(
            "Assembling {:?} into {}",
            self.input_cols, self.output_col
        );
        df.with_column(&self.output_col, make_array(elements))
    }
}
