use datafusion::arrow::datatypes::DataType;
use datafusion::common::{Column, ScalarValue};
use datafusion::functions::expr_fn::coalesce;
use datafusion::logical_expr::{Expr, cast, lit, when};

use super::{DataFrame, resolve_column};
use crate::error::{LakebookError, Result};

/// Replacement value for [`DataFrameNaFunctions::fill`].
#[derive(Debug, Clone, PartialEq)]
pub enum FillValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl FillValue {
    fn applies_to(&self, data_type: &DataType) -> bool {
        match self {
            FillValue::Int(_) | FillValue::Float(_) => data_type.is_numeric(),
            FillValue::Str(_) => matches!(
                data_type,
                DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View
            ),
            FillValue::Bool(_) => data_type == &DataType::Boolean,
        }
    }

    fn scalar(&self) -> ScalarValue {
        match self {
            FillValue::Int(v) => ScalarValue::Int64(Some(*v)),
            FillValue::Float(v) => ScalarValue::Float64(Some(*v)),
            FillValue::Str(v) => ScalarValue::Utf8(Some(v.clone())),
            FillValue::Bool(v) => ScalarValue::Boolean(Some(*v)),
        }
    }
}

impl From<i32> for FillValue {
    fn from(v: i32) -> Self {
        FillValue::Int(v.into())
    }
}

impl From<i64> for FillValue {
    fn from(v: i64) -> Self {
        FillValue::Int(v)
    }
}

impl From<f64> for FillValue {
    fn from(v: f64) -> Self {
        FillValue::Float(v)
    }
}

impl From<&str> for FillValue {
    fn from(v: &str) -> Self {
        FillValue::Str(v.to_string())
    }
}

impl From<String> for FillValue {
    fn from(v: String) -> Self {
        FillValue::Str(v)
    }
}

impl From<bool> for FillValue {
    fn from(v: bool) -> Self {
        FillValue::Bool(v)
    }
}

/// Null handling, returned by [`DataFrame::na`].
#[derive(Debug, Clone)]
pub struct DataFrameNaFunctions {
    df: DataFrame,
}

impl DataFrameNaFunctions {
    pub(crate) fn new(df: DataFrame) -> Self {
        Self { df }
    }

    fn columns(&self, subset: Option<&[&str]>) -> Result<Vec<Column>> {
        let schema = self.df.df_schema();
        match subset {
            Some(names) => names.iter().map(|n| resolve_column(schema, n)).collect(),
            None => Ok(schema
                .iter()
                .map(|(q, f)| Column::new(q.cloned(), f.name()))
                .collect()),
        }
    }

    /// Drop rows containing any null.
    pub fn drop(&self) -> Result<DataFrame> {
        self.drop_with("any", None)
    }

    /// Drop rows where `any` or `all` of the considered columns are null.
    pub fn drop_with(&self, how: &str, subset: Option<&[&str]>) -> Result<DataFrame> {
        let columns = self.columns(subset)?;
        let not_null = columns.into_iter().map(|c| Expr::Column(c).is_not_null());
        let predicate = match how.to_lowercase().as_str() {
            "any" => not_null.reduce(Expr::and),
            "all" => not_null.reduce(Expr::or),
            other => {
                return Err(LakebookError::invalid(format!(
                    "how ('{other}') should be 'any' or 'all'"
                )));
            }
        };
        match predicate {
            Some(predicate) => self.df.filter(predicate),
            None => Ok(self.df.clone()),
        }
    }

    /// Keep rows with at least `min_non_nulls` non-null values.
    pub fn drop_thresh(&self, min_non_nulls: usize, subset: Option<&[&str]>) -> Result<DataFrame> {
        let indicators = self
            .columns(subset)?
            .into_iter()
            .map(|c| {
                Ok(when(Expr::Column(c).is_not_null(), lit(1i64)).otherwise(lit(0i64))?)
            })
            .collect::<Result<Vec<Expr>>>()?;
        let Some(non_nulls) = indicators.into_iter().reduce(|a, b| a + b) else {
            return Ok(self.df.clone());
        };
        self.df.filter(non_nulls.gt_eq(lit(min_non_nulls as i64)))
    }

    /// Replace nulls in every column whose type matches the value.
    pub fn fill(&self, value: impl Into<FillValue>) -> Result<DataFrame> {
        self.fill_columns(value.into(), None)
    }

    pub fn fill_subset(&self, value: impl Into<FillValue>, subset: &[&str]) -> Result<DataFrame> {
        self.fill_columns(value.into(), Some(subset))
    }

    fn fill_columns(&self, value: FillValue, subset: Option<&[&str]>) -> Result<DataFrame> {
        let targets = self.columns(subset)?;
        let schema = self.df.df_schema();
        let replacement = lit(value.scalar());
        let projection: Vec<Expr> = schema
            .iter()
            .map(|(qualifier, field)| {
                let column = Column::new(qualifier.cloned(), field.name());
                let is_target = targets.contains(&column) && value.applies_to(field.data_type());
                if is_target {
                    coalesce(vec![
                        Expr::Column(column),
                        cast(replacement.clone(), field.data_type().clone()),
                    ])
                    .alias_qualified(qualifier.cloned(), field.name())
                } else {
                    Expr::Column(column)
                }
            })
            .collect();
        Ok(self.df.derive(self.df.inner.clone().select(projection)?))
    }
}
