//! Column functions with Spark names and semantics.

use std::fmt;
use std::sync::Arc;

use datafusion::arrow::array::new_empty_array;
use datafusion::arrow::datatypes::DataType;
use datafusion::common::{Column, DataFusionError, ScalarValue, TableReference};
use datafusion::functions::expr_fn;
use datafusion::functions_aggregate::expr_fn as agg;
use datafusion::logical_expr::conditional_expressions::CaseBuilder;
use datafusion::logical_expr::{
    ColumnarValue, Expr, ScalarFunctionImplementation, ScalarUDF, SortExpr, Volatility, cast,
    create_udf,
};

pub use datafusion::logical_expr::lit;

use crate::error::{LakebookError, Result};

/// Reference a column by name, without case folding.
///
/// `alias.name` refers to a column of a dataframe aliased `alias`. Wrap the
/// name in backticks to use it verbatim.
pub fn col(name: &str) -> Expr {
    if let Some(quoted) = name.strip_prefix('`').and_then(|n| n.strip_suffix('`')) {
        return Expr::Column(Column::new_unqualified(quoted));
    }
    match name.rsplit_once('.') {
        Some((qualifier, field)) if !qualifier.is_empty() && !field.is_empty() => Expr::Column(
            Column::new(Some(TableReference::bare(qualifier)), field),
        ),
        _ => Expr::Column(Column::new_unqualified(name)),
    }
}

/// Start a `CASE WHEN` chain. Finish it with `.otherwise(value)` or `.end()`.
pub fn when(condition: Expr, value: Expr) -> CaseBuilder {
    datafusion::logical_expr::when(condition, value)
}

pub fn count(expr: Expr) -> Expr {
    agg::count(expr)
}

/// `count(*)`.
pub fn count_star() -> Expr {
    agg::count(lit(1i64))
}

pub fn sum(expr: Expr) -> Expr {
    agg::sum(expr)
}

pub fn avg(expr: Expr) -> Expr {
    agg::avg(expr)
}

pub fn max(expr: Expr) -> Expr {
    agg::max(expr)
}

pub fn min(expr: Expr) -> Expr {
    agg::min(expr)
}

/// Round half away from zero to `scale` decimal places.
pub fn round(expr: Expr, scale: i32) -> Expr {
    expr_fn::round(vec![expr, lit(i64::from(scale))])
}

/// Parse a string column into a date with a Spark datetime pattern.
pub fn to_date(expr: Expr, pattern: &str) -> Result<Expr> {
    let format = spark_to_chrono_format(pattern)?;
    Ok(expr_fn::to_date(vec![expr, lit(format)]))
}

pub fn current_date() -> Expr {
    expr_fn::current_date()
}

/// Days from `start` to `end`.
pub fn datediff(end: Expr, start: Expr) -> Expr {
    let days = |e: Expr| cast(cast(e, DataType::Date32), DataType::Int32);
    days(end) - days(start)
}

/// Ascending, nulls first.
pub fn asc(expr: Expr) -> SortExpr {
    expr.sort(true, true)
}

/// Descending, nulls last.
pub fn desc(expr: Expr) -> SortExpr {
    expr.sort(false, false)
}

pub fn coalesce(exprs: Vec<Expr>) -> Expr {
    expr_fn::coalesce(exprs)
}

pub fn upper(expr: Expr) -> Expr {
    expr_fn::upper(expr)
}

pub fn lower(expr: Expr) -> Expr {
    expr_fn::lower(expr)
}

pub fn concat(exprs: Vec<Expr>) -> Expr {
    expr_fn::concat(exprs)
}

/// Translate a Spark datetime pattern to a chrono format string.
pub fn spark_to_chrono_format(pattern: &str) -> Result<String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            if chars.get(i + 1) == Some(&'\'') {
                out.push('\'');
                i += 2;
                continue;
            }
            let end = chars[i + 1..]
                .iter()
                .position(|&ch| ch == '\'')
                .map(|p| i + 1 + p)
                .ok_or_else(|| {
                    LakebookError::invalid(format!("unterminated quote in pattern '{pattern}'"))
                })?;
            for &literal in &chars[i + 1..end] {
                push_literal(&mut out, literal);
            }
            i = end + 1;
            continue;
        }
        if !c.is_ascii_alphabetic() {
            push_literal(&mut out, c);
            i += 1;
            continue;
        }
        let run = chars[i..].iter().take_while(|&&ch| ch == c).count();
        let item = match (c, run) {
            ('y', 2) => "%y",
            ('y', _) => "%Y",
            ('M', 1 | 2) => "%m",
            ('M', 3) => "%b",
            ('M', _) => "%B",
            ('d', 1 | 2) => "%d",
            ('D', _) => "%j",
            ('H', 1 | 2) => "%H",
            ('h', 1 | 2) => "%I",
            ('m', 1 | 2) => "%M",
            ('s', 1 | 2) => "%S",
            ('S', 3) => "%3f",
            ('S', 6) => "%6f",
            ('S', 9) => "%9f",
            ('a', 1) => "%p",
            ('E', 1..=3) => "%a",
            ('E', _) => "%A",
            _ => {
                return Err(LakebookError::invalid(format!(
                    "unsupported datetime pattern letter '{}' (x{run}) in '{pattern}'",
                    c
                )));
            }
        };
        out.push_str(item);
        i += run;
    }
    Ok(out)
}

fn push_literal(out: &mut String, c: char) {
    if c == '%' {
        out.push_str("%%");
    } else {
        out.push(c);
    }
}

/// Row-wise function body for [`udf`].
pub type UdfBody = dyn Fn(&[ScalarValue]) -> Result<ScalarValue> + Send + Sync;

/// A scalar function built from a Rust closure.
#[derive(Clone)]
pub struct UserDefinedFunction {
    inner: ScalarUDF,
}

impl fmt::Debug for UserDefinedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserDefinedFunction")
            .field("name", &self.inner.name())
            .finish()
    }
}

impl UserDefinedFunction {
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn inner(&self) -> &ScalarUDF {
        &self.inner
    }

    /// Apply the function to argument expressions.
    pub fn call(&self, args: Vec<Expr>) -> Expr {
        self.inner.call(args)
    }
}

/// Build a function that is evaluated one row at a time.
///
/// The closure receives one value per argument. Returning an untyped
/// `ScalarValue::Null` yields a null of `return_type`, and other values are
/// cast to `return_type`.
pub fn udf<F>(
    name: &str,
    input_types: Vec<DataType>,
    return_type: DataType,
    body: F,
) -> UserDefinedFunction
where
    F: Fn(&[ScalarValue]) -> Result<ScalarValue> + Send + Sync + 'static,
{
    let body: Arc<UdfBody> = Arc::new(body);
    let output_type = return_type.clone();
    let implementation: ScalarFunctionImplementation =
        Arc::new(move |args: &[ColumnarValue]| evaluate_rows(body.as_ref(), &output_type, args));
    UserDefinedFunction {
        inner: create_udf(
            name,
            input_types,
            return_type,
            Volatility::Immutable,
            implementation,
        ),
    }
}

fn evaluate_rows(
    body: &UdfBody,
    return_type: &DataType,
    args: &[ColumnarValue],
) -> datafusion::error::Result<ColumnarValue> {
    let all_scalar = args.iter().all(|a| matches!(a, ColumnarValue::Scalar(_)));
    let arrays = ColumnarValue::values_to_arrays(args)?;
    let num_rows = arrays.first().map(|a| a.len()).unwrap_or(1);

    let mut results = Vec::with_capacity(num_rows);
    for row in 0..num_rows {
        let values = arrays
            .iter()
            .map(|a| ScalarValue::try_from_array(a, row))
            .collect::<datafusion::error::Result<Vec<_>>>()?;
        let value = body(&values).map_err(DataFusionError::from)?;
        results.push(conform_scalar(value, return_type)?);
    }

    if all_scalar {
        if let Some(value) = results.into_iter().next() {
            return Ok(ColumnarValue::Scalar(value));
        }
        return Ok(ColumnarValue::Scalar(ScalarValue::try_from(return_type)?));
    }
    if results.is_empty() {
        return Ok(ColumnarValue::Array(new_empty_array(return_type)));
    }
    Ok(ColumnarValue::Array(ScalarValue::iter_to_array(results)?))
}

fn conform_scalar(
    value: ScalarValue,
    return_type: &DataType,
) -> datafusion::error::Result<ScalarValue> {
    if value.is_null() {
        return ScalarValue::try_from(return_type);
    }
    if &value.data_type() == return_type {
        return Ok(value);
    }
    value.cast_to(return_type)
}
