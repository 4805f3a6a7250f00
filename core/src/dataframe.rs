//! Lazy, immutable dataframes with Spark semantics over DataFusion plans.
//!
//! Every transformation returns a new [`DataFrame`] wrapping a new logical
//! plan. Actions (`show`, `collect`, `count`, writes) first hand the plan to
//! the session's cache manager, which swaps cached subtrees for their stored
//! rows, and then execute it against the session's current state.

mod group;
mod join;
mod na;
mod show;

use std::sync::Arc;

use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::common::tree_node::{Transformed, TreeNode};
use datafusion::common::{Column, DFSchema};
use datafusion::dataframe::DataFrame as DFDataFrame;
use datafusion::logical_expr::{Expr, LogicalPlan, Partitioning, SortExpr};
use datafusion::physical_plan::{ExecutionPlanProperties, displayable};
use tracing::debug;

pub use group::GroupedData;
pub use join::parse_join_type;
pub use na::{DataFrameNaFunctions, FillValue};

use crate::cache::StorageLevel;
use crate::error::{LakebookError, Result};
use crate::session::Session;
use crate::types::tree_string;
use crate::writer::DataFrameWriter;

const DEFAULT_SHOW_ROWS: usize = 20;
const DEFAULT_TRUNCATE: usize = 20;

#[derive(Clone)]
pub struct DataFrame {
    session: Session,
    inner: DFDataFrame,
}

impl std::fmt::Debug for DataFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFrame")
            .field("columns", &self.columns())
            .finish()
    }
}

impl DataFrame {
    pub(crate) fn new(session: Session, inner: DFDataFrame) -> Self {
        Self { session, inner }
    }

    fn derive(&self, inner: DFDataFrame) -> Self {
        Self::new(self.session.clone(), inner)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn logical_plan(&self) -> &LogicalPlan {
        self.inner.logical_plan()
    }

    /// The underlying DataFusion dataframe, without cache substitution.
    pub fn into_inner(self) -> DFDataFrame {
        self.inner
    }

    /// The plan with cached subtrees substituted, bound to the current state.
    pub(crate) async fn prepared(&self) -> Result<DFDataFrame> {
        let state = self.session.ctx().state();
        let plan = self
            .session
            .cache_manager()
            .prepare(&state, self.inner.logical_plan().clone())
            .await?;
        Ok(DFDataFrame::new(state, plan))
    }

    pub(crate) fn df_schema(&self) -> &DFSchema {
        self.inner.schema()
    }

    // Inspection

    pub fn schema(&self) -> SchemaRef {
        Arc::new(self.inner.schema().as_arrow().clone())
    }

    pub fn columns(&self) -> Vec<String> {
        self.inner
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    }

    /// Schema in Spark's tree format.
    pub fn schema_string(&self) -> String {
        tree_string(self.inner.schema().as_arrow())
    }

    pub fn print_schema(&self) {
        print!("{}", self.schema_string());
    }

    pub async fn explain_string(&self, extended: bool) -> Result<String> {
        let plan = self.inner.logical_plan();
        let mut out = format!("== Logical Plan ==\n{}\n", plan.display_indent());
        if extended {
            let state = self.session.ctx().state();
            let optimized = state.optimize(plan)?;
            let physical = state.create_physical_plan(plan).await?;
            out.push_str(&format!(
                "\n== Optimized Logical Plan ==\n{}\n",
                optimized.display_indent()
            ));
            out.push_str(&format!(
                "\n== Physical Plan ==\n{}",
                displayable(physical.as_ref()).indent(true)
            ));
        }
        Ok(out)
    }

    pub async fn explain(&self, extended: bool) -> Result<()> {
        print!("{}", self.explain_string(extended).await?);
        Ok(())
    }

    /// A qualified reference to one of this dataframe's columns.
    ///
    /// Unlike [`crate::functions::col`], the reference keeps pointing at this
    /// dataframe after a join with another one that has the same column.
    pub fn col(&self, name: &str) -> Result<Expr> {
        Ok(Expr::Column(resolve_column(self.inner.schema(), name)?))
    }

    // Actions

    pub async fn collect(&self) -> Result<Vec<RecordBatch>> {
        Ok(self.prepared().await?.collect().await?)
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.prepared().await?.count().await?)
    }

    /// Number of partitions of the physical plan.
    pub async fn num_partitions(&self) -> Result<usize> {
        let physical = self.prepared().await?.create_physical_plan().await?;
        Ok(physical.output_partitioning().partition_count())
    }

    /// Render up to `n` rows as a table. Cells longer than 20 characters are
    /// cut when `truncate` is set.
    pub async fn show_string(&self, n: usize, truncate: bool) -> Result<String> {
        let batches = self
            .prepared()
            .await?
            .limit(0, n.checked_add(1))?
            .collect()
            .await?;
        let truncate = truncate.then_some(DEFAULT_TRUNCATE);
        show::format_table(&self.columns(), &batches, n, truncate)
    }

    pub async fn show(&self, n: usize) -> Result<()> {
        print!("{}", self.show_string(n, true).await?);
        Ok(())
    }

    pub async fn show_default(&self) -> Result<()> {
        self.show(DEFAULT_SHOW_ROWS).await
    }

    // Transformations

    pub fn select(&self, columns: &[&str]) -> Result<DataFrame> {
        let exprs = columns
            .iter()
            .map(|name| self.col(name))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.derive(self.inner.clone().select(exprs)?))
    }

    pub fn select_exprs(&self, exprs: Vec<Expr>) -> Result<DataFrame> {
        let exprs = exprs
            .into_iter()
            .map(with_output_name)
            .collect::<Result<Vec<_>>>()?;
        Ok(self.derive(self.inner.clone().select(exprs)?))
    }

    pub fn filter(&self, predicate: Expr) -> Result<DataFrame> {
        Ok(self.derive(self.inner.clone().filter(predicate)?))
    }

    pub fn where_(&self, predicate: Expr) -> Result<DataFrame> {
        self.filter(predicate)
    }

    /// Add a column, replacing any column with the same name.
    pub fn with_column(&self, name: &str, expr: Expr) -> Result<DataFrame> {
        Ok(self.derive(self.inner.clone().with_column(name, expr)?))
    }

    /// Rename a column. Renaming a missing column is a no-op.
    pub fn with_column_renamed(&self, existing: &str, new_name: &str) -> Result<DataFrame> {
        Ok(self.derive(
            self.inner
                .clone()
                .with_column_renamed(existing, new_name)?,
        ))
    }

    /// Drop columns. Names that do not exist are ignored.
    pub fn drop(&self, columns: &[&str]) -> Result<DataFrame> {
        let schema = self.inner.schema();
        let keep: Vec<Expr> = schema
            .iter()
            .filter(|(_, field)| {
                !columns
                    .iter()
                    .any(|name| field.name().eq_ignore_ascii_case(name))
            })
            .map(|(qualifier, field)| {
                Expr::Column(Column::new(qualifier.cloned(), field.name()))
            })
            .collect();
        Ok(self.derive(self.inner.clone().select(keep)?))
    }

    pub fn limit(&self, n: usize) -> Result<DataFrame> {
        Ok(self.derive(self.inner.clone().limit(0, Some(n))?))
    }

    pub fn distinct(&self) -> Result<DataFrame> {
        Ok(self.derive(self.inner.clone().distinct()?))
    }

    /// Union by column position, keeping duplicates.
    pub fn union(&self, other: &DataFrame) -> Result<DataFrame> {
        if self.columns().len() != other.columns().len() {
            return Err(LakebookError::analysis(format!(
                "union can only be performed on inputs with the same number of columns, \
                 but the first has {} and the second has {}",
                self.columns().len(),
                other.columns().len()
            )));
        }
        Ok(self.derive(self.inner.clone().union(other.inner.clone())?))
    }

    pub fn alias(&self, name: &str) -> Result<DataFrame> {
        Ok(self.derive(self.inner.clone().alias(name)?))
    }

    pub fn group_by(&self, columns: &[&str]) -> Result<GroupedData> {
        let exprs = columns
            .iter()
            .map(|name| self.col(name))
            .collect::<Result<Vec<_>>>()?;
        Ok(GroupedData::new(self.clone(), exprs))
    }

    /// Sort by column names. Nulls go first when ascending, last otherwise.
    pub fn order_by(&self, columns: &[&str], ascending: bool) -> Result<DataFrame> {
        let sort = columns
            .iter()
            .map(|name| Ok(self.col(name)?.sort(ascending, ascending)))
            .collect::<Result<Vec<SortExpr>>>()?;
        self.sort(sort)
    }

    pub fn sort(&self, sort: Vec<SortExpr>) -> Result<DataFrame> {
        Ok(self.derive(self.inner.clone().sort(sort)?))
    }

    pub fn na(&self) -> DataFrameNaFunctions {
        DataFrameNaFunctions::new(self.clone())
    }

    // Caching

    /// Cache with `MEMORY_AND_DISK`.
    pub async fn cache(&self) -> Result<DataFrame> {
        self.persist(StorageLevel::MemoryAndDisk).await
    }

    pub async fn persist(&self, level: StorageLevel) -> Result<DataFrame> {
        self.session
            .cache_manager()
            .persist(self.logical_plan(), level)
            .await?;
        Ok(self.clone())
    }

    pub async fn unpersist(&self) -> Result<DataFrame> {
        let removed = self
            .session
            .cache_manager()
            .unpersist(self.logical_plan())
            .await?;
        debug!("Unpersist removed cache entry: {}", removed);
        Ok(self.clone())
    }

    pub async fn storage_level(&self) -> StorageLevel {
        self.session
            .cache_manager()
            .storage_level(self.logical_plan())
            .await
    }

    pub async fn is_cached(&self) -> bool {
        self.storage_level().await.is_cached()
    }

    // Partitioning

    /// Round-robin into `n` partitions.
    pub fn repartition(&self, n: usize) -> Result<DataFrame> {
        self.round_robin("repartition", n)
    }

    /// Reduce to `n` partitions. Asking for more partitions than the
    /// dataframe has leaves it unchanged.
    pub fn coalesce(&self, n: usize) -> Result<DataFrame> {
        if n > 0 && n >= self.planned_partitions() {
            return Ok(self.clone());
        }
        self.round_robin("coalesce", n)
    }

    /// Partition count the plan will run with: that of the nearest explicit
    /// repartition, else the session's target partitions.
    fn planned_partitions(&self) -> usize {
        let mut node = self.inner.logical_plan();
        loop {
            match node {
                LogicalPlan::Repartition(repartition) => {
                    return match &repartition.partitioning_scheme {
                        Partitioning::RoundRobinBatch(n) | Partitioning::Hash(_, n) => *n,
                        Partitioning::DistributeBy(_) => self.target_partitions(),
                    };
                }
                LogicalPlan::Projection(_)
                | LogicalPlan::Filter(_)
                | LogicalPlan::SubqueryAlias(_) => match node.inputs().into_iter().next() {
                    Some(input) => node = input,
                    None => return self.target_partitions(),
                },
                _ => return self.target_partitions(),
            }
        }
    }

    fn target_partitions(&self) -> usize {
        self.session.ctx().state().config().target_partitions()
    }

    fn round_robin(&self, operation: &str, n: usize) -> Result<DataFrame> {
        if n == 0 {
            return Err(LakebookError::invalid(format!(
                "number of partitions for {operation} must be positive"
            )));
        }
        Ok(self.derive(
            self.inner
                .clone()
                .repartition(Partitioning::RoundRobinBatch(n))?,
        ))
    }

    // Views

    pub fn create_or_replace_temp_view(&self, name: &str) -> Result<()> {
        self.register_view(name, true)
    }

    /// Fails if a view with this name already exists.
    pub fn create_temp_view(&self, name: &str) -> Result<()> {
        self.register_view(name, false)
    }

    fn register_view(&self, name: &str, replace: bool) -> Result<()> {
        self.session
            .catalog()
            .register_temp_view(name, self.inner.clone().into_view(), replace)?;
        debug!("Registered temporary view {}", name);
        Ok(())
    }

    pub fn write(&self) -> DataFrameWriter {
        DataFrameWriter::new(self.clone())
    }
}

/// Find a column by name: exact match first, then `qualifier.name`, then a
/// case-insensitive match.
pub(crate) fn resolve_column(schema: &DFSchema, name: &str) -> Result<Column> {
    let name = name.trim_matches('`');
    let candidates = |matches: &dyn Fn(Option<&str>, &str) -> bool| -> Vec<Column> {
        schema
            .iter()
            .filter(|(q, f)| matches(q.map(|q| q.table()), f.name()))
            .map(|(q, f)| Column::new(q.cloned(), f.name()))
            .collect()
    };

    let mut found = candidates(&|_, field| field == name);
    if found.is_empty() {
        if let Some((qualifier, field_name)) = name.rsplit_once('.') {
            found = candidates(&|q, field| {
                q.is_some_and(|q| q.eq_ignore_ascii_case(qualifier))
                    && field.eq_ignore_ascii_case(field_name)
            });
        }
    }
    if found.is_empty() {
        found = candidates(&|_, field| field.eq_ignore_ascii_case(name));
    }
    match found.len() {
        1 => Ok(found.remove(0)),
        0 => {
            let available: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
            Err(LakebookError::analysis(format!(
                "cannot resolve column '{name}' among [{}]",
                available.join(", ")
            )))
        }
        _ => Err(LakebookError::analysis(format!(
            "reference '{name}' is ambiguous, could be: {}",
            found
                .iter()
                .map(|c| c.flat_name())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// Output column name of an expression: its display without table qualifiers.
pub(crate) fn output_name(expr: &Expr) -> Result<String> {
    let unqualified = expr
        .clone()
        .transform(|e| match e {
            Expr::Column(c) => Ok(Transformed::yes(Expr::Column(Column::new_unqualified(
                c.name,
            )))),
            other => Ok(Transformed::no(other)),
        })?
        .data;
    Ok(unqualified.schema_name().to_string())
}

/// Name a computed expression by [`output_name`]. Columns and aliases keep
/// their own names.
pub(crate) fn with_output_name(expr: Expr) -> Result<Expr> {
    match expr {
        Expr::Column(_) | Expr::Alias(_) => Ok(expr),
        other => {
            let name = output_name(&other)?;
            Ok(other.alias(name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use datafusion::common::TableReference;
    use datafusion::prelude::{col, lit};

    fn joined_schema() -> DFSchema {
        let left = DFSchema::try_from_qualified_schema(
            "df_0",
            &Schema::new(vec![
                Field::new("id", DataType::Int64, false),
                Field::new("Name", DataType::Utf8, true),
            ]),
        )
        .unwrap();
        let right = DFSchema::try_from_qualified_schema(
            "df_1",
            &Schema::new(vec![Field::new("id", DataType::Int64, false)]),
        )
        .unwrap();
        left.join(&right).unwrap()
    }

    #[test]
    fn test_resolve_column() {
        let schema = joined_schema();
        let name = resolve_column(&schema, "name").unwrap();
        assert_eq!(name, Column::new(Some(TableReference::bare("df_0")), "Name"));
        let right_id = resolve_column(&schema, "df_1.id").unwrap();
        assert_eq!(right_id.relation, Some(TableReference::bare("df_1")));
        assert!(matches!(
            resolve_column(&schema, "id"),
            Err(LakebookError::Analysis(_))
        ));
        assert!(resolve_column(&schema, "missing").is_err());
    }

    #[test]
    fn test_output_name_strips_qualifiers() {
        let expr = Expr::Column(Column::new(Some(TableReference::bare("df_0")), "a")) + lit(1);
        assert!(!output_name(&expr).unwrap().contains("df_0"));
        let aliased = with_output_name(col("a").alias("b")).unwrap();
        assert_eq!(aliased.schema_name().to_string(), "b");
    }
}
