use datafusion::common::{Column, JoinType};
use datafusion::dataframe::DataFrame as DFDataFrame;
use datafusion::functions::expr_fn::coalesce;
use datafusion::logical_expr::{Expr, LogicalPlanBuilder};

use super::{DataFrame, resolve_column};
use crate::error::{LakebookError, Result};

/// Map a Spark join type name to a DataFusion join type.
pub fn parse_join_type(how: &str) -> Result<JoinType> {
    let normalized = how.to_lowercase().replace('_', "");
    match normalized.as_str() {
        "inner" | "cross" => Ok(JoinType::Inner),
        "outer" | "full" | "fullouter" => Ok(JoinType::Full),
        "left" | "leftouter" => Ok(JoinType::Left),
        "right" | "rightouter" => Ok(JoinType::Right),
        "semi" | "leftsemi" => Ok(JoinType::LeftSemi),
        "anti" | "leftanti" => Ok(JoinType::LeftAnti),
        _ => Err(LakebookError::invalid(format!(
            "unsupported join type '{how}'. Supported join types include: inner, outer, full, \
             fullouter, full_outer, leftouter, left, left_outer, rightouter, right, right_outer, \
             leftsemi, left_semi, semi, leftanti, left_anti, anti, cross"
        ))),
    }
}

impl DataFrame {
    /// Join on an arbitrary condition, e.g. `df.col("id")?.eq(other.col("id")?)`.
    pub fn join(&self, other: &DataFrame, on: Expr, how: &str) -> Result<DataFrame> {
        let join_type = parse_join_type(how)?;
        let inner = self
            .inner
            .clone()
            .join_on(other.inner.clone(), join_type, [on])?;
        Ok(self.derive(inner))
    }

    /// Equi-join on columns present on both sides, keeping one copy of each.
    pub fn join_using(&self, other: &DataFrame, columns: &[&str], how: &str) -> Result<DataFrame> {
        let join_type = parse_join_type(how)?;
        let left_schema = self.df_schema();
        let right_schema = other.df_schema();
        let mut left_keys = Vec::with_capacity(columns.len());
        let mut right_keys = Vec::with_capacity(columns.len());
        for name in columns {
            left_keys.push(resolve_column(left_schema, name)?);
            right_keys.push(resolve_column(right_schema, name)?);
        }

        let on: Vec<Expr> = left_keys
            .iter()
            .zip(&right_keys)
            .map(|(l, r)| Expr::Column(l.clone()).eq(Expr::Column(r.clone())))
            .collect();
        let joined = self
            .inner
            .clone()
            .join_on(other.inner.clone(), join_type, on)?;

        let mut projection: Vec<Expr> = left_keys
            .iter()
            .zip(&right_keys)
            .map(|(left, right)| match join_type {
                JoinType::Right => Expr::Column(right.clone()),
                JoinType::Full => coalesce(vec![
                    Expr::Column(left.clone()),
                    Expr::Column(right.clone()),
                ])
                .alias(&left.name),
                _ => Expr::Column(left.clone()),
            })
            .collect();
        let is_key = |column: &Column, keys: &[Column]| keys.iter().any(|k| k == column);
        for (qualifier, field) in left_schema.iter() {
            let column = Column::new(qualifier.cloned(), field.name());
            if !is_key(&column, &left_keys) {
                projection.push(Expr::Column(column));
            }
        }
        if !matches!(join_type, JoinType::LeftSemi | JoinType::LeftAnti) {
            for (qualifier, field) in right_schema.iter() {
                let column = Column::new(qualifier.cloned(), field.name());
                if !is_key(&column, &right_keys) {
                    projection.push(Expr::Column(column));
                }
            }
        }
        Ok(self.derive(joined.select(projection)?))
    }

    /// Cartesian product.
    pub fn cross_join(&self, other: &DataFrame) -> Result<DataFrame> {
        let (state, left) = self.inner.clone().into_parts();
        let right = other.inner.logical_plan().clone();
        let plan = LogicalPlanBuilder::from(left).cross_join(right)?.build()?;
        Ok(self.derive(DFDataFrame::new(state, plan)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_join_type() {
        assert_eq!(parse_join_type("inner").unwrap(), JoinType::Inner);
        assert_eq!(parse_join_type("full_outer").unwrap(), JoinType::Full);
        assert_eq!(parse_join_type("LeftOuter").unwrap(), JoinType::Left);
        assert_eq!(parse_join_type("right_outer").unwrap(), JoinType::Right);
        assert_eq!(parse_join_type("left_semi").unwrap(), JoinType::LeftSemi);
        assert_eq!(parse_join_type("anti").unwrap(), JoinType::LeftAnti);
        assert!(parse_join_type("sideways").is_err());
    }
}
