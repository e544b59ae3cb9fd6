use serde_json::Value;

use crate::graph::{FilterCondition, FilterOp};
use crate::sql_ast::{SqlBinaryOperator, SqlExpr};

use super::AliasMap;

/// WHERE conjuncts for the conditions whose table resolves and whose
/// operator is known. Everything else is dropped, as is an `IN` with no members.
pub(crate) fn build_filters(conditions: &[FilterCondition], aliases: &AliasMap<'_>) -> Vec<SqlExpr> {
    conditions
        .iter()
        .filter_map(|cond| {
            let Some(alias) = aliases.alias(&cond.table_id) else {
                tracing::debug!(table_id = %cond.table_id, column = %cond.column, "dropping filter on unknown table");
                return None;
            };
            let column = SqlExpr::Column {
                table: Some(alias.to_string()),
                name: cond.column.clone(),
            };
            let expr = render_filter_expr(column, cond);
            if expr.is_none() {
                tracing::debug!(
                    table_id = %cond.table_id,
                    column = %cond.column,
                    operator = cond.operator.as_str(),
                    "dropping filter that cannot be rendered"
                );
            }
            expr
        })
        .collect()
}

pub(crate) fn render_filter_expr(column: SqlExpr, cond: &FilterCondition) -> Option<SqlExpr> {
    let op = match cond.operator {
        FilterOp::IsNull | FilterOp::IsNotNull => {
            return Some(SqlExpr::IsNull {
                expr: Box::new(column),
                negated: cond.operator == FilterOp::IsNotNull,
            });
        }
        FilterOp::In => {
            let list = in_list_values(&cond.value);
            if list.is_empty() {
                return None;
            }
            return Some(SqlExpr::InList {
                expr: Box::new(column),
                list,
            });
        }
        FilterOp::Unknown => return None,
        FilterOp::Eq => SqlBinaryOperator::Eq,
        FilterOp::Neq => SqlBinaryOperator::Neq,
        FilterOp::Gt => SqlBinaryOperator::Gt,
        FilterOp::Gte => SqlBinaryOperator::Gte,
        FilterOp::Lt => SqlBinaryOperator::Lt,
        FilterOp::Lte => SqlBinaryOperator::Lte,
        FilterOp::Like => SqlBinaryOperator::Like,
    };
    Some(SqlExpr::BinaryOp {
        op,
        left: Box::new(column),
        right: Box::new(SqlExpr::Literal(cond.value.clone())),
    })
}

/// IN list members are emitted as given; callers pre-format string literals.
fn in_list_values(value: &Value) -> Vec<SqlExpr> {
    match value {
        Value::Array(items) => items.iter().map(raw_value).collect(),
        other => vec![raw_value(other)],
    }
}

fn raw_value(value: &Value) -> SqlExpr {
    match value {
        Value::String(s) => SqlExpr::Raw(s.clone()),
        Value::Null => SqlExpr::Raw("NULL".to_string()),
        other => SqlExpr::Raw(other.to_string()),
    }
}
