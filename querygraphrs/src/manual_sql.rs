//! Best-effort sync from a hand-edited SELECT back onto the graph.
//!
//! Only the shapes the compiler itself produces are understood: plain or
//! aggregated column selections, AND-ed simple predicates and `GROUP BY ALL`.
//! Anything else is listed in [`ManualSqlSync::unsupported`] and leaves the
//! corresponding part of the graph as it was.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Number, Value};
use sqlparser::ast::{
    self, BinaryOperator, Expr, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr,
    SelectItem, SetExpr, Statement, TableFactor, UnaryOperator,
};
use sqlparser::dialect::DatabricksDialect;
use sqlparser::parser::Parser;

use crate::defaults::table_alias;
use crate::error::{QueryGraphError, Result};
use crate::graph::{Aggregation, FilterCondition, FilterOp, FilterSet, Model, SelectedColumn};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TableSelection {
    pub table_id: String,
    pub columns: Vec<SelectedColumn>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManualSqlSync {
    /// Selections per table, in SELECT order of first appearance.
    pub selections: Vec<TableSelection>,
    /// False when the select list was `*` or held something unsupported.
    pub selections_complete: bool,
    pub filters: Vec<FilterCondition>,
    /// False when some WHERE conjunct could not be mapped.
    pub filters_complete: bool,
    pub group_by_all: bool,
    pub unsupported: Vec<String>,
}

impl ManualSqlSync {
    fn push_selection(&mut self, table_id: &str, column: SelectedColumn) {
        match self.selections.iter_mut().find(|s| s.table_id == table_id) {
            Some(existing) => existing.columns.push(column),
            None => self.selections.push(TableSelection {
                table_id: table_id.to_string(),
                columns: vec![column],
            }),
        }
    }

    /// Merge into a copy of `model`, returning a graph-mode model. Parts that
    /// were not fully understood keep their current state.
    pub fn apply_to(&self, model: &Model) -> Model {
        let mut synced = model.clone();
        if self.selections_complete {
            for table in &mut synced.tables {
                let parsed = self
                    .selections
                    .iter()
                    .find(|s| s.table_id == table.id)
                    .map(|s| s.columns.clone())
                    .unwrap_or_default();
                table.selected_columns.retain(|c| c.hidden);
                table.selected_columns.extend(parsed);
            }
        }
        synced.filters = if self.filters_complete {
            FilterSet::Conditions(self.filters.clone())
        } else {
            match &model.filters {
                FilterSet::Conditions(existing) => FilterSet::Conditions(existing.clone()),
                FilterSet::Manual { .. } => FilterSet::Conditions(Vec::new()),
            }
        };
        synced.group_by_all = self.group_by_all;
        synced
    }
}

/// Parse `sql` against the tables of `model`.
///
/// Fails only when the text is not a single parsable SELECT.
pub fn parse_manual_sql(sql: &str, model: &Model) -> Result<ManualSqlSync> {
    let dialect = DatabricksDialect {};
    let mut statements = Parser::parse_sql(&dialect, sql)
        .map_err(|e| QueryGraphError::Sql(format!("cannot parse manual sql: {e}")))?;
    if statements.len() != 1 {
        return Err(QueryGraphError::Sql(format!(
            "expected one statement, found {}",
            statements.len()
        )));
    }
    let Some(Statement::Query(query)) = statements.pop() else {
        return Err(QueryGraphError::Sql("manual sql is not a query".to_string()));
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(QueryGraphError::Sql(
            "manual sql is not a single SELECT".to_string(),
        ));
    };

    let mut sync = ManualSqlSync {
        selections_complete: true,
        filters_complete: true,
        ..Default::default()
    };
    if query.with.is_some() {
        sync.unsupported.push("WITH clause".to_string());
    }
    if query.order_by.is_some() {
        sync.unsupported.push("ORDER BY".to_string());
    }

    let scope = Scope::build(model, &select.from, &mut sync.unsupported);

    for item in &select.projection {
        let (expr, alias) = match item {
            SelectItem::UnnamedExpr(expr) => (expr, None),
            SelectItem::ExprWithAlias { expr, alias } => (expr, Some(alias.value.clone())),
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => {
                sync.selections_complete = false;
                continue;
            }
        };
        match scope.selection(expr, alias) {
            Ok((table_id, column)) => sync.push_selection(&table_id, column),
            Err(reason) => {
                sync.selections_complete = false;
                sync.unsupported.push(reason);
            }
        }
    }

    if let Some(selection) = &select.selection {
        let mut conjuncts = Vec::new();
        flatten_and(selection, &mut conjuncts);
        for conjunct in conjuncts {
            match scope.filter(conjunct) {
                Ok(condition) => sync.filters.push(condition),
                Err(reason) => {
                    sync.filters_complete = false;
                    sync.unsupported.push(reason);
                }
            }
        }
    }

    match &select.group_by {
        GroupByExpr::All(_) => sync.group_by_all = true,
        GroupByExpr::Expressions(exprs, _) if exprs.is_empty() => {}
        GroupByExpr::Expressions(..) => {
            sync.unsupported.push("explicit GROUP BY expressions".to_string())
        }
    }
    if select.having.is_some() {
        sync.unsupported.push("HAVING".to_string());
    }

    tracing::debug!(
        model_id = %model.id,
        selections = sync.selections.len(),
        filters = sync.filters.len(),
        unsupported = sync.unsupported.len(),
        "parsed manual sql"
    );
    Ok(sync)
}

/// Qualifiers visible in the query, mapped to model table ids.
struct Scope<'m> {
    model: &'m Model,
    qualifiers: HashMap<String, String>,
    /// Table ids in FROM/JOIN order.
    in_from: Vec<String>,
}

impl<'m> Scope<'m> {
    fn build(
        model: &'m Model,
        from: &[ast::TableWithJoins],
        unsupported: &mut Vec<String>,
    ) -> Self {
        let mut scope = Scope {
            model,
            qualifiers: HashMap::new(),
            in_from: Vec::new(),
        };
        let relations = from
            .iter()
            .flat_map(|twj| std::iter::once(&twj.relation).chain(twj.joins.iter().map(|j| &j.relation)));
        for relation in relations {
            match relation {
                TableFactor::Table { name, alias, .. } => {
                    let parts: Vec<&str> = name.0.iter().map(|i| i.value.as_str()).collect();
                    let alias = alias.as_ref().map(|a| a.name.value.clone());
                    match scope.match_table(&parts, alias.as_deref()) {
                        Some(table_id) => {
                            let table_name = parts.last().copied().unwrap_or_default();
                            scope.qualifiers.insert(table_name.to_ascii_lowercase(), table_id.clone());
                            if let Some(alias) = alias {
                                scope.qualifiers.insert(alias.to_ascii_lowercase(), table_id.clone());
                            }
                            scope.in_from.push(table_id);
                        }
                        None => unsupported.push(format!("table {} is not in the model", parts.join("."))),
                    }
                }
                TableFactor::Derived { .. } => unsupported.push("subquery in FROM".to_string()),
                _ => unsupported.push("table expression in FROM".to_string()),
            }
        }
        scope
    }

    /// A compiled alias `tN` wins; otherwise match on the table name (and
    /// schema when the reference is qualified).
    fn match_table(&self, parts: &[&str], alias: Option<&str>) -> Option<String> {
        if let Some(alias) = alias {
            if let Some((idx, _)) = self
                .model
                .tables
                .iter()
                .enumerate()
                .find(|(idx, _)| table_alias(*idx).eq_ignore_ascii_case(alias))
            {
                return Some(self.model.tables[idx].id.clone());
            }
        }
        let (name, schema) = parts.split_last()?;
        let schema = schema.join(".");
        self.model
            .tables
            .iter()
            .filter(|t| t.name.eq_ignore_ascii_case(name))
            .find(|t| {
                schema.is_empty()
                    || t.schema
                        .as_deref()
                        .is_some_and(|s| s.eq_ignore_ascii_case(&schema))
            })
            .map(|t| t.id.clone())
    }

    /// Resolve a column reference to `(table_id, column)`.
    fn column(&self, expr: &Expr) -> std::result::Result<(String, String), String> {
        match expr {
            Expr::CompoundIdentifier(idents) if idents.len() >= 2 => {
                let column = idents[idents.len() - 1].value.clone();
                let qualifier = idents[idents.len() - 2].value.to_ascii_lowercase();
                self.qualifiers
                    .get(&qualifier)
                    .map(|table_id| (table_id.clone(), column.clone()))
                    .ok_or_else(|| format!("unknown table qualifier {qualifier} for column {column}"))
            }
            Expr::Identifier(ident) => self.bare_column(&ident.value),
            Expr::Nested(inner) => self.column(inner),
            other => Err(format!("expression {other} is not a column")),
        }
    }

    fn bare_column(&self, column: &str) -> std::result::Result<(String, String), String> {
        if let [only] = self.in_from.as_slice() {
            return Ok((only.clone(), column.to_string()));
        }
        let owners: Vec<&String> = self
            .in_from
            .iter()
            .filter(|id| self.model.table(id).is_some_and(|t| t.has_column(column)))
            .collect();
        match owners.as_slice() {
            [owner] => Ok(((*owner).clone(), column.to_string())),
            [] => Err(format!("column {column} does not belong to any table")),
            _ => Err(format!("column {column} is ambiguous")),
        }
    }

    fn selection(
        &self,
        expr: &Expr,
        alias: Option<String>,
    ) -> std::result::Result<(String, SelectedColumn), String> {
        let (table_id, selected) = match expr {
            Expr::Function(func) => {
                let name = func.name.to_string();
                if func.over.is_some() {
                    return Err(format!("window function {name}"));
                }
                let agg = Aggregation::from_function_name(&name)
                    .ok_or_else(|| format!("function {name}"))?;
                let arg = single_arg(&func.args).ok_or_else(|| format!("arguments of {name}"))?;
                let (table_id, column) = self.column(arg)?;
                (table_id, SelectedColumn::aggregated(column, agg))
            }
            Expr::Subquery(_) => return Err("subquery in SELECT".to_string()),
            other => {
                let (table_id, column) = self.column(other)?;
                (table_id, SelectedColumn::new(column))
            }
        };
        // Aliases equal to the generated default are not stored.
        let selected = match alias {
            Some(alias) if selected.output_alias().as_deref() != Some(alias.as_str()) => {
                selected.with_alias(alias)
            }
            _ => selected,
        };
        Ok((table_id, selected))
    }

    fn filter(&self, expr: &Expr) -> std::result::Result<FilterCondition, String> {
        let condition = |column: &Expr, op: FilterOp, value: Value| {
            self.column(column)
                .map(|(table_id, column)| FilterCondition::new(table_id, column, op, value))
        };
        match expr {
            Expr::BinaryOp { op: BinaryOperator::Or, .. } => Err("OR predicate".to_string()),
            Expr::BinaryOp { left, op, right } => {
                let op = match op {
                    BinaryOperator::Eq => FilterOp::Eq,
                    BinaryOperator::NotEq => FilterOp::Neq,
                    BinaryOperator::Gt => FilterOp::Gt,
                    BinaryOperator::Lt => FilterOp::Lt,
                    BinaryOperator::GtEq => FilterOp::Gte,
                    BinaryOperator::LtEq => FilterOp::Lte,
                    other => return Err(format!("operator {other}")),
                };
                let value = literal(right).ok_or_else(|| format!("non-literal value in {expr}"))?;
                condition(left.as_ref(), op, value)
            }
            Expr::Like {
                negated: false,
                expr: column,
                pattern,
                ..
            } => {
                let value = literal(pattern).ok_or_else(|| format!("non-literal pattern in {expr}"))?;
                condition(column.as_ref(), FilterOp::Like, value)
            }
            Expr::InList {
                expr: column,
                list,
                negated: false,
            } => {
                let values = list
                    .iter()
                    .map(in_list_literal)
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| format!("non-literal IN list in {expr}"))?;
                condition(column.as_ref(), FilterOp::In, Value::Array(values))
            }
            Expr::IsNull(column) => condition(column.as_ref(), FilterOp::IsNull, Value::Null),
            Expr::IsNotNull(column) => condition(column.as_ref(), FilterOp::IsNotNull, Value::Null),
            Expr::Subquery(_) | Expr::InSubquery { .. } | Expr::Exists { .. } => {
                Err("subquery in WHERE".to_string())
            }
            other => Err(format!("predicate {other}")),
        }
    }
}

fn flatten_and<'e>(expr: &'e Expr, out: &mut Vec<&'e Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            flatten_and(left, out);
            flatten_and(right, out);
        }
        Expr::Nested(inner) if matches!(inner.as_ref(), Expr::BinaryOp { op: BinaryOperator::And, .. }) => {
            flatten_and(inner, out)
        }
        other => out.push(other),
    }
}

fn single_arg(args: &FunctionArguments) -> Option<&Expr> {
    let FunctionArguments::List(list) = args else {
        return None;
    };
    if list.duplicate_treatment.is_some() {
        return None;
    }
    match list.args.as_slice() {
        [FunctionArg::Unnamed(FunctionArgExpr::Expr(expr))] => Some(expr),
        _ => None,
    }
}

fn literal(expr: &Expr) -> Option<Value> {
    match expr {
        Expr::Value(value) => match value {
            ast::Value::Number(n, _) => number(n),
            ast::Value::SingleQuotedString(s) | ast::Value::DoubleQuotedString(s) => {
                Some(Value::String(s.clone()))
            }
            ast::Value::Boolean(b) => Some(Value::Bool(*b)),
            ast::Value::Null => Some(Value::Null),
            _ => None,
        },
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match expr.as_ref() {
            Expr::Value(ast::Value::Number(n, _)) => number(&format!("-{n}")),
            _ => None,
        },
        Expr::Nested(inner) => literal(inner),
        _ => None,
    }
}

/// IN list members are stored pre-formatted, so string literals keep quotes.
fn in_list_literal(expr: &Expr) -> Option<Value> {
    match literal(expr)? {
        Value::String(s) => Some(Value::String(format!("'{}'", s.replace('\'', "''")))),
        other => Some(other),
    }
}

fn number(text: &str) -> Option<Value> {
    if let Ok(int) = text.parse::<i64>() {
        return Some(Value::from(int));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TableNode;

    fn model() -> Model {
        Model::new("m")
            .with_table(
                TableNode::new("a", "orders")
                    .with_schema("main.sales")
                    .with_columns([("id", "bigint"), ("amount", "double")]),
            )
            .with_table(
                TableNode::new("b", "customers").with_columns([("id", "bigint"), ("country", "string")]),
            )
    }

    #[test]
    fn numbers_keep_integer_form() {
        assert_eq!(number("42"), Some(Value::from(42)));
        assert_eq!(number("2.5"), Some(Value::from(2.5)));
        assert_eq!(number("abc"), None);
    }

    #[test]
    fn bare_columns_resolve_through_known_columns() {
        let sync = parse_manual_sql(
            "SELECT country FROM `main`.`sales`.`orders` AS t1 LEFT JOIN `customers` AS t2 ON t1.`id` = t2.`id`",
            &model(),
        )
        .unwrap();
        assert_eq!(sync.selections[0].table_id, "b");
        assert!(sync.unsupported.is_empty());
    }

    #[test]
    fn non_select_statements_are_rejected() {
        assert!(parse_manual_sql("DELETE FROM orders", &model()).is_err());
        assert!(parse_manual_sql("SELECT 1; SELECT 2", &model()).is_err());
        assert!(parse_manual_sql("SELECT FROM WHERE", &model()).is_err());
    }
}
