use serde_json::Value;

use crate::dialect::Dialect;
use crate::graph::Aggregation;

#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    /// `alias.quoted(name)`; compiled table aliases are never quoted.
    Column {
        table: Option<String>,
        name: String,
    },
    Literal(Value),
    /// Pre-formatted SQL text emitted as is.
    Raw(String),
    /// `*`, as in `COUNT(*)`.
    Wildcard,
    Aggregate {
        agg: Aggregation,
        expr: Box<SqlExpr>,
    },
    CountDistinct(Vec<SqlExpr>),
    BinaryOp {
        op: SqlBinaryOperator,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    InList {
        expr: Box<SqlExpr>,
        list: Vec<SqlExpr>,
    },
    IsNull {
        expr: Box<SqlExpr>,
        negated: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlBinaryOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
}

impl SqlBinaryOperator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SqlBinaryOperator::Eq => "=",
            SqlBinaryOperator::Neq => "!=",
            SqlBinaryOperator::Gt => ">",
            SqlBinaryOperator::Gte => ">=",
            SqlBinaryOperator::Lt => "<",
            SqlBinaryOperator::Lte => "<=",
            SqlBinaryOperator::Like => "LIKE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: SqlExpr,
    pub alias: Option<String>,
}

/// A table reference whose name is already qualified and quoted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableRef {
    pub qualified: String,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlJoinType {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub join_type: SqlJoinType,
    pub table: TableRef,
    pub on: Vec<SqlExpr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupBy {
    #[default]
    None,
    All,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    /// Empty means `SELECT *`.
    pub select: Vec<SelectItem>,
    pub from: TableRef,
    pub joins: Vec<Join>,
    pub filters: Vec<SqlExpr>,
    pub group_by: GroupBy,
}

pub struct SqlRenderer<'d> {
    dialect: &'d dyn Dialect,
}

impl<'d> SqlRenderer<'d> {
    pub fn new(dialect: &'d dyn Dialect) -> Self {
        Self { dialect }
    }

    pub fn render_select(&self, query: &SelectQuery) -> String {
        let select_list = if query.select.is_empty() {
            "*".to_string()
        } else {
            let items: Vec<String> = query
                .select
                .iter()
                .map(|item| {
                    let expr_sql = self.render_expr(&item.expr);
                    match &item.alias {
                        Some(alias) => format!("{expr_sql} AS {}", self.dialect.quote_ident(alias)),
                        None => expr_sql,
                    }
                })
                .collect();
            items.join(", ")
        };

        let mut sql = format!(
            "SELECT {select_list} FROM {}",
            self.render_table_ref(&query.from)
        );

        for join in &query.joins {
            let join_kw = match join.join_type {
                SqlJoinType::Inner => "INNER JOIN",
                SqlJoinType::Left => "LEFT JOIN",
                SqlJoinType::Right => "RIGHT JOIN",
                SqlJoinType::Full => "FULL JOIN",
                SqlJoinType::Cross => "CROSS JOIN",
            };
            sql.push_str(&format!(" {join_kw} {}", self.render_table_ref(&join.table)));
            if join.join_type != SqlJoinType::Cross && !join.on.is_empty() {
                let on_clause: Vec<String> = join.on.iter().map(|e| self.render_expr(e)).collect();
                sql.push_str(&format!(" ON {}", on_clause.join(" AND ")));
            }
        }

        if !query.filters.is_empty() {
            let filters: Vec<String> = query.filters.iter().map(|f| self.render_expr(f)).collect();
            sql.push_str(&format!(" WHERE {}", filters.join(" AND ")));
        }

        if query.group_by == GroupBy::All {
            sql.push_str(" GROUP BY ALL");
        }

        sql
    }

    pub fn render_union_all(&self, queries: &[SelectQuery]) -> String {
        let parts: Vec<String> = queries.iter().map(|q| self.render_select(q)).collect();
        parts.join(" UNION ALL ")
    }

    fn render_table_ref(&self, table: &TableRef) -> String {
        match &table.alias {
            Some(alias) => format!("{} AS {alias}", table.qualified),
            None => table.qualified.clone(),
        }
    }

    pub fn render_expr(&self, expr: &SqlExpr) -> String {
        match expr {
            SqlExpr::Column { table, name } => match table {
                Some(t) => format!("{t}.{}", self.dialect.quote_ident(name)),
                None => self.dialect.quote_ident(name),
            },
            SqlExpr::Literal(v) => self.dialect.render_literal(v),
            SqlExpr::Raw(sql) => sql.clone(),
            SqlExpr::Wildcard => "*".to_string(),
            SqlExpr::Aggregate { agg, expr } => self
                .dialect
                .render_aggregation(*agg, &self.render_expr(expr)),
            SqlExpr::CountDistinct(exprs) => {
                let rendered: Vec<String> = exprs.iter().map(|e| self.render_expr(e)).collect();
                self.dialect.render_count_distinct(&rendered)
            }
            SqlExpr::BinaryOp { op, left, right } => format!(
                "{} {} {}",
                self.render_expr(left),
                op.as_sql(),
                self.render_expr(right)
            ),
            SqlExpr::InList { expr, list } => {
                let rendered: Vec<String> = list.iter().map(|v| self.render_expr(v)).collect();
                format!("{} IN ({})", self.render_expr(expr), rendered.join(", "))
            }
            SqlExpr::IsNull { expr, negated } => {
                let not_kw = if *negated { "NOT " } else { "" };
                format!("{} IS {not_kw}NULL", self.render_expr(expr))
            }
        }
    }
}
