//! Graph to SQL compilation.
//!
//! [`SqlBuilder::compile`] is pure: it never performs I/O and never fails on
//! a malformed graph. Problems it works around are returned as
//! [`GraphWarning`]s on the [`CompiledQuery`].

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::defaults::table_alias;
use crate::dialect::DatabricksDialect;
use crate::graph::{GraphWarning, Model, TableNode};
use crate::sql_ast::{GroupBy, SelectQuery, SqlRenderer, TableRef};

mod filters;
pub mod joins;
mod select;

pub use joins::{resolve_joins, JoinFragment, JoinPlan, PlannedTable};

static TRAILING_LIMIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bLIMIT\s+\d+\s*;?\s*$").expect("trailing LIMIT pattern is valid")
});

/// Table id to compiled alias (`t{n}`); the first table with a given id wins.
pub(crate) struct AliasMap<'a> {
    aliases: HashMap<&'a str, String>,
}

impl<'a> AliasMap<'a> {
    pub(crate) fn new(tables: &'a [TableNode]) -> Self {
        let mut aliases = HashMap::with_capacity(tables.len());
        for (idx, table) in tables.iter().enumerate() {
            aliases
                .entry(table.id.as_str())
                .or_insert_with(|| table_alias(idx));
        }
        Self { aliases }
    }

    pub(crate) fn alias(&self, table_id: &str) -> Option<&str> {
        self.aliases.get(table_id).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledQuery {
    pub sql: String,
    /// Tables the base table could not reach; they are cross joined.
    pub unjoined: Vec<String>,
    pub warnings: Vec<GraphWarning>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SqlBuilder;

impl SqlBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Compile a model to SQL. Returns `None` for a model without tables,
    /// unless a manual override supplies the SQL.
    pub fn compile(&self, model: &Model) -> Option<CompiledQuery> {
        if let Some(sql) = model.filters.manual_sql() {
            tracing::debug!(model_id = %model.id, "using manual sql override");
            return Some(CompiledQuery {
                sql: sql.to_string(),
                unjoined: Vec::new(),
                warnings: model.warnings.clone(),
            });
        }

        let base = model.tables.first()?;
        let plan = resolve_joins(&model.tables, &model.edges);
        let aliases = AliasMap::new(&model.tables);

        let query = SelectQuery {
            select: select::build_select_list(&model.tables, &aliases),
            from: plan
                .base
                .as_ref()
                .map(|b| TableRef {
                    qualified: b.qualified.clone(),
                    alias: Some(b.alias.clone()),
                })
                .unwrap_or_else(|| TableRef {
                    qualified: crate::dialect::qualify(base),
                    alias: Some(table_alias(0)),
                }),
            joins: plan.joins.iter().map(JoinFragment::to_sql_join).collect(),
            filters: filters::build_filters(model.filters.conditions(), &aliases),
            group_by: if model.group_by_all {
                GroupBy::All
            } else {
                GroupBy::None
            },
        };

        let dialect = DatabricksDialect;
        let sql = SqlRenderer::new(&dialect).render_select(&query);

        let mut warnings = model.warnings.clone();
        warnings.extend(plan.warnings);
        if !warnings.is_empty() {
            tracing::warn!(model_id = %model.id, warnings = warnings.len(), "compiled degraded graph");
        }
        tracing::debug!(model_id = %model.id, sql = %sql, "compiled model");

        Some(CompiledQuery {
            sql,
            unjoined: plan.unjoined,
            warnings,
        })
    }

    /// Compile and append `LIMIT n` unless the SQL already ends in a limit.
    pub fn compile_with_limit(&self, model: &Model, row_limit: Option<u64>) -> Option<CompiledQuery> {
        let mut compiled = self.compile(model)?;
        if let Some(limit) = row_limit {
            compiled.sql = apply_row_limit(&compiled.sql, limit);
        }
        Some(compiled)
    }
}

/// Append `LIMIT n` unless `sql` already ends in `LIMIT <number>`. A trailing
/// `--` comment is ignored for the check and pushes the limit onto its own line.
pub fn apply_row_limit(sql: &str, limit: u64) -> String {
    let body = sql.trim_end().trim_end_matches(';').trim_end();
    let last_line = body.lines().last().unwrap_or_default();
    let comment_start = last_line
        .find("--")
        .map(|pos| body.len() - last_line.len() + pos);
    let code = comment_start.map_or(body, |end| &body[..end]);
    if TRAILING_LIMIT.is_match(code) {
        return sql.to_string();
    }
    match comment_start {
        Some(_) => format!("{body}\nLIMIT {limit}"),
        None => format!("{body} LIMIT {limit}"),
    }
}
