//! SQL dialect abstractions: identifier quoting, table qualification and
//! literal rendering.
//!
//! Every identifier that reaches generated SQL goes through
//! [`Dialect::quote_ident`]. The free functions [`escape`] and [`qualify`]
//! use the warehouse dialect.

use serde_json::Value;

use crate::graph::{Aggregation, TableNode};

mod databricks;
pub use databricks::DatabricksDialect;

/// Placeholder emitted for a table node that has no physical name yet.
pub const UNNAMED_TABLE: &str = "__unnamed_table__";

/// Dialects render identifiers and primitive expression pieces.
/// Expression tree walking lives in the query builder; the dialect
/// only maps logical constructs to SQL fragments.
pub trait Dialect: Send + Sync {
    fn quote_ident(&self, ident: &str) -> String;

    /// `quote(s1).quote(s2)...quote(table)`; empty schema segments are skipped.
    fn qualify_table(&self, schema: Option<&str>, table: &str) -> String {
        if table.trim().is_empty() {
            return UNNAMED_TABLE.to_string();
        }
        let mut parts: Vec<String> = schema
            .into_iter()
            .flat_map(|s| s.split('.'))
            .filter(|part| !part.trim().is_empty())
            .map(|part| self.quote_ident(part))
            .collect();
        parts.push(self.quote_ident(table));
        parts.join(".")
    }

    fn render_aggregation(&self, agg: Aggregation, expr: &str) -> String {
        match agg.function_name() {
            Some(func) => format!("{func}({expr})"),
            None => expr.to_string(),
        }
    }

    fn render_count_distinct(&self, exprs: &[String]) -> String {
        format!("COUNT(DISTINCT {})", exprs.join(", "))
    }

    fn render_string(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    fn render_literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => self.render_string(s),
            Value::Array(items) => {
                let rendered: Vec<String> = items.iter().map(|v| self.render_literal(v)).collect();
                rendered.join(", ")
            }
            Value::Object(_) => self.render_string(&value.to_string()),
        }
    }
}

/// Quote an identifier for the warehouse.
pub fn escape(name: &str) -> String {
    DatabricksDialect.quote_ident(name)
}

/// Fully qualified, quoted reference to a table node.
pub fn qualify(table: &TableNode) -> String {
    DatabricksDialect.qualify_table(table.schema.as_deref(), &table.name)
}
