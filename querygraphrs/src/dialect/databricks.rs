//! Databricks SQL dialect implementation.

use super::Dialect;

#[derive(Debug, Default, Clone, Copy)]
pub struct DatabricksDialect;

impl Dialect for DatabricksDialect {
    fn quote_ident(&self, ident: &str) -> String {
        // Databricks quotes with backticks and escapes them by doubling
        format!("`{}`", ident.replace('`', "``"))
    }
}
