use crate::graph::TableNode;
use crate::sql_ast::{SelectItem, SqlExpr};

use super::AliasMap;

/// SELECT items for every visible selection, in table then selection order.
/// An empty result renders as `*`.
pub(crate) fn build_select_list(tables: &[TableNode], aliases: &AliasMap<'_>) -> Vec<SelectItem> {
    tables
        .iter()
        .filter_map(|table| aliases.alias(&table.id).map(|alias| (table, alias)))
        .flat_map(|(table, alias)| {
            table
                .selected_columns
                .iter()
                .filter(|sel| !sel.hidden)
                .map(move |sel| {
                    let column = SqlExpr::Column {
                        table: Some(alias.to_string()),
                        name: sel.column.clone(),
                    };
                    let expr = if sel.aggregation.is_none() {
                        column
                    } else {
                        SqlExpr::Aggregate {
                            agg: sel.aggregation,
                            expr: Box::new(column),
                        }
                    };
                    SelectItem {
                        expr,
                        alias: sel.output_alias(),
                    }
                })
        })
        .collect()
}
