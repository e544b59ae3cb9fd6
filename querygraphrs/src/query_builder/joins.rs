//! Join resolution: turns the edge set into an ordered JOIN sequence rooted
//! at the first table.
//!
//! Resolution never fails. Edges with missing endpoints are skipped, edges
//! that would close a cycle are dropped, and tables the base cannot reach
//! are cross joined, so a half-built canvas still compiles.

use std::collections::{BTreeSet, HashMap};

use crate::defaults::table_alias;
use crate::dialect::qualify;
use crate::graph::{GraphWarning, JoinEdge, JoinType, TableNode};
use crate::sql_ast::{Join, SqlBinaryOperator, SqlExpr, SqlJoinType, TableRef};

impl From<JoinType> for SqlJoinType {
    fn from(jt: JoinType) -> Self {
        match jt {
            JoinType::Inner => SqlJoinType::Inner,
            JoinType::Left => SqlJoinType::Left,
            JoinType::Right => SqlJoinType::Right,
            JoinType::Full => SqlJoinType::Full,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTable {
    pub table_id: String,
    pub qualified: String,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinFragment {
    /// `None` for cross joins.
    pub edge_id: Option<String>,
    pub join_type: SqlJoinType,
    pub table: PlannedTable,
    pub on: Vec<SqlExpr>,
}

impl JoinFragment {
    pub fn to_sql_join(&self) -> Join {
        Join {
            join_type: self.join_type,
            table: TableRef {
                qualified: self.table.qualified.clone(),
                alias: Some(self.table.alias.clone()),
            },
            on: self.on.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinPlan {
    pub base: Option<PlannedTable>,
    pub joins: Vec<JoinFragment>,
    /// Tables the base cannot reach, cross joined in model order.
    pub unjoined: Vec<String>,
    pub warnings: Vec<GraphWarning>,
}

impl JoinPlan {
    /// Ids of the base table and every table joined through an edge.
    pub fn joined_ids(&self) -> Vec<&str> {
        self.base
            .iter()
            .map(|b| b.table_id.as_str())
            .chain(
                self.joins
                    .iter()
                    .filter(|j| j.edge_id.is_some())
                    .map(|j| j.table.table_id.as_str()),
            )
            .collect()
    }
}

/// Immutable snapshot of one resolution pass.
#[derive(Debug, Clone, Default)]
struct ResolveState<'a> {
    joined: BTreeSet<&'a str>,
    remaining: Vec<&'a JoinEdge>,
    emitted: Vec<(&'a JoinEdge, &'a str)>,
    redundant: Vec<&'a str>,
}

impl<'a> ResolveState<'a> {
    fn step(mut self, edge: &'a JoinEdge) -> Self {
        let from_joined = self.joined.contains(edge.from_table_id.as_str());
        let to_joined = self.joined.contains(edge.to_table_id.as_str());
        match (from_joined, to_joined) {
            (true, true) => self.redundant.push(edge.id.as_str()),
            (true, false) => {
                self.joined.insert(edge.to_table_id.as_str());
                self.emitted.push((edge, edge.to_table_id.as_str()));
            }
            (false, true) => {
                self.joined.insert(edge.from_table_id.as_str());
                self.emitted.push((edge, edge.from_table_id.as_str()));
            }
            (false, false) => self.remaining.push(edge),
        }
        self
    }

    /// One pass over the remaining edges; returns the next state.
    fn pass(self) -> Self {
        let ResolveState {
            joined,
            remaining,
            emitted,
            redundant,
        } = self;
        let start = ResolveState {
            joined,
            remaining: Vec::with_capacity(remaining.len()),
            emitted,
            redundant,
        };
        remaining.into_iter().fold(start, ResolveState::step)
    }
}

/// Resolve joins for `tables` (first table is the base) over `edges`.
pub fn resolve_joins(tables: &[TableNode], edges: &[JoinEdge]) -> JoinPlan {
    let Some(base_table) = tables.first() else {
        return JoinPlan::default();
    };

    let mut aliases: HashMap<&str, (usize, &TableNode)> = HashMap::new();
    for (idx, table) in tables.iter().enumerate() {
        aliases.entry(table.id.as_str()).or_insert((idx, table));
    }
    let planned = |table_id: &str| -> Option<PlannedTable> {
        aliases.get(table_id).map(|(idx, table)| PlannedTable {
            table_id: table.id.clone(),
            qualified: qualify(table),
            alias: table_alias(*idx),
        })
    };

    let mut warnings = Vec::new();
    let mut usable = Vec::with_capacity(edges.len());
    for edge in edges {
        match [&edge.from_table_id, &edge.to_table_id]
            .into_iter()
            .find(|id| !aliases.contains_key(id.as_str()))
        {
            Some(missing) => {
                tracing::debug!(edge_id = %edge.id, table_id = %missing, "skipping dangling edge");
                warnings.push(GraphWarning::DanglingEdge {
                    edge_id: edge.id.clone(),
                    table_id: missing.clone(),
                });
            }
            None => usable.push(edge),
        }
    }

    let mut state = ResolveState {
        joined: BTreeSet::from([base_table.id.as_str()]),
        remaining: usable,
        ..Default::default()
    };
    loop {
        let before = state.remaining.len();
        state = state.pass();
        if state.remaining.len() == before {
            break;
        }
    }

    let mut joins: Vec<JoinFragment> = state
        .emitted
        .iter()
        .filter_map(|&(edge, target_id)| {
            let table = planned(target_id)?;
            let from_alias = planned(&edge.from_table_id)?.alias;
            let to_alias = planned(&edge.to_table_id)?.alias;
            Some(JoinFragment {
                edge_id: Some(edge.id.clone()),
                join_type: edge.join_type.into(),
                table,
                on: on_clause(edge, &from_alias, &to_alias),
            })
        })
        .collect();

    warnings.extend(
        state
            .redundant
            .iter()
            .map(|edge_id| GraphWarning::RedundantEdge {
                edge_id: edge_id.to_string(),
            }),
    );

    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut unjoined = Vec::new();
    for table in tables {
        if state.joined.contains(table.id.as_str()) || !seen.insert(table.id.as_str()) {
            continue;
        }
        if let Some(orphan) = planned(&table.id) {
            warnings.push(GraphWarning::CrossJoinedTable {
                table_id: table.id.clone(),
            });
            unjoined.push(table.id.clone());
            joins.push(JoinFragment {
                edge_id: None,
                join_type: SqlJoinType::Cross,
                table: orphan,
                on: Vec::new(),
            });
        }
    }

    tracing::debug!(
        tables = tables.len(),
        edges = edges.len(),
        joined = state.emitted.len(),
        cross_joined = unjoined.len(),
        "resolved joins"
    );

    JoinPlan {
        base: planned(&base_table.id),
        joins,
        unjoined,
        warnings,
    }
}

fn on_clause(edge: &JoinEdge, from_alias: &str, to_alias: &str) -> Vec<SqlExpr> {
    edge.key
        .pairs()
        .into_iter()
        .map(|pair| SqlExpr::BinaryOp {
            op: SqlBinaryOperator::Eq,
            left: Box::new(SqlExpr::Column {
                table: Some(from_alias.to_string()),
                name: pair.from_column,
            }),
            right: Box::new(SqlExpr::Column {
                table: Some(to_alias.to_string()),
                name: pair.to_column,
            }),
        })
        .collect()
}
