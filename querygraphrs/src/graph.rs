//! In-memory query graph: tables, join edges, selections and filters.
//!
//! These types never carry storage encodings. Composite keys are decoded in
//! [`crate::storage`] before a [`Model`] is built.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::defaults::{default_key_column, DEFAULT_CARDINALITY, DEFAULT_JOIN_TYPE};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    #[serde(default)]
    pub data_type: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Aggregation {
    #[default]
    None,
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl Aggregation {
    pub fn is_none(&self) -> bool {
        matches!(self, Aggregation::None)
    }

    /// SQL function name, `None` for plain columns.
    pub fn function_name(&self) -> Option<&'static str> {
        match self {
            Aggregation::None => None,
            Aggregation::Sum => Some("SUM"),
            Aggregation::Avg => Some("AVG"),
            Aggregation::Min => Some("MIN"),
            Aggregation::Max => Some("MAX"),
            Aggregation::Count => Some("COUNT"),
        }
    }

    pub fn from_function_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "SUM" => Some(Aggregation::Sum),
            "AVG" => Some(Aggregation::Avg),
            "MIN" => Some(Aggregation::Min),
            "MAX" => Some(Aggregation::Max),
            "COUNT" => Some(Aggregation::Count),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SelectedColumn {
    pub column: String,
    #[serde(default)]
    pub aggregation: Aggregation,
    #[serde(default)]
    pub alias: Option<String>,
    /// Kept on the canvas but excluded from the compiled SELECT.
    #[serde(default)]
    pub hidden: bool,
}

impl SelectedColumn {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            aggregation: Aggregation::None,
            alias: None,
            hidden: false,
        }
    }

    pub fn aggregated(column: impl Into<String>, aggregation: Aggregation) -> Self {
        Self {
            aggregation,
            ..Self::new(column)
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Output alias: the explicit one, else `{agg}_{column}` for aggregates.
    pub fn output_alias(&self) -> Option<String> {
        if let Some(alias) = self.alias.as_ref().filter(|a| !a.is_empty()) {
            return Some(alias.clone());
        }
        self.aggregation
            .function_name()
            .map(|func| format!("{}_{}", func.to_ascii_lowercase(), self.column))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TableNode {
    pub id: String,
    /// Physical table name. Empty while a canvas node is still being set up.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub schema: Option<String>,
    /// Display label on the canvas; compiled SQL always uses `t{n}` aliases.
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default)]
    pub selected_columns: Vec<SelectedColumn>,
}

impl TableNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            schema: None,
            alias: None,
            columns: Vec::new(),
            selected_columns: Vec::new(),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        self.columns = columns
            .into_iter()
            .map(|(name, data_type)| Column {
                name: name.into(),
                data_type: data_type.into(),
            })
            .collect();
        self
    }

    pub fn select(mut self, column: SelectedColumn) -> Self {
        self.selected_columns.push(column);
        self
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum JoinType {
    Left,
    Right,
    Inner,
    Full,
}

impl Default for JoinType {
    fn default() -> Self {
        DEFAULT_JOIN_TYPE
    }
}

/// Join cardinality, read from the `from` table towards the `to` table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl Default for Cardinality {
    fn default() -> Self {
        DEFAULT_CARDINALITY
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    #[serde(default = "default_key_column")]
    pub from_column: String,
    #[serde(default = "default_key_column")]
    pub to_column: String,
}

impl KeyPair {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from_column: non_empty_or_default(from.into()),
            to_column: non_empty_or_default(to.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JoinKey {
    Simple { from: String, to: String },
    Composite { pairs: Vec<KeyPair> },
}

impl JoinKey {
    /// Single-column key; empty column names fall back to `id`.
    pub fn simple(from: impl Into<String>, to: impl Into<String>) -> Self {
        JoinKey::Simple {
            from: non_empty_or_default(from.into()),
            to: non_empty_or_default(to.into()),
        }
    }

    pub fn composite(pairs: Vec<KeyPair>) -> Self {
        JoinKey::Composite { pairs }
    }

    /// Ordered column pairs the key equates.
    pub fn pairs(&self) -> Vec<KeyPair> {
        match self {
            JoinKey::Simple { from, to } => vec![KeyPair::new(from.clone(), to.clone())],
            JoinKey::Composite { pairs } if pairs.is_empty() => {
                vec![KeyPair::new(default_key_column(), default_key_column())]
            }
            JoinKey::Composite { pairs } => pairs.clone(),
        }
    }
}

impl Default for JoinKey {
    fn default() -> Self {
        JoinKey::simple(default_key_column(), default_key_column())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JoinEdge {
    pub id: String,
    pub from_table_id: String,
    pub to_table_id: String,
    #[serde(default)]
    pub join_type: JoinType,
    #[serde(default)]
    pub cardinality: Cardinality,
    #[serde(default)]
    pub key: JoinKey,
}

impl JoinEdge {
    pub fn new(
        id: impl Into<String>,
        from_table_id: impl Into<String>,
        to_table_id: impl Into<String>,
        key: JoinKey,
    ) -> Self {
        Self {
            id: id.into(),
            from_table_id: from_table_id.into(),
            to_table_id: to_table_id.into(),
            join_type: JoinType::default(),
            cardinality: Cardinality::default(),
            key,
        }
    }

    pub fn with_join_type(mut self, join_type: JoinType) -> Self {
        self.join_type = join_type;
        self
    }

    pub fn touches(&self, table_id: &str) -> bool {
        self.from_table_id == table_id || self.to_table_id == table_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    Like,
    In,
    IsNull,
    IsNotNull,
    /// Operator name the compiler does not know; such filters are dropped.
    Unknown,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "EQ",
            FilterOp::Neq => "NEQ",
            FilterOp::Gt => "GT",
            FilterOp::Lt => "LT",
            FilterOp::Gte => "GTE",
            FilterOp::Lte => "LTE",
            FilterOp::Like => "LIKE",
            FilterOp::In => "IN",
            FilterOp::IsNull => "IS_NULL",
            FilterOp::IsNotNull => "IS_NOT_NULL",
            FilterOp::Unknown => "UNKNOWN",
        }
    }

    pub fn takes_value(&self) -> bool {
        !matches!(self, FilterOp::IsNull | FilterOp::IsNotNull)
    }
}

impl From<String> for FilterOp {
    fn from(value: String) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "EQ" => FilterOp::Eq,
            "NEQ" => FilterOp::Neq,
            "GT" => FilterOp::Gt,
            "LT" => FilterOp::Lt,
            "GTE" => FilterOp::Gte,
            "LTE" => FilterOp::Lte,
            "LIKE" => FilterOp::Like,
            "IN" => FilterOp::In,
            "IS_NULL" => FilterOp::IsNull,
            "IS_NOT_NULL" => FilterOp::IsNotNull,
            _ => FilterOp::Unknown,
        }
    }
}

impl From<FilterOp> for String {
    fn from(op: FilterOp) -> Self {
        op.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilterCondition {
    pub table_id: String,
    pub column: String,
    pub operator: FilterOp,
    #[serde(default)]
    pub value: Value,
}

impl FilterCondition {
    pub fn new(
        table_id: impl Into<String>,
        column: impl Into<String>,
        operator: FilterOp,
        value: Value,
    ) -> Self {
        Self {
            table_id: table_id.into(),
            column: column.into(),
            operator,
            value,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FilterSet {
    Conditions(Vec<FilterCondition>),
    /// Hand-edited SQL that replaces generation entirely.
    Manual { sql: String },
}

impl Default for FilterSet {
    fn default() -> Self {
        FilterSet::Conditions(Vec::new())
    }
}

impl FilterSet {
    pub fn conditions(&self) -> &[FilterCondition] {
        match self {
            FilterSet::Conditions(conditions) => conditions,
            FilterSet::Manual { .. } => &[],
        }
    }

    pub fn manual_sql(&self) -> Option<&str> {
        match self {
            FilterSet::Manual { sql } => Some(sql.as_str()),
            FilterSet::Conditions(_) => None,
        }
    }
}

/// Problems found in a graph that compilation works around.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphWarning {
    #[error("edge {edge_id} has an unreadable composite key ({error}); joined on id = id")]
    UndecodableCompositeKey { edge_id: String, error: String },
    #[error("edge {edge_id} references missing table {table_id}; skipped")]
    DanglingEdge { edge_id: String, table_id: String },
    #[error("edge {edge_id} connects two already joined tables; skipped")]
    RedundantEdge { edge_id: String },
    #[error("table {table_id} is not reachable from the base table; cross joined")]
    CrossJoinedTable { table_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: String,
    /// Ordered; the first table anchors the compiled query.
    #[serde(default)]
    pub tables: Vec<TableNode>,
    #[serde(default)]
    pub edges: Vec<JoinEdge>,
    #[serde(default)]
    pub filters: FilterSet,
    #[serde(default)]
    pub group_by_all: bool,
    #[serde(default)]
    pub connection_id: Option<String>,
    /// Decode problems found while loading the stored form.
    #[serde(default)]
    pub warnings: Vec<GraphWarning>,
}

impl Model {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_table(mut self, table: TableNode) -> Self {
        self.tables.push(table);
        self
    }

    pub fn with_edge(mut self, edge: JoinEdge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_filter(mut self, condition: FilterCondition) -> Self {
        match &mut self.filters {
            FilterSet::Conditions(conditions) => conditions.push(condition),
            FilterSet::Manual { .. } => {
                self.filters = FilterSet::Conditions(vec![condition]);
            }
        }
        self
    }

    pub fn with_manual_sql(mut self, sql: impl Into<String>) -> Self {
        self.filters = FilterSet::Manual { sql: sql.into() };
        self
    }

    pub fn group_by_all(mut self, enabled: bool) -> Self {
        self.group_by_all = enabled;
        self
    }

    pub fn table(&self, id: &str) -> Option<&TableNode> {
        self.tables.iter().find(|t| t.id == id)
    }

    pub fn table_mut(&mut self, id: &str) -> Option<&mut TableNode> {
        self.tables.iter_mut().find(|t| t.id == id)
    }

    pub fn edge(&self, id: &str) -> Option<&JoinEdge> {
        self.edges.iter().find(|e| e.id == id)
    }

    /// Remove a table together with every edge and filter that references it.
    pub fn remove_table(&mut self, id: &str) -> Option<TableNode> {
        let idx = self.tables.iter().position(|t| t.id == id)?;
        let removed = self.tables.remove(idx);
        let before = self.edges.len();
        self.edges.retain(|e| !e.touches(id));
        if let FilterSet::Conditions(conditions) = &mut self.filters {
            conditions.retain(|c| c.table_id != id);
        }
        tracing::debug!(
            table_id = id,
            edges_removed = before - self.edges.len(),
            "removed table from model"
        );
        Some(removed)
    }

    pub fn is_manual(&self) -> bool {
        matches!(self.filters, FilterSet::Manual { .. })
    }
}

fn non_empty_or_default(value: String) -> String {
    if value.trim().is_empty() {
        default_key_column()
    } else {
        value
    }
}
