//! Persistence encoding of models.
//!
//! The stored form keeps join keys in two plain string columns. A composite
//! key is written as `__JSON__:` followed by the JSON pair list in
//! `fromColumn`, with `toColumn` set to [`COMPOSITE_TO_COLUMN`]. This module
//! is the only place that knows about the sentinel; everything past it sees
//! [`JoinKey`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::defaults::DEFAULT_KEY_COLUMN;
use crate::graph::{
    Cardinality, FilterCondition, FilterSet, GraphWarning, JoinEdge, JoinKey, JoinType, KeyPair,
    Model, TableNode,
};

/// Prefix marking a JSON-encoded composite key inside `fromColumn`.
pub const COMPOSITE_KEY_PREFIX: &str = "__JSON__:";

/// Value written to `toColumn` for composite keys. Ignored on read.
pub const COMPOSITE_TO_COLUMN: &str = "__COMPOSITE__";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyDecodeError {
    #[error("invalid composite key json: {0}")]
    InvalidJson(String),
    #[error("composite key has no column pairs")]
    Empty,
}

/// Edge as persisted by the model store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredEdge {
    pub id: String,
    pub from_table_id: String,
    pub to_table_id: String,
    #[serde(default)]
    pub from_column: Option<String>,
    #[serde(default)]
    pub to_column: Option<String>,
    #[serde(default)]
    pub join_type: JoinType,
    #[serde(default)]
    pub cardinality: Cardinality,
}

/// Filters as persisted: a plain list or a manual override record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StoredFilters {
    List(Vec<FilterCondition>),
    #[serde(rename_all = "camelCase")]
    Override {
        is_manual: bool,
        #[serde(default)]
        manual_sql: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredModel {
    pub id: String,
    #[serde(default)]
    pub tables: Vec<TableNode>,
    #[serde(default)]
    pub relationships: Vec<StoredEdge>,
    #[serde(default)]
    pub filters: Option<StoredFilters>,
    #[serde(default)]
    pub is_group_by_all: bool,
    #[serde(default)]
    pub connection_id: Option<String>,
}

/// Encode a key into its `(fromColumn, toColumn)` storage pair.
pub fn encode_join_key(key: &JoinKey) -> serde_json::Result<(String, String)> {
    match key {
        JoinKey::Simple { from, to } => Ok((from.clone(), to.clone())),
        JoinKey::Composite { pairs } => {
            let json = serde_json::to_string(pairs)?;
            Ok((
                format!("{COMPOSITE_KEY_PREFIX}{json}"),
                COMPOSITE_TO_COLUMN.to_string(),
            ))
        }
    }
}

/// Decode a stored `(fromColumn, toColumn)` pair.
///
/// Missing or blank simple columns default to `id`.
pub fn decode_join_key(
    from_column: Option<&str>,
    to_column: Option<&str>,
) -> Result<JoinKey, KeyDecodeError> {
    let from = from_column.unwrap_or_default();
    match from.strip_prefix(COMPOSITE_KEY_PREFIX) {
        Some(json) => {
            let pairs: Vec<KeyPair> = serde_json::from_str(json)
                .map_err(|e| KeyDecodeError::InvalidJson(e.to_string()))?;
            if pairs.is_empty() {
                return Err(KeyDecodeError::Empty);
            }
            Ok(JoinKey::Composite {
                pairs: pairs
                    .into_iter()
                    .map(|p| KeyPair::new(p.from_column, p.to_column))
                    .collect(),
            })
        }
        None => Ok(JoinKey::simple(from, to_column.unwrap_or_default())),
    }
}

impl StoredEdge {
    /// Decode into a graph edge. An unreadable composite key becomes an
    /// `id = id` join and is reported.
    pub fn decode(&self) -> (JoinEdge, Option<GraphWarning>) {
        let (key, warning) =
            match decode_join_key(self.from_column.as_deref(), self.to_column.as_deref()) {
                Ok(key) => (key, None),
                Err(err) => {
                    tracing::warn!(
                        edge_id = %self.id,
                        error = %err,
                        fallback = DEFAULT_KEY_COLUMN,
                        "unreadable composite key, joining on default key column"
                    );
                    (
                        JoinKey::default(),
                        Some(GraphWarning::UndecodableCompositeKey {
                            edge_id: self.id.clone(),
                            error: err.to_string(),
                        }),
                    )
                }
            };
        let edge = JoinEdge {
            id: self.id.clone(),
            from_table_id: self.from_table_id.clone(),
            to_table_id: self.to_table_id.clone(),
            join_type: self.join_type,
            cardinality: self.cardinality,
            key,
        };
        (edge, warning)
    }

    pub fn encode(edge: &JoinEdge) -> serde_json::Result<Self> {
        let (from_column, to_column) = encode_join_key(&edge.key)?;
        Ok(Self {
            id: edge.id.clone(),
            from_table_id: edge.from_table_id.clone(),
            to_table_id: edge.to_table_id.clone(),
            from_column: Some(from_column),
            to_column: Some(to_column),
            join_type: edge.join_type,
            cardinality: edge.cardinality,
        })
    }
}

/// Decode a list of stored edges, collecting warnings.
pub fn decode_edges(edges: &[StoredEdge]) -> (Vec<JoinEdge>, Vec<GraphWarning>) {
    let mut decoded = Vec::with_capacity(edges.len());
    let mut warnings = Vec::new();
    for stored in edges {
        let (edge, warning) = stored.decode();
        decoded.push(edge);
        warnings.extend(warning);
    }
    (decoded, warnings)
}

impl From<StoredFilters> for FilterSet {
    fn from(stored: StoredFilters) -> Self {
        match stored {
            StoredFilters::List(conditions) => FilterSet::Conditions(conditions),
            StoredFilters::Override {
                is_manual: true,
                manual_sql,
            } => FilterSet::Manual { sql: manual_sql },
            StoredFilters::Override { .. } => FilterSet::Conditions(Vec::new()),
        }
    }
}

impl From<&FilterSet> for StoredFilters {
    fn from(filters: &FilterSet) -> Self {
        match filters {
            FilterSet::Conditions(conditions) => StoredFilters::List(conditions.clone()),
            FilterSet::Manual { sql } => StoredFilters::Override {
                is_manual: true,
                manual_sql: sql.clone(),
            },
        }
    }
}

impl StoredModel {
    pub fn into_model(self) -> Model {
        let (edges, warnings) = decode_edges(&self.relationships);
        Model {
            id: self.id,
            tables: self.tables,
            edges,
            filters: self.filters.map(FilterSet::from).unwrap_or_default(),
            group_by_all: self.is_group_by_all,
            connection_id: self.connection_id,
            warnings,
        }
    }

    pub fn from_model(model: &Model) -> serde_json::Result<Self> {
        let relationships = model
            .edges
            .iter()
            .map(StoredEdge::encode)
            .collect::<serde_json::Result<Vec<_>>>()?;
        Ok(Self {
            id: model.id.clone(),
            tables: model.tables.clone(),
            relationships,
            filters: Some(StoredFilters::from(&model.filters)),
            is_group_by_all: model.group_by_all,
            connection_id: model.connection_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_key_uses_sentinel_encoding() {
        let key = JoinKey::composite(vec![
            KeyPair::new("order_id", "order_id"),
            KeyPair::new("line_no", "line"),
        ]);
        let (from, to) = encode_join_key(&key).unwrap();
        assert_eq!(
            from,
            r#"__JSON__:[{"fromColumn":"order_id","toColumn":"order_id"},{"fromColumn":"line_no","toColumn":"line"}]"#
        );
        assert_eq!(to, COMPOSITE_TO_COLUMN);
        assert_eq!(decode_join_key(Some(&from), Some("ignored")).unwrap(), key);
    }

    #[test]
    fn simple_key_defaults_missing_columns() {
        assert_eq!(
            decode_join_key(None, Some("a_id")).unwrap(),
            JoinKey::simple("id", "a_id")
        );
        assert_eq!(decode_join_key(None, None).unwrap(), JoinKey::default());
    }

    #[test]
    fn broken_composite_key_falls_back_with_warning() {
        let stored = StoredEdge {
            id: "e1".to_string(),
            from_table_id: "a".to_string(),
            to_table_id: "b".to_string(),
            from_column: Some("__JSON__:[{not json".to_string()),
            to_column: Some(COMPOSITE_TO_COLUMN.to_string()),
            join_type: JoinType::Inner,
            cardinality: Cardinality::OneToOne,
        };
        let (edge, warning) = stored.decode();
        assert_eq!(edge.key, JoinKey::simple("id", "id"));
        assert_eq!(edge.join_type, JoinType::Inner);
        assert!(matches!(
            warning,
            Some(GraphWarning::UndecodableCompositeKey { ref edge_id, .. }) if edge_id == "e1"
        ));

        assert_eq!(
            decode_join_key(Some("__JSON__:[]"), None),
            Err(KeyDecodeError::Empty)
        );
    }

    #[test]
    fn filters_accept_list_or_manual_record() {
        let list: StoredFilters = serde_json::from_str(
            r#"[{"tableId": "a", "column": "x", "operator": "EQ", "value": 1}]"#,
        )
        .unwrap();
        assert_eq!(FilterSet::from(list).conditions().len(), 1);

        let manual: StoredFilters =
            serde_json::from_str(r#"{"isManual": true, "manualSql": "SELECT 1"}"#).unwrap();
        assert_eq!(FilterSet::from(manual).manual_sql(), Some("SELECT 1"));

        let disabled: StoredFilters =
            serde_json::from_str(r#"{"isManual": false, "manualSql": "SELECT 1"}"#).unwrap();
        assert_eq!(FilterSet::from(disabled), FilterSet::Conditions(Vec::new()));
    }

    #[test]
    fn stored_model_round_trips_through_graph() {
        let json = r#"{
            "id": "m1",
            "tables": [
                {"id": "a", "name": "orders", "schema": "main.sales"},
                {"id": "b", "name": "customers"}
            ],
            "relationships": [
                {"id": "e1", "fromTableId": "a", "toTableId": "b",
                 "fromColumn": "customer_id", "toColumn": "id", "joinType": "INNER"}
            ],
            "isGroupByAll": true,
            "connectionId": "wh"
        }"#;
        let stored: StoredModel = serde_json::from_str(json).unwrap();
        let model = stored.clone().into_model();
        assert!(model.group_by_all);
        assert_eq!(model.edges[0].key, JoinKey::simple("customer_id", "id"));
        assert!(model.warnings.is_empty());

        let back = StoredModel::from_model(&model).unwrap();
        assert_eq!(back.relationships, stored.relationships);
    }
}
