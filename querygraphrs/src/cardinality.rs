//! Join cardinality detection from live row counts.
//!
//! For each side of an edge the validator counts rows and distinct join keys.
//! A side is "many" when it has more rows than distinct keys.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::ValidationConfig;
use crate::dialect::{DatabricksDialect, Dialect};
use crate::error::{QueryGraphError, Result};
use crate::graph::{Aggregation, Cardinality, GraphWarning, JoinEdge, KeyPair, Model, TableNode};
use crate::sql_ast::{SelectItem, SelectQuery, SqlExpr, SqlRenderer, TableRef};
use crate::warehouse::{ConnectionRecord, ScopedSession, WarehouseConnector};

const SOURCE_SIDE: &str = "source";
const TARGET_SIDE: &str = "target";

/// A physical table to sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TableLocator {
    pub name: String,
    #[serde(default)]
    pub schema: Option<String>,
}

impl TableLocator {
    pub fn new(name: impl Into<String>, schema: Option<&str>) -> Self {
        Self {
            name: name.into(),
            schema: schema.map(str::to_string),
        }
    }

    fn qualified(&self) -> String {
        DatabricksDialect.qualify_table(self.schema.as_deref(), &self.name)
    }
}

impl From<&TableNode> for TableLocator {
    fn from(table: &TableNode) -> Self {
        Self::new(table.name.clone(), table.schema.as_deref())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SideStats {
    pub total_rows: u64,
    pub distinct_keys: u64,
}

impl SideStats {
    pub fn new(total_rows: u64, distinct_keys: u64) -> Self {
        Self {
            total_rows,
            distinct_keys,
        }
    }

    pub fn is_many(&self) -> bool {
        self.total_rows > self.distinct_keys
    }
}

/// Cardinality implied by the statistics of both sides.
pub fn classify(source: &SideStats, target: &SideStats) -> Cardinality {
    match (source.is_many(), target.is_many()) {
        (true, true) => Cardinality::ManyToMany,
        (true, false) => Cardinality::ManyToOne,
        (false, true) => Cardinality::OneToMany,
        (false, false) => Cardinality::OneToOne,
    }
}

fn side_query(label: &str, table: &TableLocator, columns: Vec<String>) -> SelectQuery {
    SelectQuery {
        select: vec![
            SelectItem {
                expr: SqlExpr::Literal(Value::from(label)),
                alias: Some("side".to_string()),
            },
            SelectItem {
                expr: SqlExpr::Aggregate {
                    agg: Aggregation::Count,
                    expr: Box::new(SqlExpr::Wildcard),
                },
                alias: Some("total_rows".to_string()),
            },
            SelectItem {
                expr: SqlExpr::CountDistinct(
                    columns
                        .into_iter()
                        .map(|name| SqlExpr::Column { table: None, name })
                        .collect(),
                ),
                alias: Some("distinct_keys".to_string()),
            },
        ],
        from: TableRef {
            qualified: table.qualified(),
            alias: None,
        },
        ..Default::default()
    }
}

/// Two-branch statistics query: source side over the `from` columns, target
/// side over the `to` columns.
pub fn build_stats_query(source: &TableLocator, target: &TableLocator, pairs: &[KeyPair]) -> String {
    let from_columns = pairs.iter().map(|p| p.from_column.clone()).collect();
    let to_columns = pairs.iter().map(|p| p.to_column.clone()).collect();
    let dialect = DatabricksDialect;
    SqlRenderer::new(&dialect).render_union_all(&[
        side_query(SOURCE_SIDE, source, from_columns),
        side_query(TARGET_SIDE, target, to_columns),
    ])
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeValidation {
    pub source: SideStats,
    pub target: SideStats,
    pub detected_cardinality: Cardinality,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeReport {
    pub edge_id: String,
    pub from_table_id: String,
    pub to_table_id: String,
    pub source: SideStats,
    pub target: SideStats,
    pub current_cardinality: Cardinality,
    pub detected_cardinality: Cardinality,
}

impl EdgeReport {
    pub fn is_mismatch(&self) -> bool {
        self.current_cardinality != self.detected_cardinality
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelValidation {
    /// Reports whose detected cardinality is MANY_TO_MANY.
    pub issues: Vec<EdgeReport>,
    pub reports: Vec<EdgeReport>,
    /// Edges whose tables are not both in the supplied table list.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<GraphWarning>,
    pub validated: bool,
}

impl ModelValidation {
    /// Nothing to check: validated without touching the warehouse.
    pub fn empty() -> Self {
        Self {
            issues: Vec::new(),
            reports: Vec::new(),
            skipped: Vec::new(),
            warnings: Vec::new(),
            validated: true,
        }
    }
}

impl Model {
    /// Overwrite edge cardinalities with the detected ones. Returns how many
    /// edges changed.
    pub fn apply_cardinalities(&mut self, validation: &ModelValidation) -> usize {
        let mut changed = 0;
        for report in &validation.reports {
            if let Some(edge) = self.edges.iter_mut().find(|e| e.id == report.edge_id) {
                if edge.cardinality != report.detected_cardinality {
                    edge.cardinality = report.detected_cardinality;
                    changed += 1;
                }
            }
        }
        changed
    }
}

pub struct CardinalityValidator<'c> {
    connector: &'c dyn WarehouseConnector,
    settings: ValidationConfig,
}

impl<'c> CardinalityValidator<'c> {
    pub fn new(connector: &'c dyn WarehouseConnector, settings: ValidationConfig) -> Self {
        Self {
            connector,
            settings,
        }
    }

    /// Measure one edge. Empty `pairs` is rejected before any connection is made.
    pub async fn validate_edge(
        &self,
        connection: &ConnectionRecord,
        source: &TableLocator,
        target: &TableLocator,
        pairs: &[KeyPair],
    ) -> Result<EdgeValidation> {
        if pairs.is_empty() {
            return Err(QueryGraphError::Validation(
                "at least one join key pair is required".to_string(),
            ));
        }
        let session = ScopedSession::open(self.connector, connection).await?;
        let outcome = measure(&session, source, target, pairs).await;
        let (source_stats, target_stats) = session.finish(outcome).await?;
        let detected = classify(&source_stats, &target_stats);
        tracing::debug!(
            source = %source.name,
            target = %target.name,
            detected = ?detected,
            "validated edge"
        );
        Ok(EdgeValidation {
            source: source_stats,
            target: target_stats,
            detected_cardinality: detected,
        })
    }

    /// Measure every edge of a model over one session, sequentially.
    pub async fn validate_model(
        &self,
        connection: &ConnectionRecord,
        tables: &[TableNode],
        edges: &[JoinEdge],
        warnings: Vec<GraphWarning>,
    ) -> Result<ModelValidation> {
        if tables.is_empty() || edges.is_empty() {
            return Ok(ModelValidation::empty());
        }

        let mut skipped = Vec::new();
        let mut work = Vec::with_capacity(edges.len());
        for edge in edges {
            let from = tables.iter().find(|t| t.id == edge.from_table_id);
            let to = tables.iter().find(|t| t.id == edge.to_table_id);
            match (from, to) {
                (Some(from), Some(to)) => work.push((edge, from, to)),
                _ => {
                    tracing::debug!(edge_id = %edge.id, "skipping edge with unresolved tables");
                    skipped.push(edge.id.clone());
                }
            }
        }

        if work.is_empty() {
            return Ok(ModelValidation {
                skipped,
                ..ModelValidation::empty()
            });
        }

        let session = ScopedSession::open(self.connector, connection).await?;
        let outcome: Result<Vec<EdgeReport>> = async {
            let mut reports = Vec::with_capacity(work.len());
            for (edge, from, to) in &work {
                let pairs = edge.key.pairs();
                let (source, target) = measure(
                    &session,
                    &TableLocator::from(*from),
                    &TableLocator::from(*to),
                    &pairs,
                )
                .await?;
                reports.push(EdgeReport {
                    edge_id: edge.id.clone(),
                    from_table_id: edge.from_table_id.clone(),
                    to_table_id: edge.to_table_id.clone(),
                    source,
                    target,
                    current_cardinality: edge.cardinality,
                    detected_cardinality: classify(&source, &target),
                });
            }
            Ok(reports)
        }
        .await;
        let reports = session.finish(outcome).await?;

        let issues: Vec<EdgeReport> = reports
            .iter()
            .filter(|r| r.detected_cardinality == Cardinality::ManyToMany)
            .cloned()
            .collect();
        tracing::info!(
            connection_id = %connection.id,
            edges = reports.len(),
            skipped = skipped.len(),
            issues = issues.len(),
            "validated model"
        );

        Ok(ModelValidation {
            issues,
            reports,
            skipped,
            warnings: if self.settings.warn_on_undecodable_keys {
                warnings
            } else {
                Vec::new()
            },
            validated: true,
        })
    }
}

async fn measure(
    session: &ScopedSession,
    source: &TableLocator,
    target: &TableLocator,
    pairs: &[KeyPair],
) -> Result<(SideStats, SideStats)> {
    let sql = build_stats_query(source, target, pairs);
    let result = session.query(&sql).await?;
    let source_stats = side_stats(&result.rows, SOURCE_SIDE)?;
    let target_stats = side_stats(&result.rows, TARGET_SIDE)?;
    Ok((source_stats, target_stats))
}

fn side_stats(rows: &[Map<String, Value>], side: &str) -> Result<SideStats> {
    let row = rows
        .iter()
        .find(|row| row.get("side").and_then(Value::as_str) == Some(side))
        .ok_or_else(|| QueryGraphError::Execution(format!("statistics row for {side} missing")))?;
    Ok(SideStats {
        total_rows: count_field(row, "total_rows")?,
        distinct_keys: count_field(row, "distinct_keys")?,
    })
}

/// Counts arrive as JSON numbers or, from inline JSON_ARRAY results, strings.
fn count_field(row: &Map<String, Value>, field: &str) -> Result<u64> {
    match row.get(field) {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| QueryGraphError::Execution(format!("statistics field {field} is not a count")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classification_table() {
        let one = SideStats::new(100, 100);
        let many = SideStats::new(50, 10);
        assert_eq!(classify(&one, &many), Cardinality::OneToMany);
        assert_eq!(classify(&many, &one), Cardinality::ManyToOne);
        assert_eq!(classify(&many, &many), Cardinality::ManyToMany);
        assert_eq!(classify(&one, &one), Cardinality::OneToOne);
        assert_eq!(
            classify(&SideStats::new(0, 0), &SideStats::new(0, 0)),
            Cardinality::OneToOne
        );
    }

    #[test]
    fn stats_query_uses_from_and_to_columns() {
        let sql = build_stats_query(
            &TableLocator::new("orders", Some("main.sales")),
            &TableLocator::new("order_lines", None),
            &[KeyPair::new("id", "order_id"), KeyPair::new("region", "region")],
        );
        assert_eq!(
            sql,
            "SELECT 'source' AS `side`, COUNT(*) AS `total_rows`, \
             COUNT(DISTINCT `id`, `region`) AS `distinct_keys` FROM `main`.`sales`.`orders` \
             UNION ALL \
             SELECT 'target' AS `side`, COUNT(*) AS `total_rows`, \
             COUNT(DISTINCT `order_id`, `region`) AS `distinct_keys` FROM `order_lines`"
        );
    }

    #[test]
    fn counts_parse_from_numbers_and_strings() {
        let rows: Vec<Map<String, Value>> = serde_json::from_value(json!([
            {"side": "source", "total_rows": 10, "distinct_keys": "10"},
            {"side": "target", "total_rows": "12", "distinct_keys": 4}
        ]))
        .unwrap();
        assert_eq!(side_stats(&rows, "source").unwrap(), SideStats::new(10, 10));
        assert_eq!(side_stats(&rows, "target").unwrap(), SideStats::new(12, 4));

        let broken: Vec<Map<String, Value>> =
            serde_json::from_value(json!([{"side": "source", "total_rows": "x"}])).unwrap();
        assert!(side_stats(&broken, "source").is_err());
        assert!(side_stats(&broken, "target").is_err());
    }

    #[test]
    fn apply_cardinalities_overwrites_matching_edges() {
        use crate::graph::JoinKey;

        let mut model = Model::new("m")
            .with_table(TableNode::new("a", "orders"))
            .with_table(TableNode::new("b", "lines"))
            .with_edge(JoinEdge::new("e1", "a", "b", JoinKey::default()));
        let report = EdgeReport {
            edge_id: "e1".to_string(),
            from_table_id: "a".to_string(),
            to_table_id: "b".to_string(),
            source: SideStats::new(5, 5),
            target: SideStats::new(5, 5),
            current_cardinality: Cardinality::OneToMany,
            detected_cardinality: Cardinality::OneToOne,
        };
        assert!(report.is_mismatch());
        let validation = ModelValidation {
            reports: vec![report],
            ..ModelValidation::empty()
        };
        assert_eq!(model.apply_cardinalities(&validation), 1);
        assert_eq!(model.edges[0].cardinality, Cardinality::OneToOne);
        assert_eq!(model.apply_cardinalities(&validation), 0);
    }
}
