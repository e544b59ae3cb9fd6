//! Cardinality validation and model execution against a scripted warehouse.

mod common;

use std::sync::Arc;

use common::{connection, stats_rows, FakeWarehouse};
use querygraph::cardinality::build_stats_query;
use querygraph::config::{QueryGraphConfig, ValidationConfig};
use querygraph::graph::{
    Cardinality, GraphWarning, JoinEdge, JoinKey, KeyPair, Model, TableNode,
};
use querygraph::storage::StoredEdge;
use querygraph::warehouse::ScopedSession;
use querygraph::{
    CardinalityValidator, InMemoryStore, QueryGraphError, QueryGraphService, TableLocator,
};
use serde_json::json;

// ============================================================================
// Fixtures
// ============================================================================

mod fixtures {
    use super::*;

    pub fn tables() -> Vec<TableNode> {
        vec![
            TableNode::new("a", "orders").with_schema("main.sales"),
            TableNode::new("b", "order_lines").with_schema("main.sales"),
            TableNode::new("c", "shipments"),
        ]
    }

    pub fn edges() -> Vec<JoinEdge> {
        vec![
            JoinEdge::new("e1", "a", "b", JoinKey::simple("id", "order_id")),
            JoinEdge::new("e2", "b", "c", JoinKey::simple("sku", "sku")),
            JoinEdge::new("e3", "a", "ghost", JoinKey::default()),
        ]
    }

    pub fn service(warehouse: &FakeWarehouse) -> QueryGraphService {
        service_with(warehouse, QueryGraphConfig::default())
    }

    pub fn service_with(warehouse: &FakeWarehouse, config: QueryGraphConfig) -> QueryGraphService {
        let store = InMemoryStore::from_parts(Vec::new(), vec![connection()]);
        QueryGraphService::with_config(Arc::new(store), Arc::new(warehouse.clone()), config)
    }
}

fn validator(warehouse: &FakeWarehouse) -> CardinalityValidator<'_> {
    CardinalityValidator::new(warehouse, ValidationConfig::default())
}

// ============================================================================
// Single edge
// ============================================================================

#[tokio::test]
async fn validate_edge_detects_one_to_many() {
    let warehouse = FakeWarehouse::new().respond(stats_rows((100, 100), (250, 100)));
    let source = TableLocator::new("orders", Some("main.sales"));
    let target = TableLocator::new("order_lines", Some("main.sales"));
    let pairs = [KeyPair::new("id", "order_id")];

    let result = validator(&warehouse)
        .validate_edge(&connection(), &source, &target, &pairs)
        .await
        .unwrap();

    assert_eq!(result.detected_cardinality, Cardinality::OneToMany);
    assert_eq!(result.source.total_rows, 100);
    assert_eq!(result.target.total_rows, 250);
    assert_eq!(result.target.distinct_keys, 100);
    assert_eq!(
        warehouse.statements(),
        vec![build_stats_query(&source, &target, &pairs)]
    );
    assert_eq!(
        warehouse.events(),
        vec![
            "connect",
            "open_session",
            "execute",
            "close_operation",
            "close_session",
            "close_client"
        ]
    );
}

#[tokio::test]
async fn validate_edge_rejects_empty_pairs_before_connecting() {
    let warehouse = FakeWarehouse::new();
    let locator = TableLocator::new("orders", None);

    let err = validator(&warehouse)
        .validate_edge(&connection(), &locator, &locator, &[])
        .await
        .unwrap_err();

    assert!(matches!(err, QueryGraphError::Validation(_)));
    assert!(warehouse.events().is_empty());
}

#[tokio::test]
async fn fetch_errors_still_close_everything() {
    let warehouse = FakeWarehouse::new().fail_fetch("result expired");
    let locator = TableLocator::new("orders", None);

    let err = validator(&warehouse)
        .validate_edge(&connection(), &locator, &locator, &[KeyPair::new("id", "id")])
        .await
        .unwrap_err();

    assert!(err.to_string().contains("result expired"));
    assert_eq!(warehouse.count("close_operation"), 1);
    assert!(warehouse.all_closed());
}

#[tokio::test]
async fn refused_connections_surface_as_warehouse_errors() {
    let warehouse = FakeWarehouse::new().refuse_connections();
    let locator = TableLocator::new("orders", None);

    let err = validator(&warehouse)
        .validate_edge(&connection(), &locator, &locator, &[KeyPair::new("id", "id")])
        .await
        .unwrap_err();

    assert!(matches!(err, QueryGraphError::Warehouse(_)));
    assert!(warehouse.events().is_empty());
}

// ============================================================================
// Whole model
// ============================================================================

#[tokio::test]
async fn validate_model_reports_every_resolvable_edge_over_one_session() {
    let warehouse = FakeWarehouse::new()
        .respond(stats_rows((10, 10), (30, 10)))
        .respond(stats_rows((30, 5), (40, 8)));

    let validation = validator(&warehouse)
        .validate_model(&connection(), &fixtures::tables(), &fixtures::edges(), Vec::new())
        .await
        .unwrap();

    assert!(validation.validated);
    assert_eq!(validation.reports.len(), 2);
    assert_eq!(validation.reports[0].edge_id, "e1");
    assert_eq!(
        validation.reports[0].detected_cardinality,
        Cardinality::OneToMany
    );
    assert!(!validation.reports[0].is_mismatch());
    assert_eq!(
        validation.reports[1].detected_cardinality,
        Cardinality::ManyToMany
    );
    assert!(validation.reports[1].is_mismatch());

    assert_eq!(validation.issues.len(), 1);
    assert_eq!(validation.issues[0].edge_id, "e2");
    assert_eq!(validation.skipped, vec!["e3"]);

    assert_eq!(warehouse.count("connect"), 1);
    assert_eq!(warehouse.count("open_session"), 1);
    assert_eq!(warehouse.statements().len(), 2);
    assert!(warehouse.statements()[0].contains("FROM `main`.`sales`.`orders`"));
    assert!(warehouse.statements()[1].contains("FROM `shipments`"));
    assert!(warehouse.all_closed());
}

#[tokio::test]
async fn validate_model_without_tables_or_edges_never_connects() {
    let warehouse = FakeWarehouse::new();
    let v = validator(&warehouse);

    let no_edges = v
        .validate_model(&connection(), &fixtures::tables(), &[], Vec::new())
        .await
        .unwrap();
    assert!(no_edges.validated);
    assert!(no_edges.reports.is_empty());
    assert!(no_edges.issues.is_empty());

    let no_tables = v
        .validate_model(&connection(), &[], &fixtures::edges(), Vec::new())
        .await
        .unwrap();
    assert!(no_tables.validated);

    let only_dangling = v
        .validate_model(
            &connection(),
            &fixtures::tables(),
            &fixtures::edges()[2..],
            Vec::new(),
        )
        .await
        .unwrap();
    assert_eq!(only_dangling.skipped, vec!["e3"]);

    assert!(warehouse.events().is_empty());
}

#[tokio::test]
async fn a_failing_edge_aborts_the_batch_and_closes_the_session() {
    let warehouse = FakeWarehouse::new()
        .respond(stats_rows((10, 10), (30, 10)))
        .fail_execute("table not found: order_lines");

    let err = validator(&warehouse)
        .validate_model(&connection(), &fixtures::tables(), &fixtures::edges(), Vec::new())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("table not found"));
    assert_eq!(warehouse.statements().len(), 2);
    assert_eq!(warehouse.count("close_session"), 1);
    assert!(warehouse.all_closed());
}

#[tokio::test]
async fn many_to_many_edges_are_always_issues_even_with_warnings_muted() {
    let warehouse = FakeWarehouse::new().respond(stats_rows((30, 5), (40, 8)));
    let settings = ValidationConfig {
        warn_on_undecodable_keys: false,
    };

    let validation = CardinalityValidator::new(&warehouse, settings)
        .validate_model(
            &connection(),
            &fixtures::tables(),
            &fixtures::edges()[..1],
            vec![GraphWarning::UndecodableCompositeKey {
                edge_id: "e1".to_string(),
                error: "bad json".to_string(),
            }],
        )
        .await
        .unwrap();

    assert_eq!(
        validation.reports[0].detected_cardinality,
        Cardinality::ManyToMany
    );
    assert_eq!(validation.issues, validation.reports);
    assert!(validation.warnings.is_empty());
}

#[tokio::test]
async fn detected_cardinalities_can_be_written_back() {
    let warehouse = FakeWarehouse::new()
        .respond(stats_rows((10, 10), (30, 10)))
        .respond(stats_rows((30, 5), (40, 8)));
    let mut model = Model::new("m");
    model.tables = fixtures::tables();
    model.edges = fixtures::edges();

    let validation = validator(&warehouse)
        .validate_model(&connection(), &model.tables, &model.edges, Vec::new())
        .await
        .unwrap();

    assert_eq!(model.apply_cardinalities(&validation), 1);
    assert_eq!(model.edges[1].cardinality, Cardinality::ManyToMany);
}

// ============================================================================
// Service layer
// ============================================================================

#[tokio::test]
async fn service_validation_decodes_broken_keys_to_id() {
    let warehouse = FakeWarehouse::new().respond(stats_rows((5, 5), (5, 5)));
    let relationships: Vec<StoredEdge> = serde_json::from_value(json!([{
        "id": "e1",
        "fromTableId": "a",
        "toTableId": "b",
        "fromColumn": "__JSON__:[{oops",
        "toColumn": "__COMPOSITE__"
    }]))
    .unwrap();

    let validation = fixtures::service(&warehouse)
        .validate_model("wh", &fixtures::tables(), &relationships)
        .await
        .unwrap();

    assert_eq!(
        validation.reports[0].detected_cardinality,
        Cardinality::OneToOne
    );
    assert_eq!(validation.warnings.len(), 1);
    let statement = &warehouse.statements()[0];
    assert_eq!(statement.matches("COUNT(DISTINCT `id`)").count(), 2);
}

#[tokio::test]
async fn service_rejects_unknown_connections() {
    let warehouse = FakeWarehouse::new();
    let err = fixtures::service(&warehouse)
        .validate_edge(
            "missing",
            &TableLocator::new("a", None),
            &TableLocator::new("b", None),
            &[KeyPair::new("id", "id")],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QueryGraphError::Validation(_)));
    assert!(warehouse.events().is_empty());
}

#[tokio::test]
async fn execute_model_runs_unlimited_unless_a_limit_is_configured() {
    let warehouse = FakeWarehouse::new()
        .respond(json!([
            {"id": 1, "status": "open"},
            {"id": 2, "status": "closed"}
        ]))
        .respond(json!([{"id": 1, "status": "open"}]));
    let mut model = Model::new("m").with_table(TableNode::new("a", "orders"));
    model.connection_id = Some("wh".to_string());

    let result = fixtures::service(&warehouse)
        .execute_model(&model, None)
        .await
        .unwrap();

    assert_eq!(result.sql, "SELECT * FROM `orders` AS t1");
    assert_eq!(warehouse.statements(), vec![result.sql.clone()]);
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.columns.len(), 2);
    assert!(warehouse.all_closed());

    let mut config = QueryGraphConfig::default();
    config.defaults.query.default_row_limit = 1000;
    let limited = fixtures::service_with(&warehouse, config)
        .execute_model(&model, None)
        .await
        .unwrap();
    assert_eq!(limited.sql, "SELECT * FROM `orders` AS t1 LIMIT 1000");
}

#[tokio::test]
async fn execution_failures_carry_the_attempted_sql() {
    let warehouse = FakeWarehouse::new().fail_execute("PERMISSION_DENIED");
    let mut model = Model::new("m").with_table(TableNode::new("a", "orders"));
    model.connection_id = Some("wh".to_string());

    let failure = fixtures::service(&warehouse)
        .execute_model(&model, Some(25))
        .await
        .unwrap_err();

    assert!(failure.message.contains("PERMISSION_DENIED"));
    assert_eq!(
        failure.sql.as_deref(),
        Some("SELECT * FROM `orders` AS t1 LIMIT 25")
    );
    assert!(warehouse.all_closed());
}

#[tokio::test]
async fn timed_out_executions_close_the_running_statement() {
    let warehouse = FakeWarehouse::new().hang_fetch();
    let mut model = Model::new("m").with_table(TableNode::new("a", "orders"));
    model.connection_id = Some("wh".to_string());
    let mut config = QueryGraphConfig::default();
    config.defaults.query.timeout_ms = 50;

    let failure = fixtures::service_with(&warehouse, config)
        .execute_model(&model, None)
        .await
        .unwrap_err();

    assert!(failure.message.contains("timed out"), "{}", failure.message);
    assert_eq!(failure.sql.as_deref(), Some("SELECT * FROM `orders` AS t1"));
    for _ in 0..10 {
        if warehouse.all_closed() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(warehouse.count("close_operation"), 1);
    assert!(warehouse.all_closed(), "{:?}", warehouse.events());
    assert_eq!(
        warehouse.events(),
        vec![
            "connect",
            "open_session",
            "execute",
            "close_operation",
            "close_session",
            "close_client"
        ]
    );
}

#[tokio::test]
async fn execution_without_a_connection_fails_before_compiling() {
    let warehouse = FakeWarehouse::new();
    let model = Model::new("m").with_table(TableNode::new("a", "orders"));

    let failure = fixtures::service(&warehouse)
        .execute_model(&model, None)
        .await
        .unwrap_err();

    assert!(failure.sql.is_none());
    assert!(warehouse.events().is_empty());
}

// ============================================================================
// Session lifecycle
// ============================================================================

#[tokio::test]
async fn abandoned_sessions_are_closed_in_the_background() {
    let warehouse = FakeWarehouse::new();
    let session = ScopedSession::open(&warehouse, &connection()).await.unwrap();
    drop(session);

    for _ in 0..10 {
        if warehouse.all_closed() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(warehouse.count("close_session"), 1);
    assert_eq!(warehouse.count("close_client"), 1);
}

#[tokio::test]
async fn explicit_close_is_not_repeated_on_drop() {
    let warehouse = FakeWarehouse::new();
    let session = ScopedSession::open(&warehouse, &connection()).await.unwrap();
    session.close().await.unwrap();
    tokio::task::yield_now().await;

    assert_eq!(warehouse.count("close_session"), 1);
    assert_eq!(warehouse.count("close_client"), 1);
}
