//! Request-level operations over the store, the compiler and the warehouse.
//!
//! This is the one layer that attaches generated SQL to warehouse failures.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::cardinality::{CardinalityValidator, EdgeValidation, ModelValidation, TableLocator};
use crate::config::QueryGraphConfig;
use crate::error::{ExecutionFailure, QueryGraphError, Result};
use crate::graph::{GraphWarning, KeyPair, Model, TableNode};
use crate::query_builder::{CompiledQuery, SqlBuilder};
use crate::storage::{decode_edges, StoredEdge, StoredModel};
use crate::store::ModelStore;
use crate::warehouse::{ColumnMeta, QueryResult, ScopedSession, WarehouseConnector};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub sql: String,
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Map<String, Value>>,
    pub warnings: Vec<GraphWarning>,
}

pub struct QueryGraphService {
    store: Arc<dyn ModelStore>,
    connector: Arc<dyn WarehouseConnector>,
    config: QueryGraphConfig,
    builder: SqlBuilder,
}

impl QueryGraphService {
    pub fn new(store: Arc<dyn ModelStore>, connector: Arc<dyn WarehouseConnector>) -> Self {
        Self::with_config(store, connector, QueryGraphConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn ModelStore>,
        connector: Arc<dyn WarehouseConnector>,
        config: QueryGraphConfig,
    ) -> Self {
        Self {
            store,
            connector,
            config,
            builder: SqlBuilder::new(),
        }
    }

    pub fn config(&self) -> &QueryGraphConfig {
        &self.config
    }

    /// Compile a stored model without running it.
    pub async fn compile_model(&self, model_id: &str) -> Result<Option<CompiledQuery>> {
        let model = self.store.load_model(model_id).await?.into_model();
        Ok(self.builder.compile(&model))
    }

    pub async fn save_model(&self, model: &Model) -> Result<()> {
        self.store.save_model(StoredModel::from_model(model)?).await
    }

    pub async fn execute_stored_model(
        &self,
        model_id: &str,
        row_limit: Option<u64>,
    ) -> std::result::Result<ExecutionResult, ExecutionFailure> {
        let stored = self
            .store
            .load_model(model_id)
            .await
            .map_err(|err| ExecutionFailure::from_error(&err, None))?;
        self.execute_model(&stored.into_model(), row_limit).await
    }

    /// Compile `model` and run it on its warehouse. Failures after
    /// compilation carry the SQL that was attempted.
    pub async fn execute_model(
        &self,
        model: &Model,
        row_limit: Option<u64>,
    ) -> std::result::Result<ExecutionResult, ExecutionFailure> {
        let connection_id = model
            .connection_id
            .as_deref()
            .ok_or_else(|| ExecutionFailure::new("model has no warehouse connection", None))?;
        let resolved = self.config.for_connection(connection_id);
        let limit = resolved.query.effective_row_limit(row_limit);

        let compiled = self
            .builder
            .compile_with_limit(model, limit)
            .ok_or_else(|| ExecutionFailure::new("model has no tables to query", None))?;
        let sql = compiled.sql.as_str();

        let run = self.run_sql(connection_id, sql);
        let result = match tokio::time::timeout(resolved.query.timeout(), run).await {
            Ok(result) => result,
            Err(_) => Err(QueryGraphError::Execution(format!(
                "query timed out after {} ms",
                resolved.query.timeout_ms
            ))),
        };

        match result {
            Ok(result) => {
                tracing::info!(
                    model_id = %model.id,
                    rows = result.rows.len(),
                    "executed model"
                );
                Ok(ExecutionResult {
                    sql: compiled.sql.clone(),
                    columns: result.columns,
                    rows: result.rows,
                    warnings: compiled.warnings.clone(),
                })
            }
            Err(err) => {
                tracing::error!(model_id = %model.id, error = %err, sql = %sql, "model execution failed");
                Err(ExecutionFailure::from_error(&err, Some(sql)))
            }
        }
    }

    async fn run_sql(&self, connection_id: &str, sql: &str) -> Result<QueryResult> {
        let connection = self.store.connection(connection_id).await?;
        let session = ScopedSession::open(self.connector.as_ref(), &connection).await?;
        let outcome = session.query(sql).await;
        session.finish(outcome).await
    }

    pub async fn validate_edge(
        &self,
        connection_id: &str,
        source: &TableLocator,
        target: &TableLocator,
        pairs: &[KeyPair],
    ) -> Result<EdgeValidation> {
        if pairs.is_empty() {
            return Err(QueryGraphError::Validation(
                "at least one join key pair is required".to_string(),
            ));
        }
        let connection = self.store.connection(connection_id).await?;
        self.validator(connection_id)
            .validate_edge(&connection, source, target, pairs)
            .await
    }

    /// Validate stored relationships. Composite keys decode with the same
    /// `id = id` fallback the compiler uses.
    pub async fn validate_model(
        &self,
        connection_id: &str,
        tables: &[TableNode],
        relationships: &[StoredEdge],
    ) -> Result<ModelValidation> {
        let (edges, warnings) = decode_edges(relationships);
        if tables.is_empty() || edges.is_empty() {
            return Ok(ModelValidation::empty());
        }
        let connection = self.store.connection(connection_id).await?;
        self.validator(connection_id)
            .validate_model(&connection, tables, &edges, warnings)
            .await
    }

    fn validator(&self, connection_id: &str) -> CardinalityValidator<'_> {
        CardinalityValidator::new(
            self.connector.as_ref(),
            self.config.for_connection(connection_id).validation,
        )
    }
}
