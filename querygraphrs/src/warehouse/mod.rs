//! Warehouse session adapter.
//!
//! The driver is modelled as four layers (connector, client, session,
//! operation), each of which must be closed. [`ScopedSession`] owns a client
//! and one open session and releases both on every exit path.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::error::{QueryGraphError, Result};

#[cfg(feature = "databricks")]
pub mod databricks;
#[cfg(feature = "databricks")]
pub use databricks::DatabricksConnector;

/// Credentials and endpoint of a warehouse, as kept by the model store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub id: String,
    pub host: String,
    #[serde(alias = "path")]
    pub http_path: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMeta {
    #[serde(alias = "columnName")]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Map<String, Value>>,
}

#[async_trait]
pub trait WarehouseConnector: Send + Sync {
    async fn connect(&self, connection: &ConnectionRecord) -> Result<Box<dyn WarehouseClient>>;
}

#[async_trait]
pub trait WarehouseClient: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn WarehouseSession>>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait WarehouseSession: Send + Sync {
    async fn execute_statement(&self, sql: &str) -> Result<Box<dyn WarehouseOperation>>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait WarehouseOperation: Send + Sync {
    async fn fetch_all(&self) -> Result<Vec<Map<String, Value>>>;
    async fn schema(&self) -> Result<Vec<ColumnMeta>>;
    async fn close(&self) -> Result<()>;
}

/// A client with one open session, closed on [`ScopedSession::finish`] or,
/// if abandoned, on a background task when dropped.
///
/// The statement being fetched is tracked too, so a query cut short by a
/// timeout still has its operation closed (and, on Databricks, cancelled).
pub struct ScopedSession {
    connection_id: String,
    client: Option<Box<dyn WarehouseClient>>,
    session: Option<Box<dyn WarehouseSession>>,
    in_flight: Mutex<Option<Arc<dyn WarehouseOperation>>>,
}

impl ScopedSession {
    pub async fn open(
        connector: &dyn WarehouseConnector,
        connection: &ConnectionRecord,
    ) -> Result<Self> {
        tracing::info!(connection_id = %connection.id, host = %connection.host, "connecting to warehouse");
        let client = connector.connect(connection).await?;
        match client.open_session().await {
            Ok(session) => Ok(Self {
                connection_id: connection.id.clone(),
                client: Some(client),
                session: Some(session),
                in_flight: Mutex::new(None),
            }),
            Err(err) => {
                if let Err(close_err) = client.close().await {
                    tracing::warn!(connection_id = %connection.id, error = %close_err, "failed to close client");
                }
                Err(err)
            }
        }
    }

    /// Execute `sql`, fetch every row and the result schema. The operation is
    /// closed whether or not the fetch succeeds; if this future is dropped
    /// first, the session closes it.
    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| QueryGraphError::Warehouse("session is closed".to_string()))?;
        let operation: Arc<dyn WarehouseOperation> = session
            .execute_statement(sql)
            .await
            .map_err(|err| {
                tracing::error!(connection_id = %self.connection_id, error = %err, "statement failed");
                err
            })?
            .into();
        *self.in_flight.lock().await = Some(operation.clone());

        let fetched: Result<QueryResult> = async {
            let rows = operation.fetch_all().await?;
            let columns = operation.schema().await?;
            Ok(QueryResult { columns, rows })
        }
        .await;

        self.in_flight.lock().await.take();
        if let Err(err) = operation.close().await {
            tracing::warn!(connection_id = %self.connection_id, error = %err, "failed to close operation");
        }
        if let Ok(result) = &fetched {
            tracing::debug!(
                connection_id = %self.connection_id,
                rows = result.rows.len(),
                columns = result.columns.len(),
                "fetched statement result"
            );
        }
        fetched
    }

    /// Close the session and client, then hand back `outcome`. A close error
    /// is only reported when the work itself succeeded.
    pub async fn finish<T>(mut self, outcome: Result<T>) -> Result<T> {
        let closed = self.close_all().await;
        match (outcome, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), _) => Err(err),
        }
    }

    pub async fn close(self) -> Result<()> {
        self.finish(Ok(())).await
    }

    async fn close_all(&mut self) -> Result<()> {
        let mut first_err = None;
        if let Some(operation) = self.in_flight.get_mut().take() {
            if let Err(err) = operation.close().await {
                tracing::warn!(connection_id = %self.connection_id, error = %err, "failed to close operation");
                first_err.get_or_insert(err);
            }
        }
        if let Some(session) = self.session.take() {
            if let Err(err) = session.close().await {
                tracing::warn!(connection_id = %self.connection_id, error = %err, "failed to close session");
                first_err.get_or_insert(err);
            }
        }
        if let Some(client) = self.client.take() {
            if let Err(err) = client.close().await {
                tracing::warn!(connection_id = %self.connection_id, error = %err, "failed to close client");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for ScopedSession {
    fn drop(&mut self) {
        let operation = self.in_flight.get_mut().take();
        let session = self.session.take();
        let client = self.client.take();
        if operation.is_none() && session.is_none() && client.is_none() {
            return;
        }
        tracing::warn!(
            connection_id = %self.connection_id,
            in_flight = operation.is_some(),
            "warehouse session dropped without close"
        );
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(connection_id = %self.connection_id, "no runtime to close abandoned session");
            return;
        };
        handle.spawn(async move {
            if let Some(operation) = operation {
                let _ = operation.close().await;
            }
            if let Some(session) = session {
                let _ = session.close().await;
            }
            if let Some(client) = client {
                let _ = client.close().await;
            }
        });
    }
}
