//! Databricks SQL Statement Execution API adapter.
//!
//! Statements are submitted with `JSON_ARRAY` inline disposition and polled
//! until they reach a terminal state. The API is stateless, so sessions and
//! clients only hold the HTTP client and credentials.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use super::{
    ColumnMeta, ConnectionRecord, WarehouseClient, WarehouseConnector, WarehouseOperation,
    WarehouseSession,
};
use crate::config::{QueryGraphConfig, WarehouseConfig};
use crate::error::{QueryGraphError, Result};

const STATEMENTS_PATH: &str = "/api/2.0/sql/statements";

pub struct DatabricksConnector {
    config: QueryGraphConfig,
}

impl DatabricksConnector {
    pub fn new(config: QueryGraphConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WarehouseConnector for DatabricksConnector {
    async fn connect(&self, connection: &ConnectionRecord) -> Result<Box<dyn WarehouseClient>> {
        let resolved = self.config.for_connection(&connection.id);
        let warehouse_id = warehouse_id_from_path(&connection.http_path)?;
        let http = Client::builder()
            .timeout(resolved.query.timeout())
            .build()
            .map_err(http_error)?;
        tracing::debug!(
            connection_id = %connection.id,
            warehouse_id = %warehouse_id,
            "created databricks client"
        );
        Ok(Box::new(DatabricksClient {
            inner: Arc::new(ApiClient {
                http,
                base_url: base_url(&connection.host),
                token: connection.token.clone(),
                warehouse_id,
                settings: resolved.warehouse,
            }),
        }))
    }
}

struct ApiClient {
    http: Client,
    base_url: String,
    token: String,
    warehouse_id: String,
    settings: WarehouseConfig,
}

impl ApiClient {
    async fn submit(&self, sql: &str) -> Result<StatementResponse> {
        let wait = self.settings.wait_timeout_secs.clamp(5, 50);
        let payload = json!({
            "statement": sql,
            "warehouse_id": self.warehouse_id,
            "wait_timeout": format!("{wait}s"),
            "on_wait_timeout": "CONTINUE",
            "disposition": "INLINE",
            "format": "JSON_ARRAY",
        });
        let response = self
            .http
            .post(format!("{}{STATEMENTS_PATH}", self.base_url))
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await
            .map_err(http_error)?;
        read_json(response).await
    }

    async fn status(&self, statement_id: &str) -> Result<StatementResponse> {
        let response = self
            .http
            .get(format!("{}{STATEMENTS_PATH}/{statement_id}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(http_error)?;
        read_json(response).await
    }

    async fn chunk(&self, link: &str) -> Result<ResultChunk> {
        let response = self
            .http
            .get(format!("{}{link}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(http_error)?;
        read_json(response).await
    }

    async fn cancel(&self, statement_id: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}{STATEMENTS_PATH}/{statement_id}/cancel", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(http_error)?;
        if !response.status().is_success() {
            return Err(QueryGraphError::Warehouse(format!(
                "cancel of statement {statement_id} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

struct DatabricksClient {
    inner: Arc<ApiClient>,
}

#[async_trait]
impl WarehouseClient for DatabricksClient {
    async fn open_session(&self) -> Result<Box<dyn WarehouseSession>> {
        Ok(Box::new(DatabricksSession {
            inner: self.inner.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct DatabricksSession {
    inner: Arc<ApiClient>,
}

#[async_trait]
impl WarehouseSession for DatabricksSession {
    async fn execute_statement(&self, sql: &str) -> Result<Box<dyn WarehouseOperation>> {
        let response = self.inner.submit(sql).await?;
        response.status.check()?;
        tracing::debug!(
            statement_id = %response.statement_id,
            state = ?response.status.state,
            "submitted statement"
        );
        Ok(Box::new(DatabricksOperation {
            inner: self.inner.clone(),
            statement_id: response.statement_id.clone(),
            latest: Mutex::new(response),
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct DatabricksOperation {
    inner: Arc<ApiClient>,
    statement_id: String,
    latest: Mutex<StatementResponse>,
}

impl DatabricksOperation {
    /// Poll until the statement is terminal; errors unless it succeeded.
    async fn wait(&self) -> Result<StatementResponse> {
        let mut latest = self.latest.lock().await;
        let mut attempts = 0;
        while !latest.status.state.is_terminal() {
            if attempts >= self.inner.settings.max_poll_attempts {
                return Err(QueryGraphError::Warehouse(format!(
                    "statement {} still {:?} after {attempts} polls",
                    self.statement_id, latest.status.state
                )));
            }
            tokio::time::sleep(self.inner.settings.poll_interval()).await;
            *latest = self.inner.status(&self.statement_id).await?;
            attempts += 1;
        }
        latest.status.check()?;
        Ok(latest.clone())
    }
}

#[async_trait]
impl WarehouseOperation for DatabricksOperation {
    async fn fetch_all(&self) -> Result<Vec<Map<String, Value>>> {
        let response = self.wait().await?;
        let columns = response.columns();
        let Some(mut chunk) = response.result else {
            return Ok(Vec::new());
        };
        let mut rows = rows_from_chunk(&columns, &chunk);
        while let Some(link) = chunk.next_chunk_internal_link.take() {
            chunk = self.inner.chunk(&link).await?;
            rows.extend(rows_from_chunk(&columns, &chunk));
        }
        Ok(rows)
    }

    async fn schema(&self) -> Result<Vec<ColumnMeta>> {
        let response = self.wait().await?;
        Ok(response
            .columns()
            .into_iter()
            .map(|name| ColumnMeta { name })
            .collect())
    }

    async fn close(&self) -> Result<()> {
        let state = self.latest.lock().await.status.state;
        if state.is_terminal() {
            return Ok(());
        }
        tracing::info!(statement_id = %self.statement_id, "cancelling unfinished statement");
        self.inner.cancel(&self.statement_id).await
    }
}

#[derive(Debug, Clone, Deserialize)]
struct StatementResponse {
    statement_id: String,
    status: StatementStatus,
    #[serde(default)]
    manifest: Option<Manifest>,
    #[serde(default)]
    result: Option<ResultChunk>,
}

impl StatementResponse {
    fn columns(&self) -> Vec<String> {
        self.manifest
            .as_ref()
            .map(|m| m.schema.columns.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct StatementStatus {
    state: StatementState,
    #[serde(default)]
    error: Option<ServiceError>,
}

impl StatementStatus {
    fn check(&self) -> Result<()> {
        match self.state {
            StatementState::Failed | StatementState::Canceled | StatementState::Closed => {
                let detail = self
                    .error
                    .as_ref()
                    .and_then(|e| e.message.clone())
                    .unwrap_or_else(|| format!("statement {:?}", self.state));
                Err(QueryGraphError::Warehouse(detail))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum StatementState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Closed,
}

impl StatementState {
    fn is_terminal(&self) -> bool {
        !matches!(self, StatementState::Pending | StatementState::Running)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ServiceError {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Manifest {
    schema: ManifestSchema,
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestSchema {
    #[serde(default)]
    columns: Vec<ManifestColumn>,
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestColumn {
    name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ResultChunk {
    #[serde(default)]
    data_array: Vec<Vec<Value>>,
    #[serde(default)]
    next_chunk_internal_link: Option<String>,
}

async fn read_json<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(QueryGraphError::Warehouse(format!(
            "databricks returned {status}: {body}"
        )));
    }
    response.json().await.map_err(http_error)
}

fn http_error(err: reqwest::Error) -> QueryGraphError {
    QueryGraphError::Warehouse(format!("databricks request failed: {err}"))
}

/// The warehouse id is the last segment of the SQL endpoint path
/// (`/sql/1.0/warehouses/<id>`).
fn warehouse_id_from_path(http_path: &str) -> Result<String> {
    http_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|id| !id.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            QueryGraphError::Config(format!("cannot read warehouse id from path {http_path:?}"))
        })
}

fn base_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

fn rows_from_chunk(columns: &[String], chunk: &ResultChunk) -> Vec<Map<String, Value>> {
    chunk
        .data_array
        .iter()
        .map(|row| {
            columns
                .iter()
                .cloned()
                .zip(row.iter().cloned().chain(std::iter::repeat(Value::Null)))
                .collect()
        })
        .collect()
}
