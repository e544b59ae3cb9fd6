//! Scripted in-memory warehouse that records every open and close.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use querygraph::error::{QueryGraphError, Result};
use querygraph::warehouse::{
    ColumnMeta, ConnectionRecord, WarehouseClient, WarehouseConnector, WarehouseOperation,
    WarehouseSession,
};
use serde_json::{json, Map, Value};

pub enum Scripted {
    Rows(Vec<Map<String, Value>>),
    ExecuteError(String),
    FetchError(String),
    /// The fetch never completes within any test timeout.
    Hang,
}

#[derive(Default)]
struct State {
    events: Vec<String>,
    statements: Vec<String>,
    script: VecDeque<Scripted>,
    fail_connect: bool,
}

#[derive(Clone, Default)]
pub struct FakeWarehouse {
    state: Arc<Mutex<State>>,
}

impl FakeWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response; `rows` must be a JSON array of objects.
    pub fn respond(self, rows: Value) -> Self {
        let rows: Vec<Map<String, Value>> = serde_json::from_value(rows).unwrap();
        self.push(Scripted::Rows(rows))
    }

    pub fn fail_execute(self, message: &str) -> Self {
        self.push(Scripted::ExecuteError(message.to_string()))
    }

    pub fn fail_fetch(self, message: &str) -> Self {
        self.push(Scripted::FetchError(message.to_string()))
    }

    pub fn hang_fetch(self) -> Self {
        self.push(Scripted::Hang)
    }

    pub fn refuse_connections(self) -> Self {
        self.state.lock().unwrap().fail_connect = true;
        self
    }

    fn push(self, scripted: Scripted) -> Self {
        self.state.lock().unwrap().script.push_back(scripted);
        self
    }

    fn record(&self, event: &str) {
        self.state.lock().unwrap().events.push(event.to_string());
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().unwrap().statements.clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| e.as_str() == event).count()
    }

    /// Every client, session and operation that was opened has been closed.
    pub fn all_closed(&self) -> bool {
        self.count("connect") == self.count("close_client")
            && self.count("open_session") == self.count("close_session")
            && self.count("execute") == self.count("close_operation")
    }
}

/// Statistics rows as the warehouse returns them; target counts arrive as
/// strings the way inline JSON results carry them.
pub fn stats_rows(source: (u64, u64), target: (u64, u64)) -> Value {
    json!([
        {"side": "source", "total_rows": source.0, "distinct_keys": source.1},
        {"side": "target", "total_rows": target.0.to_string(), "distinct_keys": target.1.to_string()}
    ])
}

pub fn connection() -> ConnectionRecord {
    ConnectionRecord {
        id: "wh".to_string(),
        host: "dbc-test.cloud.databricks.com".to_string(),
        http_path: "/sql/1.0/warehouses/abc123".to_string(),
        token: "dapi-test".to_string(),
    }
}

#[async_trait]
impl WarehouseConnector for FakeWarehouse {
    async fn connect(&self, _connection: &ConnectionRecord) -> Result<Box<dyn WarehouseClient>> {
        if self.state.lock().unwrap().fail_connect {
            return Err(QueryGraphError::Warehouse("connection refused".to_string()));
        }
        self.record("connect");
        Ok(Box::new(FakeClient {
            warehouse: self.clone(),
        }))
    }
}

struct FakeClient {
    warehouse: FakeWarehouse,
}

#[async_trait]
impl WarehouseClient for FakeClient {
    async fn open_session(&self) -> Result<Box<dyn WarehouseSession>> {
        self.warehouse.record("open_session");
        Ok(Box::new(FakeSession {
            warehouse: self.warehouse.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.warehouse.record("close_client");
        Ok(())
    }
}

struct FakeSession {
    warehouse: FakeWarehouse,
}

#[async_trait]
impl WarehouseSession for FakeSession {
    async fn execute_statement(&self, sql: &str) -> Result<Box<dyn WarehouseOperation>> {
        let next = {
            let mut state = self.warehouse.state.lock().unwrap();
            state.statements.push(sql.to_string());
            state.script.pop_front()
        };
        match next {
            None => Err(QueryGraphError::Warehouse("no scripted response".to_string())),
            Some(Scripted::ExecuteError(message)) => Err(QueryGraphError::Warehouse(message)),
            Some(scripted) => {
                self.warehouse.record("execute");
                Ok(Box::new(FakeOperation {
                    warehouse: self.warehouse.clone(),
                    scripted,
                }))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.warehouse.record("close_session");
        Ok(())
    }
}

struct FakeOperation {
    warehouse: FakeWarehouse,
    scripted: Scripted,
}

#[async_trait]
impl WarehouseOperation for FakeOperation {
    async fn fetch_all(&self) -> Result<Vec<Map<String, Value>>> {
        match &self.scripted {
            Scripted::Rows(rows) => Ok(rows.clone()),
            Scripted::FetchError(message) | Scripted::ExecuteError(message) => {
                Err(QueryGraphError::Warehouse(message.clone()))
            }
            Scripted::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Vec::new())
            }
        }
    }

    async fn schema(&self) -> Result<Vec<ColumnMeta>> {
        let columns = match &self.scripted {
            Scripted::Rows(rows) => rows
                .first()
                .map(|row| row.keys().map(|name| ColumnMeta { name: name.clone() }).collect())
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        Ok(columns)
    }

    async fn close(&self) -> Result<()> {
        self.warehouse.record("close_operation");
        Ok(())
    }
}
