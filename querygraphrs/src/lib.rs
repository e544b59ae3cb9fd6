//! Compiles visual multi-table query graphs into warehouse SQL and infers
//! join cardinality from live row counts.

pub mod cardinality;
pub mod config;
pub mod defaults;
pub mod dialect;
pub mod error;
pub mod graph;
pub mod logging;
pub mod manual_sql;
pub mod query_builder;
pub mod service;
pub mod sql_ast;
pub mod storage;
pub mod store;
pub mod warehouse;

pub use cardinality::{
    classify, CardinalityValidator, EdgeReport, EdgeValidation, ModelValidation, SideStats,
    TableLocator,
};
pub use config::QueryGraphConfig;
pub use error::{ExecutionFailure, QueryGraphError, Result};
pub use graph::{
    Aggregation, Cardinality, FilterCondition, FilterOp, FilterSet, GraphWarning, JoinEdge,
    JoinKey, JoinType, KeyPair, Model, SelectedColumn, TableNode,
};
pub use manual_sql::{parse_manual_sql, ManualSqlSync};
pub use query_builder::{CompiledQuery, SqlBuilder};
pub use service::{ExecutionResult, QueryGraphService};
pub use storage::{StoredEdge, StoredModel};
pub use store::{InMemoryStore, ModelStore};
pub use warehouse::{ConnectionRecord, QueryResult, ScopedSession, WarehouseConnector};
