use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueryGraphError>;

#[derive(Debug, Error)]
pub enum QueryGraphError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("sql generation error: {0}")]
    Sql(String),
    #[error("warehouse error: {0}")]
    Warehouse(String),
    #[error("execution error: {0}")]
    Execution(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure of a compiled query against the warehouse.
///
/// Carries the SQL that was attempted so the caller can show it verbatim.
#[derive(Debug, Clone, Serialize, Error)]
#[error("{message}")]
pub struct ExecutionFailure {
    pub message: String,
    pub sql: Option<String>,
}

impl ExecutionFailure {
    pub fn new(message: impl Into<String>, sql: Option<String>) -> Self {
        Self {
            message: message.into(),
            sql,
        }
    }

    pub fn from_error(err: &QueryGraphError, sql: Option<&str>) -> Self {
        Self::new(err.to_string(), sql.map(str::to_string))
    }
}
