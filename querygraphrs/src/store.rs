use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use glob::glob;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use crate::error::{QueryGraphError, Result};
use crate::storage::StoredModel;
use crate::warehouse::ConnectionRecord;

/// Persistence collaborator: stored models and warehouse connections.
#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn load_model(&self, model_id: &str) -> Result<StoredModel>;

    /// Replace the stored model wholesale; previous tables and edges are
    /// discarded.
    async fn save_model(&self, model: StoredModel) -> Result<()>;

    async fn connection(&self, connection_id: &str) -> Result<ConnectionRecord>;
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    models: RwLock<HashMap<String, StoredModel>>,
    connections: RwLock<HashMap<String, ConnectionRecord>>,
}

const EXTENSIONS: [&str; 3] = ["json", "yml", "yaml"];

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(models: Vec<StoredModel>, connections: Vec<ConnectionRecord>) -> Self {
        Self {
            models: RwLock::new(models.into_iter().map(|m| (m.id.clone(), m)).collect()),
            connections: RwLock::new(
                connections
                    .into_iter()
                    .map(|c| (c.id.clone(), c))
                    .collect(),
            ),
        }
    }

    /// Load `models/*` and `connections/*` (`.json`, `.yml`, `.yaml`) under
    /// `root`. Missing subdirectories are treated as empty.
    pub fn load_from_dir<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(QueryGraphError::Validation(format!(
                "store directory not found: {}",
                root.display()
            )));
        }
        let models: Vec<StoredModel> = load_records(root.join("models"))?;
        let connections: Vec<ConnectionRecord> = load_records(root.join("connections"))?;
        tracing::info!(
            root = %root.display(),
            models = models.len(),
            connections = connections.len(),
            "loaded store from directory"
        );
        Ok(Self::from_parts(models, connections))
    }
}

fn load_records<T: DeserializeOwned>(dir: PathBuf) -> Result<Vec<T>> {
    if !dir.is_dir() {
        tracing::debug!(dir = %dir.display(), "store directory missing, skipping");
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    for ext in EXTENSIONS {
        for entry in glob(&format!("{}/*.{ext}", dir.display()))
            .map_err(|e| QueryGraphError::Other(e.into()))?
            .flatten()
        {
            records.push(load_record_file(&entry)?);
        }
    }
    Ok(records)
}

fn load_record_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(serde_json::from_str(&contents)?),
        _ => Ok(serde_yaml::from_str(&contents)?),
    }
}

#[async_trait]
impl ModelStore for InMemoryStore {
    async fn load_model(&self, model_id: &str) -> Result<StoredModel> {
        self.models
            .read()
            .await
            .get(model_id)
            .cloned()
            .ok_or_else(|| QueryGraphError::Validation(format!("unknown model {model_id}")))
    }

    async fn save_model(&self, model: StoredModel) -> Result<()> {
        let mut models = self.models.write().await;
        let previous = models.remove(&model.id);
        tracing::debug!(
            model_id = %model.id,
            replaced = previous.is_some(),
            tables = model.tables.len(),
            relationships = model.relationships.len(),
            "saved model"
        );
        models.insert(model.id.clone(), model);
        Ok(())
    }

    async fn connection(&self, connection_id: &str) -> Result<ConnectionRecord> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .cloned()
            .ok_or_else(|| QueryGraphError::Validation(format!("unknown connection {connection_id}")))
    }
}
