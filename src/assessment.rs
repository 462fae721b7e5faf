use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Local;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::detection::Detection;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("table {0} unavailable")]
    Unavailable(String),
}

/// One row of the assessment table, keyed by `assessmentId`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AssessmentRecord {
    #[serde(rename = "assessmentId")]
    pub assessment_id: String,
    pub timestamp: String,
    /// JSON array of [`Detection`]s exactly as returned to the caller.
    pub results_json: String,
}

impl AssessmentRecord {
    pub fn new(assessment_id: Uuid, detections: &[Detection]) -> Result<Self, StoreError> {
        Ok(Self {
            assessment_id: assessment_id.to_string(),
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            results_json: serde_json::to_string(detections)?,
        })
    }

    pub fn detections(&self) -> Result<Vec<Detection>, StoreError> {
        Ok(serde_json::from_str(&self.results_json)?)
    }
}

#[async_trait]
pub trait AssessmentStore: Send + Sync {
    /// Writes the whole record or nothing.
    async fn put(&self, record: &AssessmentRecord) -> Result<(), StoreError>;
}

/// Directory-backed table: `<data_dir>/<table>/<assessmentId>.json`.
pub struct FsTable {
    dir: PathBuf,
}

impl FsTable {
    pub async fn open(data_dir: impl Into<PathBuf>, table: &str) -> Result<Self, StoreError> {
        let dir = data_dir.into().join(table);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Opens a table `open` already created, for read-only lookups.
    pub fn existing(data_dir: impl Into<PathBuf>, table: &str) -> Result<Self, StoreError> {
        let dir = data_dir.into().join(table);
        if !dir.is_dir() {
            return Err(StoreError::Unavailable(table.to_string()));
        }
        Ok(Self { dir })
    }

    fn item_path(&self, assessment_id: &str) -> PathBuf {
        self.dir.join(format!("{assessment_id}.json"))
    }

    pub async fn get(&self, assessment_id: &str) -> Result<Option<AssessmentRecord>, StoreError> {
        match tokio::fs::read(self.item_path(assessment_id)).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl AssessmentStore for FsTable {
    async fn put(&self, record: &AssessmentRecord) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(record)?;
        let path = self.item_path(&record.assessment_id);
        let partial = path.with_extension("json.part");
        tokio::fs::write(&partial, raw).await?;
        tokio::fs::rename(&partial, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct MemoryTable {
    items: std::sync::Mutex<indexmap::IndexMap<String, AssessmentRecord>>,
}

#[cfg(test)]
impl MemoryTable {
    pub fn get(&self, assessment_id: &str) -> Option<AssessmentRecord> {
        self.items.lock().ok()?.get(assessment_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|x| x.len()).unwrap_or_default()
    }
}

#[cfg(test)]
#[async_trait]
impl AssessmentStore for MemoryTable {
    async fn put(&self, record: &AssessmentRecord) -> Result<(), StoreError> {
        self.items
            .lock()
            .map_err(|_| StoreError::Unavailable("memory".to_string()))?
            .insert(record.assessment_id.clone(), record.clone());
        Ok(())
    }
}
