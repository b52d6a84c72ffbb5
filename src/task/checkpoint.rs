//! Checkpoint persistence.
//!
//! A checkpoint is a point-in-time snapshot of a task context, stored as one
//! JSON document per checkpoint (`{checkpoint_id}.json`) under a root
//! directory. Every write and read is independent; there is no cross-checkpoint
//! transaction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::error::CheckpointError;

/// Current on-disk document version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// A persisted snapshot of a task context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointData {
    pub checkpoint_id: String,
    pub task_id: String,
    pub state_data: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    CHECKPOINT_VERSION
}

/// Backend-agnostic checkpoint storage.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist `state` for `task_id` and return the generated checkpoint id.
    async fn create(&self, task_id: &str, state: serde_json::Value)
    -> Result<String, CheckpointError>;

    /// Load the state stored under `checkpoint_id`.
    async fn restore(&self, checkpoint_id: &str) -> Result<serde_json::Value, CheckpointError>;

    /// All checkpoints for `task_id`, newest first.
    async fn list(&self, task_id: &str) -> Result<Vec<CheckpointData>, CheckpointError>;

    /// Delete a checkpoint. Returns `false` if it did not exist.
    async fn delete(&self, checkpoint_id: &str) -> Result<bool, CheckpointError>;

    /// Keep the `keep` most recent checkpoints of `task_id`, deleting the rest.
    /// Returns the number deleted.
    async fn cleanup_old_checkpoints(
        &self,
        task_id: &str,
        keep: usize,
    ) -> Result<usize, CheckpointError> {
        if task_id.is_empty() {
            return Err(CheckpointError::InvalidArgument(
                "task_id cannot be empty".to_string(),
            ));
        }

        let checkpoints = self.list(task_id).await?;
        if checkpoints.len() <= keep {
            return Ok(0);
        }

        let mut deleted = 0;
        for checkpoint in &checkpoints[keep..] {
            match self.delete(&checkpoint.checkpoint_id).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        checkpoint_id = %checkpoint.checkpoint_id,
                        error = %e,
                        "Failed to delete old checkpoint"
                    );
                }
            }
        }

        tracing::info!(task_id = %task_id, deleted, "Cleaned up old checkpoints");
        Ok(deleted)
    }
}

/// File-backed checkpoint store.
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    /// Create a store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, checkpoint_id: &str) -> Result<PathBuf, CheckpointError> {
        validate_id(checkpoint_id)?;
        Ok(self.root.join(format!("{checkpoint_id}.json")))
    }

    async fn read_document(path: &Path) -> Result<CheckpointData, CheckpointError> {
        let raw = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&raw)?)
    }
}

fn validate_id(checkpoint_id: &str) -> Result<(), CheckpointError> {
    if checkpoint_id.is_empty() {
        return Err(CheckpointError::InvalidArgument(
            "checkpoint_id cannot be empty".to_string(),
        ));
    }
    if checkpoint_id.contains(['/', '\\']) || checkpoint_id.contains("..") {
        return Err(CheckpointError::InvalidArgument(format!(
            "invalid checkpoint_id: {checkpoint_id}"
        )));
    }
    Ok(())
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn create(
        &self,
        task_id: &str,
        state: serde_json::Value,
    ) -> Result<String, CheckpointError> {
        if task_id.is_empty() {
            return Err(CheckpointError::InvalidArgument(
                "task_id cannot be empty".to_string(),
            ));
        }
        match state.as_object() {
            Some(map) if !map.is_empty() => {}
            _ => {
                return Err(CheckpointError::InvalidArgument(
                    "state_data must be a non-empty object".to_string(),
                ));
            }
        }

        let checkpoint_id = Uuid::new_v4().to_string();
        let document = CheckpointData {
            checkpoint_id: checkpoint_id.clone(),
            task_id: task_id.to_string(),
            state_data: state,
            metadata: HashMap::from([(
                "created_by".to_string(),
                serde_json::Value::from("FileCheckpointStore"),
            )]),
            created_at: Utc::now(),
            version: CHECKPOINT_VERSION,
        };

        fs::create_dir_all(&self.root).await?;
        let path = self.path_for(&checkpoint_id)?;
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(&document)?;
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &path).await?;

        tracing::info!(task_id = %task_id, checkpoint_id = %checkpoint_id, "Checkpoint created");
        Ok(checkpoint_id)
    }

    async fn restore(&self, checkpoint_id: &str) -> Result<serde_json::Value, CheckpointError> {
        let path = self.path_for(checkpoint_id)?;
        if !fs::try_exists(&path).await? {
            return Err(CheckpointError::NotFound {
                id: checkpoint_id.to_string(),
            });
        }

        let document = Self::read_document(&path).await?;
        tracing::info!(checkpoint_id = %checkpoint_id, "Checkpoint restored");
        Ok(document.state_data)
    }

    async fn list(&self, task_id: &str) -> Result<Vec<CheckpointData>, CheckpointError> {
        if task_id.is_empty() {
            return Err(CheckpointError::InvalidArgument(
                "task_id cannot be empty".to_string(),
            ));
        }
        if !fs::try_exists(&self.root).await? {
            return Ok(Vec::new());
        }

        let mut checkpoints = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_document(&path).await {
                Ok(doc) if doc.task_id == task_id => checkpoints.push(doc),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint");
                }
            }
        }

        checkpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(checkpoints)
    }

    async fn delete(&self, checkpoint_id: &str) -> Result<bool, CheckpointError> {
        let path = self.path_for(checkpoint_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(checkpoint_id = %checkpoint_id, "Checkpoint deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(checkpoint_id = %checkpoint_id, "Checkpoint file not found");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
