//! Schema Snapshot Store
//!
//! Durable state for the monitor: the latest snapshot and the bounded change
//! history, each as a JSON document in the state directory. Writes go to a
//! temporary file first and are renamed into place.

use crate::error::AppResult;
use crate::snapshot::change::SchemaChange;
use crate::snapshot::model::SchemaSnapshot;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub const CURRENT_SNAPSHOT_FILE: &str = "current_snapshot.json";
pub const CHANGE_HISTORY_FILE: &str = "change_history.json";

/// File-backed store for snapshot and change history
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(CURRENT_SNAPSHOT_FILE)
    }

    pub fn history_path(&self) -> PathBuf {
        self.dir.join(CHANGE_HISTORY_FILE)
    }

    /// Load the persisted current snapshot, if any
    pub async fn load_current(&self) -> AppResult<Option<SchemaSnapshot>> {
        read_json(&self.snapshot_path()).await
    }

    /// Persist the current snapshot
    pub async fn save_current(&self, snapshot: &SchemaSnapshot) -> AppResult<()> {
        write_json(&self.snapshot_path(), snapshot).await?;
        debug!(
            hash = %snapshot.schema_hash,
            tables = snapshot.tables.len(),
            "Saved current snapshot"
        );
        Ok(())
    }

    /// Load the persisted change history (oldest first)
    pub async fn load_history(&self) -> AppResult<Vec<SchemaChange>> {
        Ok(read_json(&self.history_path()).await?.unwrap_or_default())
    }

    /// Persist the change history (oldest first)
    pub async fn save_history(&self, history: &[SchemaChange]) -> AppResult<()> {
        write_json(&self.history_path(), &history).await
    }
}

/// Read a JSON document; a missing file is `None`
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> AppResult<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write a JSON document via temp file + rename
pub(crate) async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
