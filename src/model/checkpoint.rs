//! Persistence of model definitions and running-model snapshots.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Context;
use rusqlite::{params, OptionalExtension};

use crate::model::{CheckpointError, ModelDefinition, ModelSnapshot};
use crate::storage::Pool;

/// Keyed store of per-model definitions and checkpoints.
pub trait CheckpointStore: Send + Sync {
    /// Load the latest snapshot, or `ModelNotFound`.
    fn load(&self, model_id: &str) -> Result<ModelSnapshot, CheckpointError>;

    fn save(&self, model_id: &str, snapshot: &ModelSnapshot) -> Result<(), CheckpointError>;

    /// Store the definition, replacing any previous one.
    fn define(&self, model_id: &str, definition: &ModelDefinition) -> Result<(), CheckpointError>;

    fn load_definition(&self, model_id: &str) -> Result<Option<ModelDefinition>, CheckpointError>;

    /// Drop the snapshot only, keeping the definition.
    fn discard_snapshot(&self, model_id: &str) -> Result<(), CheckpointError>;

    /// Remove snapshot and definition. Removing an unknown model is a no-op.
    fn remove(&self, model_id: &str) -> Result<(), CheckpointError>;
}

#[derive(Debug, Default)]
struct Entry {
    definition: Option<ModelDefinition>,
    snapshot: Option<ModelSnapshot>,
}

/// In-process checkpoint table.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> Result<T, CheckpointError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("checkpoint table lock poisoned"))?;
        Ok(f(&mut entries))
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, model_id: &str) -> Result<ModelSnapshot, CheckpointError> {
        self.with_entries(|e| e.get(model_id).and_then(|entry| entry.snapshot.clone()))?
            .ok_or_else(|| CheckpointError::ModelNotFound {
                model_id: model_id.to_string(),
            })
    }

    fn save(&self, model_id: &str, snapshot: &ModelSnapshot) -> Result<(), CheckpointError> {
        self.with_entries(|e| {
            e.entry(model_id.to_string()).or_default().snapshot = Some(snapshot.clone());
        })
    }

    fn define(&self, model_id: &str, definition: &ModelDefinition) -> Result<(), CheckpointError> {
        self.with_entries(|e| {
            e.entry(model_id.to_string()).or_default().definition = Some(definition.clone());
        })
    }

    fn load_definition(&self, model_id: &str) -> Result<Option<ModelDefinition>, CheckpointError> {
        self.with_entries(|e| e.get(model_id).and_then(|entry| entry.definition.clone()))
    }

    fn discard_snapshot(&self, model_id: &str) -> Result<(), CheckpointError> {
        self.with_entries(|e| {
            if let Some(entry) = e.get_mut(model_id) {
                entry.snapshot = None;
            }
        })
    }

    fn remove(&self, model_id: &str) -> Result<(), CheckpointError> {
        self.with_entries(|e| {
            e.remove(model_id);
        })
    }
}

/// Checkpoints kept in the engine's SQLite database.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    pool: Pool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn load(&self, model_id: &str) -> Result<ModelSnapshot, CheckpointError> {
        let conn = self.pool.get().context("failed to get DB connection")?;
        let json: Option<String> = conn
            .query_row(
                "SELECT snapshot_json FROM model_checkpoints WHERE model_id = ?1",
                params![model_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query model checkpoint")?;

        let json = json.ok_or_else(|| CheckpointError::ModelNotFound {
            model_id: model_id.to_string(),
        })?;
        let snapshot = serde_json::from_str(&json)
            .with_context(|| format!("corrupt checkpoint for model {}", model_id))?;
        Ok(snapshot)
    }

    fn save(&self, model_id: &str, snapshot: &ModelSnapshot) -> Result<(), CheckpointError> {
        let conn = self.pool.get().context("failed to get DB connection")?;
        let json = serde_json::to_string(snapshot).context("failed to serialize snapshot")?;
        conn.execute(
            "INSERT INTO model_checkpoints (model_id, snapshot_json, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(model_id) DO UPDATE SET
                snapshot_json = excluded.snapshot_json,
                updated_at = excluded.updated_at",
            params![model_id, json],
        )
        .context("failed to save model checkpoint")?;
        Ok(())
    }

    fn define(&self, model_id: &str, definition: &ModelDefinition) -> Result<(), CheckpointError> {
        let conn = self.pool.get().context("failed to get DB connection")?;
        let json = serde_json::to_string(definition).context("failed to serialize definition")?;
        conn.execute(
            "INSERT INTO model_definitions (model_id, definition_json, created_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(model_id) DO UPDATE SET
                definition_json = excluded.definition_json,
                created_at = excluded.created_at",
            params![model_id, json],
        )
        .context("failed to save model definition")?;
        Ok(())
    }

    fn load_definition(&self, model_id: &str) -> Result<Option<ModelDefinition>, CheckpointError> {
        let conn = self.pool.get().context("failed to get DB connection")?;
        let json: Option<String> = conn
            .query_row(
                "SELECT definition_json FROM model_definitions WHERE model_id = ?1",
                params![model_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query model definition")?;

        match json {
            Some(json) => {
                let definition = serde_json::from_str(&json)
                    .with_context(|| format!("corrupt definition for model {}", model_id))?;
                Ok(Some(definition))
            }
            None => Ok(None),
        }
    }

    fn discard_snapshot(&self, model_id: &str) -> Result<(), CheckpointError> {
        let conn = self.pool.get().context("failed to get DB connection")?;
        conn.execute(
            "DELETE FROM model_checkpoints WHERE model_id = ?1",
            params![model_id],
        )
        .context("failed to discard model checkpoint")?;
        Ok(())
    }

    fn remove(&self, model_id: &str) -> Result<(), CheckpointError> {
        let mut conn = self.pool.get().context("failed to get DB connection")?;
        let tx = conn.transaction().context("failed to begin transaction")?;
        tx.execute(
            "DELETE FROM model_checkpoints WHERE model_id = ?1",
            params![model_id],
        )
        .context("failed to delete model checkpoint")?;
        tx.execute(
            "DELETE FROM model_definitions WHERE model_id = ?1",
            params![model_id],
        )
        .context("failed to delete model definition")?;
        tx.commit().context("failed to commit model removal")?;
        Ok(())
    }
}
