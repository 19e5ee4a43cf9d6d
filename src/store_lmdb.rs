//! LMDB-backed workflow store

use crate::{AssignmentRecord, PersistedRecord, StoreError, WorkflowId, WorkflowInstance, WorkflowStore};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

const DEFAULT_MAP_SIZE: usize = 64 * 1024 * 1024;

#[derive(Serialize, Deserialize)]
struct CheckpointRow {
    archived: bool,
    instance: WorkflowInstance,
}

/// Checkpoints and records in two named LMDB databases, values as JSON
pub struct LmdbWorkflowStore {
    env: Env,
    checkpoints: Database<Str, Bytes>,
    records: Database<Str, Bytes>,
}

fn storage(e: heed::Error) -> StoreError {
    StoreError::Storage(e.to_string().into())
}

impl LmdbWorkflowStore {
    /// Open (or create) a store rooted at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_map_size(path, DEFAULT_MAP_SIZE)
    }

    /// Like [`Self::open`] with an explicit LMDB map size
    pub fn open_with_map_size(path: impl AsRef<Path>, map_size: usize) -> Result<Self, StoreError> {
        std::fs::create_dir_all(path.as_ref())
            .map_err(|e| StoreError::Storage(e.to_string().into()))?;

        // SAFETY: the environment is opened once per path by this process
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(2)
                .open(path.as_ref())
                .map_err(storage)?
        };

        let mut wtxn = env.write_txn().map_err(storage)?;
        let checkpoints = env
            .create_database(&mut wtxn, Some("checkpoints"))
            .map_err(storage)?;
        let records = env
            .create_database(&mut wtxn, Some("records"))
            .map_err(storage)?;
        wtxn.commit().map_err(storage)?;

        Ok(Self {
            env,
            checkpoints,
            records,
        })
    }

    fn read_checkpoint(&self, key: &str) -> Result<Option<CheckpointRow>, StoreError> {
        let rtxn = self.env.read_txn().map_err(storage)?;
        match self.checkpoints.get(&rtxn, key).map_err(storage)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    fn write_checkpoint(&self, key: &str, row: &CheckpointRow) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(row)?;
        let mut wtxn = self.env.write_txn().map_err(storage)?;
        self.checkpoints
            .put(&mut wtxn, key, &bytes)
            .map_err(storage)?;
        wtxn.commit().map_err(storage)
    }
}

impl WorkflowStore for LmdbWorkflowStore {
    fn save_checkpoint(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        let key = instance.id().0.to_string();
        let archived = self
            .read_checkpoint(&key)?
            .is_some_and(|row| row.archived);
        self.write_checkpoint(
            &key,
            &CheckpointRow {
                archived,
                instance: instance.clone(),
            },
        )
    }

    fn load_checkpoint(&self, id: WorkflowId) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(self
            .read_checkpoint(&id.0.to_string())?
            .map(|row| row.instance))
    }

    fn list_checkpoints(&self) -> Result<Vec<WorkflowId>, StoreError> {
        let rtxn = self.env.read_txn().map_err(storage)?;
        let mut ids = Vec::new();
        for entry in self.checkpoints.iter(&rtxn).map_err(storage)? {
            let (key, bytes) = entry.map_err(storage)?;
            let row: CheckpointRow = serde_json::from_slice(bytes)?;
            if row.archived {
                continue;
            }
            let uuid = Uuid::parse_str(key)
                .map_err(|e| StoreError::Storage(format!("bad checkpoint key {key}: {e}").into()))?;
            ids.push(WorkflowId(uuid));
        }
        Ok(ids)
    }

    fn archive_checkpoint(&self, id: WorkflowId) -> Result<(), StoreError> {
        let key = id.0.to_string();
        if let Some(mut row) = self.read_checkpoint(&key)? {
            row.archived = true;
            self.write_checkpoint(&key, &row)?;
        }
        Ok(())
    }

    fn upsert_record(&self, record: &AssignmentRecord) -> Result<PersistedRecord, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(storage)?;
        let existing: Option<AssignmentRecord> = match self
            .records
            .get(&wtxn, &record.record_id)
            .map_err(storage)?
        {
            Some(bytes) => Some(serde_json::from_slice(bytes)?),
            None => None,
        };

        let created = existing.is_none();
        let row = match existing {
            Some(previous) => AssignmentRecord {
                created_at: previous.created_at,
                ..record.clone()
            },
            None => record.clone(),
        };
        let bytes = serde_json::to_vec(&row)?;
        self.records
            .put(&mut wtxn, &record.record_id, &bytes)
            .map_err(storage)?;
        wtxn.commit().map_err(storage)?;

        Ok(PersistedRecord {
            record_id: record.record_id.clone(),
            created,
        })
    }

    fn get_record(&self, record_id: &str) -> Result<Option<AssignmentRecord>, StoreError> {
        let rtxn = self.env.read_txn().map_err(storage)?;
        match self.records.get(&rtxn, record_id).map_err(storage)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }
}
