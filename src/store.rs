//! Workflow checkpoints and assignment records

use crate::{
    BundleId, ClientRef, JobRef, JobStatus, ResellerId, TransitionError, WorkflowId,
    WorkflowInstance,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// Durable state behind the orchestrator.
///
/// Checkpoints are full snapshots of a [`WorkflowInstance`], written after
/// every transition. Archived checkpoints stay loadable but are no longer
/// listed for recovery.
pub trait WorkflowStore: Send + Sync + 'static {
    /// Overwrite the checkpoint of `instance`
    fn save_checkpoint(&self, instance: &WorkflowInstance) -> Result<(), StoreError>;
    /// Checkpoint of `id`, archived or not
    fn load_checkpoint(&self, id: WorkflowId) -> Result<Option<WorkflowInstance>, StoreError>;
    /// Ids of checkpoints that are not archived
    fn list_checkpoints(&self) -> Result<Vec<WorkflowId>, StoreError>;
    /// Exclude `id` from recovery
    fn archive_checkpoint(&self, id: WorkflowId) -> Result<(), StoreError>;

    /// Insert or update by `record_id`
    fn upsert_record(&self, record: &AssignmentRecord) -> Result<PersistedRecord, StoreError>;
    /// Record by id
    fn get_record(&self, record_id: &str) -> Result<Option<AssignmentRecord>, StoreError>;
}

/// Store failure
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend failed
    #[error("Storage error: {0}")]
    Storage(Box<str>),
    /// Value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result of an upsert
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedRecord {
    /// Id of the written record
    pub record_id: Box<str>,
    /// `false` when an existing record was updated
    pub created: bool,
}

/// The business record of a completed assignment
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    /// Stable id derived from the workflow
    pub record_id: Box<str>,
    /// Workflow that produced the record
    pub workflow_id: WorkflowId,
    /// Reseller that paid
    pub reseller: ResellerId,
    /// Client holding the eSIM
    pub client_ref: ClientRef,
    /// Assigned bundle
    pub bundle_id: BundleId,
    /// Partner job reference
    pub job_ref: JobRef,
    /// eSIM identifier
    pub iccid: Box<str>,
    /// Job status at persistence
    pub status: JobStatus,
    /// Ledger reference of the charge
    pub charge_ref: Box<str>,
    /// Amount charged
    pub amount: Decimal,
    /// Currency of `amount`
    pub currency: Box<str>,
    /// Credentials reached the client
    pub delivered: bool,
    /// When the eSIM stops working
    pub expires_at: DateTime<Utc>,
    /// First write
    pub created_at: DateTime<Utc>,
    /// Last write
    pub updated_at: DateTime<Utc>,
}

impl AssignmentRecord {
    /// Record id is derived from the workflow, so re-persisting updates in place
    pub fn record_id_for(workflow_id: WorkflowId) -> Box<str> {
        format!("asg-{}", workflow_id.0).into()
    }

    /// Build the record from a workflow's artifacts
    pub fn from_instance(
        instance: &WorkflowInstance,
        now: DateTime<Utc>,
    ) -> Result<Self, TransitionError> {
        let missing = |what: &str| TransitionError::MissingArtifact(what.into());
        let client = instance.client().ok_or_else(|| missing("client_ref"))?;
        let bundle = instance
            .selected_bundle()
            .ok_or_else(|| missing("selected_bundle"))?;
        let charge = instance
            .charge_record()
            .ok_or_else(|| missing("charge_record"))?;
        let job = instance
            .provisioning_job()
            .ok_or_else(|| missing("provisioning_job"))?;

        Ok(Self {
            record_id: Self::record_id_for(instance.id()),
            workflow_id: instance.id(),
            reseller: instance.reseller().clone(),
            client_ref: client.client_ref.clone(),
            bundle_id: bundle.id.clone(),
            job_ref: job.job_ref.clone(),
            iccid: job.iccid.clone(),
            status: job.status.clone(),
            charge_ref: charge.charge_ref.clone(),
            amount: charge.amount,
            currency: charge.currency.clone(),
            delivered: !instance.delivery_pending(),
            expires_at: job.expires_at,
            created_at: now,
            updated_at: now,
        })
    }
}

struct StoredCheckpoint {
    instance: WorkflowInstance,
    archived: bool,
}

/// In-memory store for testing
pub struct InMemoryWorkflowStore {
    checkpoints: RwLock<HashMap<WorkflowId, StoredCheckpoint>>,
    records: RwLock<HashMap<Box<str>, AssignmentRecord>>,
    fail_records: AtomicBool,
}

impl InMemoryWorkflowStore {
    /// Empty store
    pub fn new() -> Self {
        Self {
            checkpoints: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
            fail_records: AtomicBool::new(false),
        }
    }

    /// Make `upsert_record` fail until switched off
    pub fn set_records_failing(&self, failing: bool) {
        self.fail_records.store(failing, Ordering::SeqCst);
    }

    /// Number of assignment records
    pub fn record_count(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Storage(e.to_string().into())
}

impl WorkflowStore for InMemoryWorkflowStore {
    fn save_checkpoint(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        let mut data = self.checkpoints.write().map_err(poisoned)?;
        let archived = data.get(&instance.id()).is_some_and(|c| c.archived);
        data.insert(
            instance.id(),
            StoredCheckpoint {
                instance: instance.clone(),
                archived,
            },
        );
        Ok(())
    }

    fn load_checkpoint(&self, id: WorkflowId) -> Result<Option<WorkflowInstance>, StoreError> {
        let data = self.checkpoints.read().map_err(poisoned)?;
        Ok(data.get(&id).map(|c| c.instance.clone()))
    }

    fn list_checkpoints(&self) -> Result<Vec<WorkflowId>, StoreError> {
        let data = self.checkpoints.read().map_err(poisoned)?;
        Ok(data
            .iter()
            .filter(|(_, c)| !c.archived)
            .map(|(id, _)| *id)
            .collect())
    }

    fn archive_checkpoint(&self, id: WorkflowId) -> Result<(), StoreError> {
        let mut data = self.checkpoints.write().map_err(poisoned)?;
        if let Some(checkpoint) = data.get_mut(&id) {
            checkpoint.archived = true;
        }
        Ok(())
    }

    fn upsert_record(&self, record: &AssignmentRecord) -> Result<PersistedRecord, StoreError> {
        if self.fail_records.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("record table unavailable".into()));
        }
        let mut data = self.records.write().map_err(poisoned)?;
        let created = match data.get_mut(&record.record_id) {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = AssignmentRecord {
                    created_at,
                    ..record.clone()
                };
                false
            }
            None => {
                data.insert(record.record_id.clone(), record.clone());
                true
            }
        };
        Ok(PersistedRecord {
            record_id: record.record_id.clone(),
            created,
        })
    }

    fn get_record(&self, record_id: &str) -> Result<Option<AssignmentRecord>, StoreError> {
        let data = self.records.read().map_err(poisoned)?;
        Ok(data.get(record_id).cloned())
    }
}
