//! Per-workflow event journal

use crate::{now_millis, WorkflowEvent, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Append-only history of what happened to each workflow.
///
/// Sequence numbers are global and strictly increasing, so entries of
/// different workflows can be interleaved back into one timeline.
pub trait WorkflowJournal: Send + Sync + 'static {
    /// Returns the sequence number assigned to the entry
    fn append(&self, workflow_id: WorkflowId, event: WorkflowEvent) -> Result<u64, JournalError>;
    /// Entries of `workflow_id`, oldest first
    fn read(&self, workflow_id: WorkflowId) -> Result<Vec<JournalEntry>, JournalError>;
    /// Every workflow with at least one entry
    fn list_workflows(&self) -> Result<Vec<WorkflowId>, JournalError>;
}

/// One journaled event
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Global, strictly increasing
    pub sequence: u64,
    /// Wall clock at append time
    pub recorded_at_millis: u64,
    /// What happened
    pub event: WorkflowEvent,
}

/// Journal failure
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// Backing storage failed
    #[error("journal storage error: {0}")]
    Storage(Box<str>),
    /// Nothing was ever journaled for the workflow
    #[error("no journal for workflow {0}")]
    NotFound(WorkflowId),
}

fn storage<E: std::fmt::Display>(e: E) -> JournalError {
    JournalError::Storage(e.to_string().into())
}

/// Journal kept in process memory
pub struct InMemoryJournal {
    streams: RwLock<HashMap<WorkflowId, Vec<JournalEntry>>>,
    next_sequence: AtomicU64,
}

impl InMemoryJournal {
    /// Empty journal
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            next_sequence: AtomicU64::new(1),
        }
    }
}

impl Default for InMemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowJournal for InMemoryJournal {
    fn append(&self, workflow_id: WorkflowId, event: WorkflowEvent) -> Result<u64, JournalError> {
        let mut streams = self.streams.write().map_err(storage)?;
        // Taken under the write lock so each stream stays in sequence order
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        streams.entry(workflow_id).or_default().push(JournalEntry {
            sequence,
            recorded_at_millis: now_millis(),
            event,
        });
        Ok(sequence)
    }

    fn read(&self, workflow_id: WorkflowId) -> Result<Vec<JournalEntry>, JournalError> {
        self.streams
            .read()
            .map_err(storage)?
            .get(&workflow_id)
            .cloned()
            .ok_or(JournalError::NotFound(workflow_id))
    }

    fn list_workflows(&self) -> Result<Vec<WorkflowId>, JournalError> {
        Ok(self.streams.read().map_err(storage)?.keys().copied().collect())
    }
}
