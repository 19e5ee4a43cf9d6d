//! Idempotency key generation for side-effecting calls

use crate::WorkflowId;
use serde::{Deserialize, Serialize};

/// Idempotency key for deduplicating side effects
///
/// Keys are derived from the workflow id only, so a resumed workflow replays
/// the exact key it used before the interruption.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(pub Box<str>);

impl IdempotencyKey {
    /// Key for the balance debit of a workflow
    pub fn for_charge(workflow_id: WorkflowId) -> Self {
        Self(format!("wf:{}:charge", workflow_id.0).into_boxed_str())
    }

    /// Key for the compensating credit that reverses a workflow's charge
    pub fn for_reversal(workflow_id: WorkflowId) -> Self {
        Self(format!("wf:{}:reversal", workflow_id.0).into_boxed_str())
    }

    /// Key sent with the partner order; also used to reconcile an unknown outcome
    pub fn for_order(workflow_id: WorkflowId) -> Self {
        Self(format!("wf:{}:order", workflow_id.0).into_boxed_str())
    }

    /// Key for the composite record upsert
    pub fn for_record(workflow_id: WorkflowId) -> Self {
        Self(format!("wf:{}:record", workflow_id.0).into_boxed_str())
    }

    /// Get the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
