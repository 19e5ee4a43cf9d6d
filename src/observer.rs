//! Workflow observer trait

use crate::{JobRef, JobStatus, ResellerId, Stage, WorkflowError, WorkflowId};
use rust_decimal::Decimal;

/// Observer trait for external observability
pub trait WorkflowObserver: Send + Sync + 'static {
    /// Called when a workflow is created
    fn on_workflow_started(&self, workflow_id: WorkflowId, reseller: &ResellerId);
    /// Called when a stage succeeds
    fn on_stage_completed(&self, workflow_id: WorkflowId, stage: Stage, duration_millis: u64);
    /// Called when a stage fails
    fn on_stage_failed(&self, workflow_id: WorkflowId, stage: Stage, error: &WorkflowError);
    /// Called when the reseller is debited
    fn on_charged(&self, workflow_id: WorkflowId, amount: Decimal);
    /// Called when a charge is compensated
    fn on_charge_reversed(&self, workflow_id: WorkflowId, amount: Decimal, reason: &str);
    /// Called when the partner job changes status
    fn on_status_changed(&self, workflow_id: WorkflowId, job_ref: &JobRef, status: &JobStatus);
    /// Called when the record is persisted
    fn on_workflow_completed(&self, workflow_id: WorkflowId);
    /// Called when a workflow ends as failed
    fn on_workflow_failed(&self, workflow_id: WorkflowId, reason: &str);
}

/// No-op observer
pub struct NoOpObserver;

impl WorkflowObserver for NoOpObserver {
    fn on_workflow_started(&self, _workflow_id: WorkflowId, _reseller: &ResellerId) {}
    fn on_stage_completed(&self, _workflow_id: WorkflowId, _stage: Stage, _duration_millis: u64) {}
    fn on_stage_failed(&self, _workflow_id: WorkflowId, _stage: Stage, _error: &WorkflowError) {}
    fn on_charged(&self, _workflow_id: WorkflowId, _amount: Decimal) {}
    fn on_charge_reversed(&self, _workflow_id: WorkflowId, _amount: Decimal, _reason: &str) {}
    fn on_status_changed(&self, _workflow_id: WorkflowId, _job_ref: &JobRef, _status: &JobStatus) {}
    fn on_workflow_completed(&self, _workflow_id: WorkflowId) {}
    fn on_workflow_failed(&self, _workflow_id: WorkflowId, _reason: &str) {}
}

/// Tracing-based observer
pub struct TracingObserver;

impl WorkflowObserver for TracingObserver {
    fn on_workflow_started(&self, workflow_id: WorkflowId, reseller: &ResellerId) {
        tracing::info!(workflow_id = %workflow_id, reseller = %reseller, "Workflow started");
    }

    fn on_stage_completed(&self, workflow_id: WorkflowId, stage: Stage, duration_millis: u64) {
        tracing::info!(workflow_id = %workflow_id, stage = ?stage, duration_ms = duration_millis, "Stage completed");
    }

    fn on_stage_failed(&self, workflow_id: WorkflowId, stage: Stage, error: &WorkflowError) {
        tracing::warn!(workflow_id = %workflow_id, stage = ?stage, error = %error, "Stage failed");
    }

    fn on_charged(&self, workflow_id: WorkflowId, amount: Decimal) {
        tracing::info!(workflow_id = %workflow_id, amount = %amount, "Reseller charged");
    }

    fn on_charge_reversed(&self, workflow_id: WorkflowId, amount: Decimal, reason: &str) {
        tracing::warn!(workflow_id = %workflow_id, amount = %amount, reason = %reason, "Charge reversed");
    }

    fn on_status_changed(&self, workflow_id: WorkflowId, job_ref: &JobRef, status: &JobStatus) {
        tracing::debug!(workflow_id = %workflow_id, job_ref = %job_ref, status = %status, "Job status changed");
    }

    fn on_workflow_completed(&self, workflow_id: WorkflowId) {
        tracing::info!(workflow_id = %workflow_id, "Workflow completed");
    }

    fn on_workflow_failed(&self, workflow_id: WorkflowId, reason: &str) {
        tracing::error!(workflow_id = %workflow_id, reason = %reason, "Workflow failed");
    }
}
