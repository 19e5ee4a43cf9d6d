//! Workflow statistics

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the orchestrator and the status poller
pub struct WorkflowStats {
    /// Workflows created
    pub workflows_started: AtomicU64,
    /// Workflows that persisted their record
    pub workflows_completed: AtomicU64,
    /// Workflows that ended as failed
    pub workflows_failed: AtomicU64,
    /// Workflows abandoned by a caller
    pub workflows_abandoned: AtomicU64,
    /// Stage failures of any kind
    pub stage_failures: AtomicU64,
    /// Confirmed debits
    pub charges: AtomicU64,
    /// Compensating credits
    pub reversals: AtomicU64,
    /// Order calls with an unknown outcome
    pub unknown_outcomes: AtomicU64,
    /// Partner status fetches
    pub status_fetches: AtomicU64,
    /// Subscriptions that ran out of attempts
    pub poll_timeouts: AtomicU64,
    /// Delivery attempts that failed
    pub deliveries_failed: AtomicU64,
}

impl WorkflowStats {
    /// All counters at zero
    pub fn new() -> Self {
        Self {
            workflows_started: AtomicU64::new(0),
            workflows_completed: AtomicU64::new(0),
            workflows_failed: AtomicU64::new(0),
            workflows_abandoned: AtomicU64::new(0),
            stage_failures: AtomicU64::new(0),
            charges: AtomicU64::new(0),
            reversals: AtomicU64::new(0),
            unknown_outcomes: AtomicU64::new(0),
            status_fetches: AtomicU64::new(0),
            poll_timeouts: AtomicU64::new(0),
            deliveries_failed: AtomicU64::new(0),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> WorkflowStatsSnapshot {
        WorkflowStatsSnapshot {
            workflows_started: self.workflows_started.load(Ordering::Relaxed),
            workflows_completed: self.workflows_completed.load(Ordering::Relaxed),
            workflows_failed: self.workflows_failed.load(Ordering::Relaxed),
            workflows_abandoned: self.workflows_abandoned.load(Ordering::Relaxed),
            stage_failures: self.stage_failures.load(Ordering::Relaxed),
            charges: self.charges.load(Ordering::Relaxed),
            reversals: self.reversals.load(Ordering::Relaxed),
            unknown_outcomes: self.unknown_outcomes.load(Ordering::Relaxed),
            status_fetches: self.status_fetches.load(Ordering::Relaxed),
            poll_timeouts: self.poll_timeouts.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for WorkflowStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable copy of [`WorkflowStats`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WorkflowStatsSnapshot {
    /// Workflows created
    pub workflows_started: u64,
    /// Workflows that persisted their record
    pub workflows_completed: u64,
    /// Workflows that ended as failed
    pub workflows_failed: u64,
    /// Workflows abandoned by a caller
    pub workflows_abandoned: u64,
    /// Stage failures of any kind
    pub stage_failures: u64,
    /// Confirmed debits
    pub charges: u64,
    /// Compensating credits
    pub reversals: u64,
    /// Order calls with an unknown outcome
    pub unknown_outcomes: u64,
    /// Partner status fetches
    pub status_fetches: u64,
    /// Subscriptions that ran out of attempts
    pub poll_timeouts: u64,
    /// Delivery attempts that failed
    pub deliveries_failed: u64,
}
