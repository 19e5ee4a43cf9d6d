//! Workflow and status events

use serde::{Deserialize, Serialize};
use rust_decimal::Decimal;
use super::{BundleId, ClientRef, JobRef, JobStatus, ResellerId, Stage};

/// Facts recorded in a workflow's journal, in the order they happened
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WorkflowEvent {
    /// Workflow created
    Started {
        /// Reseller the workflow runs for
        reseller: ResellerId,
    },
    /// Intake settled on a client
    ClientResolved {
        /// Client chosen
        client_ref: ClientRef,
        /// Registered by this workflow
        created: bool,
    },
    /// Plan chosen from the catalogue
    BundleSelected {
        /// Chosen bundle
        bundle_id: BundleId,
        /// Base price before markup
        price: Decimal,
    },
    /// Reseller debited
    Charged {
        /// Ledger entry of the debit
        charge_ref: Box<str>,
        /// Amount debited
        amount: Decimal,
    },
    /// Charge compensated by a credit
    ChargeReversed {
        /// Ledger entry of the credit
        reversal_ref: Box<str>,
        /// Amount credited back
        amount: Decimal,
        /// Why the charge was reversed
        reason: Box<str>,
    },
    /// Partner accepted the order
    OrderSubmitted {
        /// Partner job reference
        job_ref: JobRef,
    },
    /// Order call failed in a way that may still have placed the order
    OrderOutcomeUnknown {
        /// What the call failed with
        reason: Box<str>,
    },
    /// Reconciliation lookup answered
    Reconciled {
        /// Whether the partner had the order
        order_found: bool,
    },
    /// Job status changed
    StatusObserved {
        /// Partner job reference
        job_ref: JobRef,
        /// New status
        status: JobStatus,
    },
    /// Credentials reached the client
    Delivered,
    /// Credential delivery failed
    DeliveryFailed {
        /// What the channel failed with
        reason: Box<str>,
    },
    /// Assignment record written
    Persisted {
        /// Id of the record
        record_id: Box<str>,
    },
    /// A stage failed
    StageFailed {
        /// Stage that failed
        stage: Stage,
        /// Rendered error
        error: Box<str>,
    },
    /// Workflow loaded back from its checkpoint
    Resumed {
        /// Stage it was at
        stage: Stage,
    },
    /// Artifacts cleared, back at intake
    Reset,
    /// Caller gave up on the workflow
    Abandoned,
    /// Workflow finished successfully
    Completed,
}

impl WorkflowEvent {
    /// Stable snake_case name of the event
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::ClientResolved { .. } => "client_resolved",
            Self::BundleSelected { .. } => "bundle_selected",
            Self::Charged { .. } => "charged",
            Self::ChargeReversed { .. } => "charge_reversed",
            Self::OrderSubmitted { .. } => "order_submitted",
            Self::OrderOutcomeUnknown { .. } => "order_outcome_unknown",
            Self::Reconciled { .. } => "reconciled",
            Self::StatusObserved { .. } => "status_observed",
            Self::Delivered => "delivered",
            Self::DeliveryFailed { .. } => "delivery_failed",
            Self::Persisted { .. } => "persisted",
            Self::StageFailed { .. } => "stage_failed",
            Self::Resumed { .. } => "resumed",
            Self::Reset => "reset",
            Self::Abandoned => "abandoned",
            Self::Completed => "completed",
        }
    }
}

/// Poller output for one subscription
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StatusEvent {
    /// Fetched status differs from the last one observed
    StatusChanged {
        /// Job polled
        job_ref: JobRef,
        /// Status seen before, if any
        previous: Option<JobStatus>,
        /// Status just fetched
        current: JobStatus,
    },
    /// Terminal success; subscription is finished
    Completed {
        /// Job polled
        job_ref: JobRef,
        /// Success status
        status: JobStatus,
    },
    /// Partner reported a terminal failure; subscription is finished
    Failed {
        /// Job polled
        job_ref: JobRef,
        /// Failure status
        status: JobStatus,
    },
    /// Attempts exhausted with no terminal status
    TimedOut {
        /// Job polled
        job_ref: JobRef,
        /// Fetches made
        attempts: u32,
        /// Last status seen, if any fetch succeeded
        last_status: Option<JobStatus>,
    },
}

impl StatusEvent {
    /// Job the event is about
    pub fn job_ref(&self) -> &JobRef {
        match self {
            Self::StatusChanged { job_ref, .. } => job_ref,
            Self::Completed { job_ref, .. } => job_ref,
            Self::Failed { job_ref, .. } => job_ref,
            Self::TimedOut { job_ref, .. } => job_ref,
        }
    }

    /// Last event of a subscription
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::StatusChanged { .. })
    }
}
