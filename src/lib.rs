//! Six-stage eSIM assignment saga
//!
//! Walks a reseller through assigning an eSIM bundle to a traveler:
//! client intake, plan selection, balance charge, partner provisioning,
//! credential delivery and record persistence. Money moves once per
//! workflow; when the partner cannot fulfil an order the charge is reversed
//! by a compensating credit, and an order whose fate is unknown is
//! reconciled before anything else happens.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // 1. Wire the external systems
//! let orchestrator = Orchestrator::new(WorkflowConfig::default(), Collaborators {
//!     registry, ledger, partner, notifier, store, journal,
//! })?;
//!
//! // 2. Start a workflow and drive it stage by stage
//! let wf = orchestrator.start_workflow(ResellerId::new("r1"))?;
//! orchestrator.advance(wf.id(), StageInput::Intake { intake, confirm_existing: false }).await?;
//! orchestrator.advance(wf.id(), StageInput::SelectBundle { bundle_id }).await?;
//! orchestrator.advance(wf.id(), StageInput::Pay { markup_percent: None }).await?;
//! orchestrator.advance(wf.id(), StageInput::Provision).await?;
//!
//! // 3. Wait for the partner job, then finish
//! let mut rx = orchestrator.watch(wf.id()).await?;
//! rx.wait_for(|wf| wf.provisioning_job().is_some_and(|j| j.status.as_str() == "ready")).await?;
//! orchestrator.advance(wf.id(), StageInput::Deliver).await?;
//! orchestrator.advance(wf.id(), StageInput::Persist).await?;
//! ```

#![warn(missing_docs)]

// === Core Types ===
mod context;
mod errors;
mod events;
mod idempotency;
mod state;

// === Configuration ===
mod config;

// === External Systems ===
mod ledger;
mod notify;
mod partner;
mod registry;

// === Stages ===
mod billing;
mod delivery;
mod provisioning;
mod resolution;

// === Orchestration ===
mod orchestrator;
mod poller;

// === Storage ===
mod journal;
mod store;
#[cfg(feature = "lmdb")]
mod store_lmdb;

// === Observability ===
mod observer;
mod stats;

// === Test Support ===
/// Fakes and helpers for tests
#[cfg(any(test, feature = "test-harness"))]
pub mod testing;

// === Re-exports ===

// Types
pub use context::{now_millis, BundleId, ClientRef, JobRef, ResellerId, WorkflowId};
pub use idempotency::IdempotencyKey;

// State
pub use state::{ResolvedClient, Stage, TerminalOutcome, TransitionError, WorkflowInstance};

// Events
pub use events::{StatusEvent, WorkflowEvent};

// Errors
pub use errors::{ConflictKind, WorkflowError, WorkflowFailure};

// Configuration
pub use config::{
    ConfigError, PollerConfig, RetryPolicy, StatusClass, StatusClassification, WorkflowConfig,
};

// External systems
pub use ledger::{
    BalanceLedger, EntryKind, InMemoryLedger, LedgerEntry, LedgerError, PostingReceipt,
};
pub use notify::{CredentialsPayload, InMemoryOutbox, NotificationSender, NotifyError};
pub use partner::{
    ActivationPayload, Bundle, Eligibility, JobStatus, OrderReceipt, OrderRequest, PartnerApi,
    PartnerCallError,
};
pub use registry::{ClientRecord, ClientRegistry, InMemoryRegistry, NewClient, RegistryError};

// Stages
pub use billing::{clamp_markup, final_amount, BalanceUnit, ChargeError, ChargeRecord, ReversalRecord};
pub use delivery::{DeliveryOutcome, DeliveryStage, PersistError};
pub use provisioning::{ProvisioningCoordinator, ProvisioningError, ProvisioningJob};
pub use resolution::{
    validate_intake, ClientIntake, ClientResolutionEngine, FieldError, ResolutionDecision,
    ResolutionError,
};

// Orchestration
pub use orchestrator::{Collaborators, Orchestrator, StageInput, WorkflowSnapshot};
pub use poller::{
    CallbackSink, ChannelSink, FanOutSink, PollError, PollSubscription, StatusPoller, StatusSink,
};

// Storage
pub use journal::{InMemoryJournal, JournalEntry, JournalError, WorkflowJournal};
pub use store::{AssignmentRecord, InMemoryWorkflowStore, PersistedRecord, StoreError, WorkflowStore};
#[cfg(feature = "lmdb")]
pub use store_lmdb::LmdbWorkflowStore;

// Observability
pub use observer::{NoOpObserver, TracingObserver, WorkflowObserver};
pub use stats::{WorkflowStats, WorkflowStatsSnapshot};
