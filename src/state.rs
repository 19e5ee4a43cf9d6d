//! Workflow instance and its forward-only stage machine

use crate::{
    Bundle, ChargeRecord, ClientRef, JobRef, JobStatus, ProvisioningJob, ResellerId,
    ReversalRecord, StatusClassification, WorkflowFailure, WorkflowId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline stages, in order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Client resolution
    Intake,
    /// Bundle choice
    PlanSelection,
    /// Balance charge
    Payment,
    /// Partner order and status polling
    Provisioning,
    /// Credential delivery
    Delivery,
    /// Assignment record write
    Persistence,
    /// Nothing left to run
    Done,
}

impl Stage {
    /// 1-based stage number as shown to users; `Done` is 7
    pub fn number(&self) -> u8 {
        match self {
            Self::Intake => 1,
            Self::PlanSelection => 2,
            Self::Payment => 3,
            Self::Provisioning => 4,
            Self::Delivery => 5,
            Self::Persistence => 6,
            Self::Done => 7,
        }
    }
}

/// How a finished workflow ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalOutcome {
    /// Record persisted
    Success,
    /// Abandoned by a caller
    Aborted,
    /// Ended by a failure; any charge was reversed
    Failed,
}

/// Client chosen at intake
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolvedClient {
    /// Registry reference
    pub client_ref: ClientRef,
    /// Full legal name
    pub full_name: Box<str>,
    /// Email address
    pub email: Box<str>,
    /// Phone number
    pub phone: Box<str>,
    /// Registered during this workflow rather than reused
    pub created: bool,
}

/// Refused transition; the instance is left unchanged
#[derive(Clone, Debug, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum TransitionError {
    /// Input belongs to another stage
    #[error("expected stage {expected:?}, workflow is at {actual:?}")]
    WrongStage {
        /// Stage the input belongs to
        expected: Stage,
        /// Stage the workflow is at
        actual: Stage,
    },
    /// An earlier stage's artifact is absent
    #[error("missing artifact: {0}")]
    MissingArtifact(Box<str>),
    /// Only one order per workflow
    #[error("a provisioning job already exists for this workflow")]
    JobAlreadyExists,
    /// Delivery needs a job in a success state
    #[error("job {job_ref} is at `{status}`, not a success state")]
    JobNotReady {
        /// Partner job reference
        job_ref: JobRef,
        /// Its current status
        status: JobStatus,
    },
    /// A previous order call has an unknown outcome
    #[error("order outcome is unknown; reconcile before continuing")]
    ReconciliationPending,
    /// Workflow has a terminal outcome
    #[error("workflow already ended: {0:?}")]
    Finished(TerminalOutcome),
    /// Reset refused because money moved
    #[error("cannot reset after a charge was recorded")]
    ChargeLocked,
    /// A charge is reversed at most once
    #[error("charge already reversed")]
    AlreadyReversed,
}

/// The unit of work for one assignment attempt.
///
/// Artifacts only ever appear in pipeline order. `charge_record` is never
/// cleared once set; a refund shows up as a separate `reversal`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    id: WorkflowId,
    reseller: ResellerId,
    stage: Stage,
    client: Option<ResolvedClient>,
    selected_bundle: Option<Bundle>,
    charge_record: Option<ChargeRecord>,
    reversal: Option<ReversalRecord>,
    provisioning_job: Option<ProvisioningJob>,
    reconciliation_pending: bool,
    delivery_pending: bool,
    record_id: Option<Box<str>>,
    terminal_outcome: Option<TerminalOutcome>,
    last_failure: Option<WorkflowFailure>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Fresh workflow at `Intake`
    pub fn new(id: WorkflowId, reseller: ResellerId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            reseller,
            stage: Stage::Intake,
            client: None,
            selected_bundle: None,
            charge_record: None,
            reversal: None,
            provisioning_job: None,
            reconciliation_pending: false,
            delivery_pending: false,
            record_id: None,
            terminal_outcome: None,
            last_failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    // === Accessors ===

    /// Workflow id
    pub fn id(&self) -> WorkflowId {
        self.id
    }

    /// Reseller the workflow runs for
    pub fn reseller(&self) -> &ResellerId {
        &self.reseller
    }

    /// Current stage
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Client resolved at intake
    pub fn client(&self) -> Option<&ResolvedClient> {
        self.client.as_ref()
    }

    /// Registry reference of the resolved client
    pub fn client_ref(&self) -> Option<&ClientRef> {
        self.client.as_ref().map(|c| &c.client_ref)
    }

    /// Bundle chosen at plan selection
    pub fn selected_bundle(&self) -> Option<&Bundle> {
        self.selected_bundle.as_ref()
    }

    /// Confirmed debit
    pub fn charge_record(&self) -> Option<&ChargeRecord> {
        self.charge_record.as_ref()
    }

    /// Compensating credit, if the charge was reversed
    pub fn reversal(&self) -> Option<&ReversalRecord> {
        self.reversal.as_ref()
    }

    /// Partner job, once an order was accepted
    pub fn provisioning_job(&self) -> Option<&ProvisioningJob> {
        self.provisioning_job.as_ref()
    }

    /// Order outcome unknown; reconcile before continuing
    pub fn reconciliation_pending(&self) -> bool {
        self.reconciliation_pending
    }

    /// Credentials still need to be sent
    pub fn delivery_pending(&self) -> bool {
        self.delivery_pending
    }

    /// Assignment record id, once persisted
    pub fn record_id(&self) -> Option<&str> {
        self.record_id.as_deref()
    }

    /// How the workflow ended
    pub fn terminal_outcome(&self) -> Option<TerminalOutcome> {
        self.terminal_outcome
    }

    /// Most recent recorded failure
    pub fn last_failure(&self) -> Option<&WorkflowFailure> {
        self.last_failure.as_ref()
    }

    /// Creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of the last change
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// A debit has been confirmed
    pub fn money_moved(&self) -> bool {
        self.charge_record.is_some()
    }

    /// The debit was compensated
    pub fn charge_reversed(&self) -> bool {
        self.reversal.is_some()
    }

    /// Ended with any outcome
    pub fn is_finished(&self) -> bool {
        self.terminal_outcome.is_some()
    }

    // === Guards ===

    fn ensure_open(&self) -> Result<(), TransitionError> {
        match self.terminal_outcome {
            Some(outcome) => Err(TransitionError::Finished(outcome)),
            None => Ok(()),
        }
    }

    /// Refuse unless open and at `expected`
    pub fn ensure_stage(&self, expected: Stage) -> Result<(), TransitionError> {
        self.ensure_open()?;
        if self.stage != expected {
            return Err(TransitionError::WrongStage {
                expected,
                actual: self.stage,
            });
        }
        Ok(())
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    // === Forward transitions (orchestrator only) ===

    /// Intake -> PlanSelection
    pub fn resolve_client(
        &mut self,
        client: ResolvedClient,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_stage(Stage::Intake)?;
        self.client = Some(client);
        self.stage = Stage::PlanSelection;
        self.touch(now);
        Ok(())
    }

    /// PlanSelection -> Payment
    pub fn select_bundle(&mut self, bundle: Bundle, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_stage(Stage::PlanSelection)?;
        if self.client.is_none() {
            return Err(TransitionError::MissingArtifact("client_ref".into()));
        }
        self.selected_bundle = Some(bundle);
        self.stage = Stage::Payment;
        self.touch(now);
        Ok(())
    }

    /// Payment -> Provisioning
    pub fn record_charge(
        &mut self,
        charge: ChargeRecord,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_stage(Stage::Payment)?;
        if self.selected_bundle.is_none() {
            return Err(TransitionError::MissingArtifact("selected_bundle".into()));
        }
        self.charge_record = Some(charge);
        self.stage = Stage::Provisioning;
        self.touch(now);
        Ok(())
    }

    /// Ready to call the partner: charged, no job yet, no unresolved order
    pub fn ensure_can_submit(&self) -> Result<(), TransitionError> {
        self.ensure_stage(Stage::Provisioning)?;
        if self.charge_record.is_none() {
            return Err(TransitionError::MissingArtifact("charge_record".into()));
        }
        if self.provisioning_job.is_some() {
            return Err(TransitionError::JobAlreadyExists);
        }
        if self.reconciliation_pending {
            return Err(TransitionError::ReconciliationPending);
        }
        Ok(())
    }

    /// Record the single provisioning job of this workflow
    pub fn attach_job(&mut self, job: ProvisioningJob, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_stage(Stage::Provisioning)?;
        if self.charge_record.is_none() {
            return Err(TransitionError::MissingArtifact("charge_record".into()));
        }
        if self.provisioning_job.is_some() {
            return Err(TransitionError::JobAlreadyExists);
        }
        self.provisioning_job = Some(job);
        self.reconciliation_pending = false;
        self.touch(now);
        Ok(())
    }

    /// The order call may or may not have landed
    pub fn mark_reconciliation_pending(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_stage(Stage::Provisioning)?;
        if self.provisioning_job.is_some() {
            return Err(TransitionError::JobAlreadyExists);
        }
        self.reconciliation_pending = true;
        self.touch(now);
        Ok(())
    }

    /// Reconciliation confirmed that no order exists
    pub fn clear_reconciliation(&mut self, now: DateTime<Utc>) {
        self.reconciliation_pending = false;
        self.touch(now);
    }

    /// Provisioning -> Delivery, only once the job reached a success status
    pub fn begin_delivery(
        &mut self,
        classification: &StatusClassification,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_stage(Stage::Provisioning)?;
        let job = self
            .provisioning_job
            .as_ref()
            .ok_or_else(|| TransitionError::MissingArtifact("provisioning_job".into()))?;
        if classification.classify(&job.status) != crate::StatusClass::TerminalSuccess {
            return Err(TransitionError::JobNotReady {
                job_ref: job.job_ref.clone(),
                status: job.status.clone(),
            });
        }
        self.stage = Stage::Delivery;
        self.touch(now);
        Ok(())
    }

    /// Delivery -> Persistence. A failed delivery only leaves a flag behind.
    pub fn finish_delivery(&mut self, delivered: bool, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_stage(Stage::Delivery)?;
        self.delivery_pending = !delivered;
        self.stage = Stage::Persistence;
        self.touch(now);
        Ok(())
    }

    /// Persistence -> Done
    pub fn complete(&mut self, record_id: Box<str>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_stage(Stage::Persistence)?;
        self.record_id = Some(record_id);
        self.stage = Stage::Done;
        self.terminal_outcome = Some(TerminalOutcome::Success);
        self.last_failure = None;
        self.touch(now);
        Ok(())
    }

    /// A later, independent delivery attempt went through
    pub fn mark_delivered(&mut self, now: DateTime<Utc>) {
        self.delivery_pending = false;
        self.touch(now);
    }

    /// Attach the compensating credit; at most once
    pub fn record_reversal(
        &mut self,
        reversal: ReversalRecord,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.charge_record.is_none() {
            return Err(TransitionError::MissingArtifact("charge_record".into()));
        }
        if self.reversal.is_some() {
            return Err(TransitionError::AlreadyReversed);
        }
        self.reversal = Some(reversal);
        self.touch(now);
        Ok(())
    }

    // === Status writes (poller-facing) ===

    /// Returns `true` when the stored status changed
    pub fn apply_job_status(&mut self, status: JobStatus, now: DateTime<Utc>) -> bool {
        match self.provisioning_job.as_mut() {
            Some(job) if job.status != status => {
                job.status = status;
                self.updated_at = now;
                true
            }
            _ => false,
        }
    }

    /// Set the outcome unless one is already set
    pub fn set_terminal_outcome(&mut self, outcome: TerminalOutcome, now: DateTime<Utc>) {
        if self.terminal_outcome.is_none() {
            self.terminal_outcome = Some(outcome);
            self.touch(now);
        }
    }

    // === Failure bookkeeping ===

    /// Remember `failure` for display and resumption
    pub fn record_failure(&mut self, failure: WorkflowFailure, now: DateTime<Utc>) {
        self.last_failure = Some(failure);
        self.touch(now);
    }

    /// Forget the last failure
    pub fn clear_failure(&mut self) {
        self.last_failure = None;
    }

    /// End the workflow as `Aborted`
    pub fn abandon(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_open()?;
        self.terminal_outcome = Some(TerminalOutcome::Aborted);
        self.touch(now);
        Ok(())
    }

    /// Clear every artifact and go back to Intake.
    ///
    /// All or nothing, and refused once money moved.
    pub fn reset(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_open()?;
        if self.charge_record.is_some() {
            return Err(TransitionError::ChargeLocked);
        }
        *self = Self {
            created_at: self.created_at,
            ..Self::new(self.id, self.reseller.clone(), now)
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_bundle, sample_charge};
    use crate::{ActivationPayload, IdempotencyKey};

    fn client() -> ResolvedClient {
        ResolvedClient {
            client_ref: ClientRef::new("cli-1"),
            full_name: "A. Traveler".into(),
            email: "a.traveler@example.com".into(),
            phone: "+441234567890".into(),
            created: true,
        }
    }

    fn job(status: &str) -> ProvisioningJob {
        ProvisioningJob {
            job_ref: JobRef::new("ord-1"),
            order_key: IdempotencyKey("wf:test:order".into()),
            status: JobStatus::new(status),
            iccid: "8944000000000000001".into(),
            activation: ActivationPayload {
                smdp_address: "smdp.example".into(),
                matching_id: "M1".into(),
                qr_code: None,
            },
            expires_at: Utc::now(),
            submitted_at: Utc::now(),
        }
    }

    fn charged() -> WorkflowInstance {
        let now = Utc::now();
        let mut wf = WorkflowInstance::new(WorkflowId::new(), ResellerId::new("r1"), now);
        wf.resolve_client(client(), now).unwrap();
        wf.select_bundle(sample_bundle(), now).unwrap();
        wf.record_charge(sample_charge(), now).unwrap();
        wf
    }

    #[test]
    fn stages_only_move_forward() {
        let now = Utc::now();
        let mut wf = WorkflowInstance::new(WorkflowId::new(), ResellerId::new("r1"), now);

        let err = wf.select_bundle(sample_bundle(), now).unwrap_err();
        assert_eq!(
            err,
            TransitionError::WrongStage {
                expected: Stage::PlanSelection,
                actual: Stage::Intake
            }
        );

        wf.resolve_client(client(), now).unwrap();
        assert!(wf.resolve_client(client(), now).is_err());
        assert_eq!(wf.stage(), Stage::PlanSelection);
    }

    #[test]
    fn one_job_per_workflow() {
        let mut wf = charged();
        let now = Utc::now();
        wf.attach_job(job("pending"), now).unwrap();
        assert_eq!(wf.attach_job(job("pending"), now), Err(TransitionError::JobAlreadyExists));
        assert_eq!(wf.ensure_can_submit(), Err(TransitionError::JobAlreadyExists));
    }

    #[test]
    fn delivery_waits_for_success_status() {
        let mut wf = charged();
        let now = Utc::now();
        let table = StatusClassification::default();
        wf.attach_job(job("provisioning"), now).unwrap();

        assert!(matches!(
            wf.begin_delivery(&table, now),
            Err(TransitionError::JobNotReady { .. })
        ));

        assert!(wf.apply_job_status(JobStatus::new("ready"), now));
        assert!(!wf.apply_job_status(JobStatus::new("ready"), now));
        wf.begin_delivery(&table, now).unwrap();
        wf.finish_delivery(false, now).unwrap();
        assert!(wf.delivery_pending());
        wf.complete("rec-1".into(), now).unwrap();
        assert_eq!(wf.terminal_outcome(), Some(TerminalOutcome::Success));
    }

    #[test]
    fn reset_is_refused_once_charged() {
        let mut wf = charged();
        assert_eq!(wf.reset(Utc::now()), Err(TransitionError::ChargeLocked));
        assert!(wf.charge_record().is_some());
        assert_eq!(wf.stage(), Stage::Provisioning);
    }

    #[test]
    fn reset_clears_everything_before_payment() {
        let now = Utc::now();
        let mut wf = WorkflowInstance::new(WorkflowId::new(), ResellerId::new("r1"), now);
        let id = wf.id();
        wf.resolve_client(client(), now).unwrap();
        wf.select_bundle(sample_bundle(), now).unwrap();

        wf.reset(now).unwrap();
        assert_eq!(wf.stage(), Stage::Intake);
        assert!(wf.client().is_none());
        assert!(wf.selected_bundle().is_none());
        assert_eq!(wf.id(), id);
    }

    #[test]
    fn reversal_keeps_charge_and_happens_once() {
        let mut wf = charged();
        let now = Utc::now();
        let reversal = ReversalRecord {
            reversal_ref: "le-2".into(),
            charge_ref: "le-1".into(),
            amount: sample_charge().amount,
            reason: "rejected".into(),
            reversed_at: now,
        };
        wf.record_reversal(reversal.clone(), now).unwrap();
        assert_eq!(wf.record_reversal(reversal, now), Err(TransitionError::AlreadyReversed));
        assert!(wf.money_moved());
        assert!(wf.charge_reversed());
    }

    #[test]
    fn finished_workflow_rejects_transitions() {
        let mut wf = charged();
        let now = Utc::now();
        wf.abandon(now).unwrap();
        assert_eq!(
            wf.attach_job(job("pending"), now),
            Err(TransitionError::Finished(TerminalOutcome::Aborted))
        );
    }

    #[test]
    fn checkpoint_round_trips_through_json() {
        let mut wf = charged();
        wf.attach_job(job("pending"), Utc::now()).unwrap();
        let raw = serde_json::to_string(&wf).unwrap();
        let back: WorkflowInstance = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, wf);
    }
}
