//! Workflow orchestrator.
//!
//! Sequences the six stages for each [`WorkflowInstance`] and exposes the
//! driver operations. Each instance sits behind its own async mutex, so stages
//! of one workflow never run concurrently while unrelated workflows proceed
//! independently. Every mutation is checkpointed to the [`WorkflowStore`] and
//! published on a `watch` channel for UI subscribers.
//!
//! Once an order is accepted the status poller takes over; its events are
//! applied to the instance by a small applier task per subscription.

use crate::{
    BalanceLedger, BalanceUnit, Bundle, BundleId, ChannelSink, ClientIntake, ClientRegistry,
    ClientResolutionEngine, ConfigError, ConflictKind, DeliveryOutcome, DeliveryStage, FanOutSink,
    FieldError, JobRef, JournalEntry, JournalError, NotificationSender, PartnerApi, PersistError,
    ProvisioningCoordinator, ProvisioningError, ProvisioningJob, ResellerId, ResolutionDecision,
    ResolvedClient, Stage, StatusClass, StatusEvent, StatusPoller, StatusSink, StoreError,
    TerminalOutcome, TracingObserver, TransitionError, WorkflowConfig, WorkflowError,
    WorkflowEvent, WorkflowFailure, WorkflowId, WorkflowInstance, WorkflowJournal,
    WorkflowObserver, WorkflowStats, WorkflowStatsSnapshot, WorkflowStore,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, watch, Mutex};

/// What UI subscribers see: the last committed state of a workflow
pub type WorkflowSnapshot = WorkflowInstance;

/// Input for one `advance` call
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum StageInput {
    /// Resolve the client
    Intake {
        /// Fields typed by the reseller
        intake: ClientIntake,
        /// Proceed with an existing client that already holds active bundles
        confirm_existing: bool,
    },
    /// Choose a bundle from the partner catalogue
    SelectBundle {
        /// Chosen bundle
        bundle_id: BundleId,
    },
    /// Charge the reseller
    Pay {
        /// Falls back to `default_markup_percent`
        markup_percent: Option<Decimal>,
    },
    /// Place the partner order and start polling
    Provision,
    /// Send credentials once the job is ready
    Deliver,
    /// Write the assignment record
    Persist,
}

impl StageInput {
    /// Stage the workflow must be at for this input
    pub fn stage(&self) -> Stage {
        match self {
            Self::Intake { .. } => Stage::Intake,
            Self::SelectBundle { .. } => Stage::PlanSelection,
            Self::Pay { .. } => Stage::Payment,
            Self::Provision => Stage::Provisioning,
            Self::Deliver => Stage::Provisioning,
            Self::Persist => Stage::Persistence,
        }
    }
}

/// External systems the orchestrator drives
pub struct Collaborators {
    /// Client lookup and registration
    pub registry: Arc<dyn ClientRegistry>,
    /// Reseller balances
    pub ledger: Arc<dyn BalanceLedger>,
    /// Partner provisioning API
    pub partner: Arc<dyn PartnerApi>,
    /// Credential delivery channel
    pub notifier: Arc<dyn NotificationSender>,
    /// Checkpoints and assignment records
    pub store: Arc<dyn WorkflowStore>,
    /// Workflow event journal
    pub journal: Arc<dyn WorkflowJournal>,
}

struct WorkflowSlot {
    instance: Mutex<WorkflowInstance>,
    snapshot: watch::Sender<WorkflowSnapshot>,
}

impl WorkflowSlot {
    fn new(instance: WorkflowInstance) -> Self {
        let (snapshot, _) = watch::channel(instance.clone());
        Self {
            instance: Mutex::new(instance),
            snapshot,
        }
    }
}

struct Inner {
    config: WorkflowConfig,
    resolution: ClientResolutionEngine,
    billing: BalanceUnit,
    provisioning: ProvisioningCoordinator,
    delivery: DeliveryStage,
    poller: StatusPoller,
    partner: Arc<dyn PartnerApi>,
    store: Arc<dyn WorkflowStore>,
    journal: Arc<dyn WorkflowJournal>,
    observer: Arc<dyn WorkflowObserver>,
    stats: Arc<WorkflowStats>,
    workflows: RwLock<HashMap<WorkflowId, Arc<WorkflowSlot>>>,
}

/// Drives eSIM assignment workflows
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Orchestrator that reports through [`TracingObserver`]
    pub fn new(config: WorkflowConfig, collaborators: Collaborators) -> Result<Self, ConfigError> {
        Self::with_observer(config, collaborators, Arc::new(TracingObserver))
    }

    /// Orchestrator with a custom observer
    pub fn with_observer(
        config: WorkflowConfig,
        collaborators: Collaborators,
        observer: Arc<dyn WorkflowObserver>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let Collaborators {
            registry,
            ledger,
            partner,
            notifier,
            store,
            journal,
        } = collaborators;

        let stats = Arc::new(WorkflowStats::new());
        let poller = StatusPoller::new(
            partner.clone(),
            config.status_classification.clone(),
            config.poller,
            stats.clone(),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                resolution: ClientResolutionEngine::new(registry),
                billing: BalanceUnit::new(ledger),
                provisioning: ProvisioningCoordinator::new(
                    partner.clone(),
                    config.allow_multiple_active,
                ),
                delivery: DeliveryStage::new(notifier, store.clone(), config.delivery_retry.clone()),
                poller,
                partner,
                store,
                journal,
                observer,
                stats,
                workflows: RwLock::new(HashMap::new()),
                config,
            }),
        })
    }

    // === Driver operations ===

    /// Create a workflow at `Intake` for `reseller`
    pub fn start_workflow(&self, reseller: ResellerId) -> Result<WorkflowSnapshot, WorkflowError> {
        let wf = WorkflowInstance::new(WorkflowId::new(), reseller, Utc::now());
        self.inner.store.save_checkpoint(&wf).map_err(persistence)?;
        self.inner.register(wf.clone());

        self.inner.record(wf.id(), WorkflowEvent::Started {
            reseller: wf.reseller().clone(),
        });
        WorkflowStats::bump(&self.inner.stats.workflows_started);
        self.inner.observer.on_workflow_started(wf.id(), wf.reseller());
        Ok(wf)
    }

    /// Run the stage that `input` belongs to.
    ///
    /// On failure the returned [`WorkflowFailure`] says which stage failed,
    /// whether money moved and where to pick up again.
    pub async fn advance(
        &self,
        id: WorkflowId,
        input: StageInput,
    ) -> Result<WorkflowSnapshot, WorkflowFailure> {
        let inner = &self.inner;
        let slot = slot(inner, id).map_err(|error| WorkflowFailure {
            workflow_id: id,
            stage: input.stage(),
            error,
            money_moved: false,
            charge_reversed: false,
            resume_from: None,
        })?;

        let mut wf = slot.instance.lock().await;
        let stage = wf.stage();
        let started = Instant::now();

        let outcome = match input {
            StageInput::Intake {
                intake,
                confirm_existing,
            } => inner.intake(&mut wf, &intake, confirm_existing).await,
            StageInput::SelectBundle { bundle_id } => inner.select_bundle(&mut wf, &bundle_id).await,
            StageInput::Pay { markup_percent } => inner.pay(&mut wf, markup_percent).await,
            StageInput::Provision => provision(inner, &mut wf).await,
            StageInput::Deliver => inner.deliver(&mut wf).await,
            StageInput::Persist => inner.persist(&mut wf),
        };

        inner.settle(&slot, &mut wf, stage, started, outcome)
    }

    /// Last committed state.
    ///
    /// Async because loading from a checkpoint may restart status polling.
    pub async fn get_workflow_state(
        &self,
        id: WorkflowId,
    ) -> Result<WorkflowSnapshot, WorkflowError> {
        let slot = slot(&self.inner, id)?;
        let snapshot = slot.snapshot.borrow().clone();
        Ok(snapshot)
    }

    /// Receive every committed state of `id` from now on
    pub async fn watch(
        &self,
        id: WorkflowId,
    ) -> Result<watch::Receiver<WorkflowSnapshot>, WorkflowError> {
        Ok(slot(&self.inner, id)?.snapshot.subscribe())
    }

    /// Poll `job_ref` on behalf of a UI listener.
    ///
    /// Replaces any existing subscription for the job. While the job belongs
    /// to a workflow in `Provisioning`, status keeps flowing into that
    /// workflow too and the attempts already spent carry over.
    pub fn subscribe_status(&self, job_ref: JobRef, sink: Arc<dyn StatusSink>) -> u64 {
        let inner = &self.inner;
        let Some(id) = inner.owner_of(&job_ref) else {
            return inner.poller.subscribe(job_ref, sink);
        };
        let listener = Some(sink);
        inner
            .poller
            .resubscribe(job_ref.clone(), workflow_sink(inner, id, listener.clone()))
            .unwrap_or_else(|| inner.poller.subscribe(job_ref, workflow_sink(inner, id, listener)))
    }

    /// Stop delivering status for `job_ref` to UI listeners.
    ///
    /// A workflow still waiting on the job keeps polling on its remaining
    /// attempts; only `abandon` or `shutdown` stop that.
    pub fn cancel_subscription(&self, job_ref: &JobRef) -> bool {
        let inner = &self.inner;
        match inner.owner_of(job_ref) {
            Some(id) => inner
                .poller
                .resubscribe(job_ref.clone(), workflow_sink(inner, id, None))
                .is_some(),
            None => inner.poller.cancel(job_ref),
        }
    }

    /// Clear every artifact and return to `Intake`; refused once charged
    pub async fn reset(&self, id: WorkflowId) -> Result<WorkflowSnapshot, WorkflowError> {
        let slot = slot(&self.inner, id)?;
        let mut wf = slot.instance.lock().await;
        wf.reset(Utc::now())?;
        self.inner.record(id, WorkflowEvent::Reset);
        self.inner.commit(&slot, &wf)?;
        Ok(wf.clone())
    }

    /// Rehydrate `id` from its checkpoint if it is not loaded yet
    pub async fn resume(&self, id: WorkflowId) -> Result<WorkflowSnapshot, WorkflowError> {
        self.get_workflow_state(id).await
    }

    /// Rehydrate every open checkpoint; returns the ids that were loaded
    pub async fn recover_workflows(&self) -> Result<Vec<WorkflowId>, WorkflowError> {
        let ids = self.inner.store.list_checkpoints().map_err(persistence)?;
        let mut recovered = Vec::new();
        for id in ids {
            if self.inner.cached(id).is_some() {
                continue;
            }
            slot(&self.inner, id)?;
            recovered.push(id);
        }
        tracing::info!(count = recovered.len(), "Recovered workflows from checkpoints");
        Ok(recovered)
    }

    /// Ask the partner for the authoritative outcome of this workflow's order
    pub async fn reconcile(&self, id: WorkflowId) -> Result<WorkflowSnapshot, WorkflowFailure> {
        let inner = &self.inner;
        let slot = slot(inner, id).map_err(|error| WorkflowFailure {
            workflow_id: id,
            stage: Stage::Provisioning,
            error,
            money_moved: false,
            charge_reversed: false,
            resume_from: None,
        })?;

        let mut wf = slot.instance.lock().await;
        let stage = wf.stage();
        let started = Instant::now();
        let outcome = reconcile_locked(inner, &mut wf).await;
        inner.settle(&slot, &mut wf, stage, started, outcome)
    }

    /// Stop the workflow for good. Money already moved is left as is and
    /// visible in the returned snapshot.
    pub async fn abandon(&self, id: WorkflowId) -> Result<WorkflowSnapshot, WorkflowError> {
        let slot = slot(&self.inner, id)?;
        let mut wf = slot.instance.lock().await;
        wf.abandon(Utc::now())?;
        if let Some(job) = wf.provisioning_job() {
            self.inner.poller.cancel(&job.job_ref);
        }
        if wf.money_moved() && !wf.charge_reversed() {
            tracing::warn!(workflow_id = %id, "Workflow abandoned with an unreversed charge");
        }
        self.inner.record(id, WorkflowEvent::Abandoned);
        WorkflowStats::bump(&self.inner.stats.workflows_abandoned);
        self.inner.commit(&slot, &wf)?;
        Ok(wf.clone())
    }

    /// Re-send credentials for a workflow flagged `delivery_pending`
    pub async fn retry_delivery(&self, id: WorkflowId) -> Result<WorkflowSnapshot, WorkflowError> {
        let inner = &self.inner;
        let slot = slot(inner, id)?;
        let mut wf = slot.instance.lock().await;
        if !wf.delivery_pending() {
            return Err(WorkflowError::validation("no delivery pending for this workflow"));
        }

        match inner.delivery.redeliver(&wf).await? {
            DeliveryOutcome::Delivered { attempts } => {
                let now = Utc::now();
                wf.mark_delivered(now);
                inner.record(id, WorkflowEvent::Delivered);
                tracing::info!(workflow_id = %id, attempts, "Credentials redelivered");
                if wf.record_id().is_some() {
                    inner.delivery.persist(&wf, now).map_err(persist_error)?;
                }
                inner.commit(&slot, &wf)?;
                Ok(wf.clone())
            }
            DeliveryOutcome::Failed { reason, .. } => {
                WorkflowStats::bump(&inner.stats.deliveries_failed);
                inner.record(id, WorkflowEvent::DeliveryFailed {
                    reason: reason.clone(),
                });
                Err(WorkflowError::Delivery { reason })
            }
        }
    }

    /// Partner plan catalogue
    pub async fn list_plans(&self) -> Result<Vec<Bundle>, WorkflowError> {
        self.inner
            .partner
            .list_bundles()
            .await
            .map_err(|e| WorkflowError::Partner {
                reason: e.to_string().into(),
            })
    }

    /// Journal of `id`, oldest first
    pub fn history(&self, id: WorkflowId) -> Result<Vec<JournalEntry>, WorkflowError> {
        self.inner.journal.read(id).map_err(|e| match e {
            JournalError::NotFound(id) => WorkflowError::NotFound(id),
            JournalError::Storage(reason) => WorkflowError::Persistence { reason },
        })
    }

    /// Counters since this orchestrator started
    pub fn stats(&self) -> WorkflowStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Cancel every status subscription
    pub fn shutdown(&self) {
        self.inner.poller.shutdown();
    }
}

// === Stage steps ===

impl Inner {
    async fn intake(
        &self,
        wf: &mut WorkflowInstance,
        intake: &ClientIntake,
        confirm_existing: bool,
    ) -> Result<(), WorkflowError> {
        wf.ensure_stage(Stage::Intake)?;
        let decision = self.resolution.resolve(wf.reseller(), intake).await?;

        let (client, created) = match decision {
            ResolutionDecision::Blocked { reason } => {
                return Err(WorkflowError::Conflict(ConflictKind::OwnedByOtherReseller {
                    reason,
                }))
            }
            ResolutionDecision::Reuse {
                client,
                requires_confirmation,
            } => {
                let active_bundles = client.active_bundle_count() as u32;
                if requires_confirmation && !confirm_existing {
                    return Err(WorkflowError::Conflict(ConflictKind::ConfirmationRequired {
                        active_bundles,
                    }));
                }
                if requires_confirmation && !self.config.allow_multiple_active {
                    return Err(WorkflowError::Conflict(
                        ConflictKind::MultipleActiveNotAllowed { active_bundles },
                    ));
                }
                (client, false)
            }
            ResolutionDecision::Create { client } => (client, true),
        };

        let client_ref = client.client_ref.clone();
        wf.resolve_client(
            ResolvedClient {
                client_ref: client.client_ref,
                full_name: client.full_name,
                email: client.email,
                phone: client.phone,
                created,
            },
            Utc::now(),
        )?;
        self.record(wf.id(), WorkflowEvent::ClientResolved {
            client_ref,
            created,
        });
        Ok(())
    }

    async fn select_bundle(
        &self,
        wf: &mut WorkflowInstance,
        bundle_id: &BundleId,
    ) -> Result<(), WorkflowError> {
        wf.ensure_stage(Stage::PlanSelection)?;
        let catalogue = self
            .partner
            .list_bundles()
            .await
            .map_err(|e| WorkflowError::Partner {
                reason: e.to_string().into(),
            })?;
        let bundle = catalogue
            .into_iter()
            .find(|b| &b.id == bundle_id)
            .ok_or_else(|| WorkflowError::Validation {
                message: format!("unknown bundle {bundle_id}").into(),
                fields: vec![FieldError {
                    field: "bundle_id".into(),
                    message: "not in the partner catalogue".into(),
                }],
            })?;

        let price = bundle.price;
        wf.select_bundle(bundle, Utc::now())?;
        self.record(wf.id(), WorkflowEvent::BundleSelected {
            bundle_id: bundle_id.clone(),
            price,
        });
        Ok(())
    }

    async fn pay(
        &self,
        wf: &mut WorkflowInstance,
        markup_percent: Option<Decimal>,
    ) -> Result<(), WorkflowError> {
        wf.ensure_stage(Stage::Payment)?;
        let bundle = wf
            .selected_bundle()
            .cloned()
            .ok_or_else(|| TransitionError::MissingArtifact("selected_bundle".into()))?;
        let markup = markup_percent.unwrap_or(self.config.default_markup_percent);

        let charge = self
            .billing
            .charge(wf.id(), wf.reseller(), bundle.price, markup, &bundle.currency)
            .await?;
        let (charge_ref, amount) = (charge.charge_ref.clone(), charge.amount);
        wf.record_charge(charge, Utc::now())?;

        WorkflowStats::bump(&self.stats.charges);
        self.record(wf.id(), WorkflowEvent::Charged { charge_ref, amount });
        self.observer.on_charged(wf.id(), amount);
        Ok(())
    }

    async fn deliver(&self, wf: &mut WorkflowInstance) -> Result<(), WorkflowError> {
        wf.begin_delivery(self.poller.classification(), Utc::now())?;
        if let Some(job) = wf.provisioning_job() {
            self.poller.cancel(&job.job_ref);
        }

        let outcome = self.delivery.deliver(wf).await?;
        wf.finish_delivery(outcome.delivered(), Utc::now())?;
        match outcome {
            DeliveryOutcome::Delivered { .. } => self.record(wf.id(), WorkflowEvent::Delivered),
            DeliveryOutcome::Failed { reason, .. } => {
                WorkflowStats::bump(&self.stats.deliveries_failed);
                self.record(wf.id(), WorkflowEvent::DeliveryFailed { reason });
            }
        }
        Ok(())
    }

    fn persist(&self, wf: &mut WorkflowInstance) -> Result<(), WorkflowError> {
        wf.ensure_stage(Stage::Persistence)?;
        let now = Utc::now();
        let persisted = self.delivery.persist(wf, now).map_err(persist_error)?;
        wf.complete(persisted.record_id.clone(), now)?;

        self.record(wf.id(), WorkflowEvent::Persisted {
            record_id: persisted.record_id,
        });
        self.record(wf.id(), WorkflowEvent::Completed);
        WorkflowStats::bump(&self.stats.workflows_completed);
        self.observer.on_workflow_completed(wf.id());
        Ok(())
    }

    /// Post the compensating credit (once) and end the workflow as `Failed`
    async fn reverse_and_fail(
        &self,
        wf: &mut WorkflowInstance,
        reason: &str,
    ) -> Result<(), WorkflowError> {
        let id = wf.id();
        if !wf.charge_reversed() {
            let charge = wf
                .charge_record()
                .cloned()
                .ok_or_else(|| TransitionError::MissingArtifact("charge_record".into()))?;
            let reversal = self.billing.reverse(id, &charge, reason).await?;
            let (reversal_ref, amount) = (reversal.reversal_ref.clone(), reversal.amount);
            wf.record_reversal(reversal, Utc::now())?;

            WorkflowStats::bump(&self.stats.reversals);
            self.record(id, WorkflowEvent::ChargeReversed {
                reversal_ref,
                amount,
                reason: reason.into(),
            });
            self.observer.on_charge_reversed(id, amount, reason);
        }

        let now = Utc::now();
        wf.clear_reconciliation(now);
        wf.set_terminal_outcome(TerminalOutcome::Failed, now);
        WorkflowStats::bump(&self.stats.workflows_failed);
        self.observer.on_workflow_failed(id, reason);
        Ok(())
    }

    // === Poller events ===

    async fn apply_status_event(&self, wf: &mut WorkflowInstance, event: StatusEvent) {
        // Past provisioning the job is settled; late partner news is ignored
        if wf.is_finished() || wf.stage() != Stage::Provisioning {
            return;
        }
        let id = wf.id();
        let now = Utc::now();
        match event {
            StatusEvent::StatusChanged {
                job_ref, current, ..
            } => {
                if wf.apply_job_status(current.clone(), now) {
                    self.observer.on_status_changed(id, &job_ref, &current);
                    self.record(id, WorkflowEvent::StatusObserved {
                        job_ref,
                        status: current,
                    });
                }
            }
            StatusEvent::Completed { job_ref, status } => {
                wf.apply_job_status(status, now);
                tracing::info!(workflow_id = %id, job_ref = %job_ref, "Provisioning job ready");
            }
            StatusEvent::Failed { job_ref, status } => {
                wf.apply_job_status(status.clone(), now);
                let error = WorkflowError::Partner {
                    reason: format!("job {job_ref} ended as `{status}`").into(),
                };
                match self.reverse_and_fail(wf, &error.to_string()).await {
                    Ok(()) => self.note_failure(wf, Stage::Provisioning, error),
                    Err(reversal) => self.note_failure(wf, Stage::Provisioning, reversal),
                };
            }
            StatusEvent::TimedOut { attempts, .. } => {
                self.note_failure(wf, Stage::Provisioning, WorkflowError::Timeout { attempts });
            }
        }
    }

    // === Bookkeeping ===

    /// Commit the outcome of a step and shape the caller's result
    fn settle(
        &self,
        slot: &WorkflowSlot,
        wf: &mut WorkflowInstance,
        stage: Stage,
        started: Instant,
        outcome: Result<(), WorkflowError>,
    ) -> Result<WorkflowSnapshot, WorkflowFailure> {
        match outcome {
            Ok(()) => {
                wf.clear_failure();
                if let Err(error) = self.commit(slot, wf) {
                    return Err(failure_for(wf, stage, error));
                }
                self.observer
                    .on_stage_completed(wf.id(), stage, started.elapsed().as_millis() as u64);
                Ok(wf.clone())
            }
            Err(error) => {
                // Misordered calls change nothing and are not recorded
                let failure = if matches!(error, WorkflowError::Transition(_)) {
                    failure_for(wf, stage, error)
                } else {
                    self.note_failure(wf, stage, error)
                };
                if let Err(err) = self.commit(slot, wf) {
                    tracing::error!(workflow_id = %wf.id(), error = %err, "Failed to checkpoint failed stage");
                }
                Err(failure)
            }
        }
    }

    fn note_failure(
        &self,
        wf: &mut WorkflowInstance,
        stage: Stage,
        error: WorkflowError,
    ) -> WorkflowFailure {
        let failure = failure_for(wf, stage, error);
        WorkflowStats::bump(&self.stats.stage_failures);
        self.observer.on_stage_failed(wf.id(), stage, &failure.error);
        self.record(wf.id(), WorkflowEvent::StageFailed {
            stage,
            error: failure.error.to_string().into(),
        });
        wf.record_failure(failure.clone(), Utc::now());
        failure
    }

    /// Checkpoint and publish; finished workflows are archived
    fn commit(&self, slot: &WorkflowSlot, wf: &WorkflowInstance) -> Result<(), WorkflowError> {
        slot.snapshot.send_replace(wf.clone());
        self.store.save_checkpoint(wf).map_err(persistence)?;
        if wf.is_finished() {
            self.store.archive_checkpoint(wf.id()).map_err(persistence)?;
        }
        Ok(())
    }

    fn record(&self, id: WorkflowId, event: WorkflowEvent) {
        let event_type = event.event_type();
        if let Err(err) = self.journal.append(id, event) {
            tracing::warn!(workflow_id = %id, event_type, error = %err, "Failed to journal workflow event");
        }
    }

    fn cached(&self, id: WorkflowId) -> Option<Arc<WorkflowSlot>> {
        self.workflows.read().ok()?.get(&id).cloned()
    }

    /// Returns the slot for the instance and whether it was newly inserted
    fn register(&self, wf: WorkflowInstance) -> (Arc<WorkflowSlot>, bool) {
        let mut workflows = match self.workflows.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = workflows.get(&wf.id()) {
            return (existing.clone(), false);
        }
        let id = wf.id();
        let slot = Arc::new(WorkflowSlot::new(wf));
        workflows.insert(id, slot.clone());
        (slot, true)
    }

    /// Workflow still waiting on `job_ref` in `Provisioning`
    fn owner_of(&self, job_ref: &JobRef) -> Option<WorkflowId> {
        let workflows = self.workflows.read().ok()?;
        workflows.iter().find_map(|(id, slot)| {
            let snapshot = slot.snapshot.borrow();
            let owns = !snapshot.is_finished()
                && snapshot.stage() == Stage::Provisioning
                && snapshot
                    .provisioning_job()
                    .is_some_and(|job| &job.job_ref == job_ref);
            owns.then_some(*id)
        })
    }

    /// Job that still needs polling after a rehydrate
    fn in_flight_job(&self, wf: &WorkflowInstance) -> Option<JobRef> {
        if wf.is_finished() || wf.stage() != Stage::Provisioning {
            return None;
        }
        let job = wf.provisioning_job()?;
        (self.poller.classification().classify(&job.status) == StatusClass::InFlight)
            .then(|| job.job_ref.clone())
    }
}

// === Steps that start polling ===

async fn provision(inner: &Arc<Inner>, wf: &mut WorkflowInstance) -> Result<(), WorkflowError> {
    wf.ensure_can_submit()?;
    let missing = |what: &str| TransitionError::MissingArtifact(what.into());
    let client = wf.client().cloned().ok_or_else(|| missing("client_ref"))?;
    let bundle = wf
        .selected_bundle()
        .cloned()
        .ok_or_else(|| missing("selected_bundle"))?;
    let charge = wf
        .charge_record()
        .cloned()
        .ok_or_else(|| missing("charge_record"))?;

    let submitted = inner
        .provisioning
        .submit(wf.id(), &client.client_ref, &client.email, &bundle, &charge)
        .await;

    match submitted {
        Ok(job) => adopt_job(inner, wf, job),
        Err(ProvisioningError::UnknownOutcome { reason }) => {
            wf.mark_reconciliation_pending(Utc::now())?;
            WorkflowStats::bump(&inner.stats.unknown_outcomes);
            inner.record(wf.id(), WorkflowEvent::OrderOutcomeUnknown {
                reason: reason.clone(),
            });
            reconcile_order(inner, wf, &reason).await
        }
        Err(rejected) => {
            // No order exists, so the charge can be returned right away
            let error = WorkflowError::from(rejected);
            if let Err(reversal) = inner.reverse_and_fail(wf, &error.to_string()).await {
                tracing::error!(workflow_id = %wf.id(), error = %reversal, "Charge reversal failed");
                wf.mark_reconciliation_pending(Utc::now())?;
                return Err(reversal);
            }
            Err(error)
        }
    }
}

/// Look the order up by its idempotency key and act on the answer
async fn reconcile_order(
    inner: &Arc<Inner>,
    wf: &mut WorkflowInstance,
    reason: &str,
) -> Result<(), WorkflowError> {
    let bundle = wf
        .selected_bundle()
        .cloned()
        .ok_or_else(|| TransitionError::MissingArtifact("selected_bundle".into()))?;

    match inner.provisioning.lookup(wf.id(), &bundle).await {
        Ok(Some(job)) => {
            tracing::info!(workflow_id = %wf.id(), job_ref = %job.job_ref, "Reconciliation found the order");
            inner.record(wf.id(), WorkflowEvent::Reconciled { order_found: true });
            adopt_job(inner, wf, job)
        }
        Ok(None) => {
            tracing::info!(workflow_id = %wf.id(), "Reconciliation confirmed no order exists");
            inner.record(wf.id(), WorkflowEvent::Reconciled { order_found: false });
            let error = WorkflowError::Partner {
                reason: format!("order was never placed ({reason})").into(),
            };
            inner.reverse_and_fail(wf, &error.to_string()).await?;
            Err(error)
        }
        Err(err) => {
            tracing::warn!(workflow_id = %wf.id(), error = %err, "Reconciliation lookup failed");
            Err(WorkflowError::PartnerUnknownOutcome {
                reason: format!("{reason}; lookup failed: {err}").into(),
            })
        }
    }
}

async fn reconcile_locked(
    inner: &Arc<Inner>,
    wf: &mut WorkflowInstance,
) -> Result<(), WorkflowError> {
    wf.ensure_stage(Stage::Provisioning)?;
    if wf.reconciliation_pending() {
        return reconcile_order(inner, wf, "reconciliation requested").await;
    }

    let job_ref = wf
        .provisioning_job()
        .map(|job| job.job_ref.clone())
        .ok_or_else(|| TransitionError::MissingArtifact("provisioning_job".into()))?;
    let status = inner
        .provisioning
        .status(&job_ref)
        .await
        .map_err(|e| WorkflowError::Partner {
            reason: e.to_string().into(),
        })?;

    let id = wf.id();
    if wf.apply_job_status(status.clone(), Utc::now()) {
        inner.observer.on_status_changed(id, &job_ref, &status);
        inner.record(id, WorkflowEvent::StatusObserved {
            job_ref: job_ref.clone(),
            status: status.clone(),
        });
    }

    match inner.poller.classification().classify(&status) {
        StatusClass::TerminalSuccess => Ok(()),
        StatusClass::TerminalFailure => {
            let error = WorkflowError::Partner {
                reason: format!("job {job_ref} ended as `{status}`").into(),
            };
            inner.reverse_and_fail(wf, &error.to_string()).await?;
            Err(error)
        }
        StatusClass::InFlight => {
            if !inner.poller.is_active(&job_ref) {
                subscribe_job(inner, id, job_ref);
            }
            Ok(())
        }
    }
}

fn adopt_job(
    inner: &Arc<Inner>,
    wf: &mut WorkflowInstance,
    job: ProvisioningJob,
) -> Result<(), WorkflowError> {
    let job_ref = job.job_ref.clone();
    wf.attach_job(job, Utc::now())?;
    inner.record(wf.id(), WorkflowEvent::OrderSubmitted {
        job_ref: job_ref.clone(),
    });
    subscribe_job(inner, wf.id(), job_ref);
    Ok(())
}

/// Loaded slot for `id`, rehydrating from the store when needed
fn slot(inner: &Arc<Inner>, id: WorkflowId) -> Result<Arc<WorkflowSlot>, WorkflowError> {
    if let Some(slot) = inner.cached(id) {
        return Ok(slot);
    }
    let wf = inner
        .store
        .load_checkpoint(id)
        .map_err(persistence)?
        .ok_or(WorkflowError::NotFound(id))?;
    let stage = wf.stage();
    let poll = inner.in_flight_job(&wf);

    let (slot, inserted) = inner.register(wf);
    if inserted {
        tracing::info!(workflow_id = %id, stage = ?stage, "Workflow rehydrated from checkpoint");
        inner.record(id, WorkflowEvent::Resumed { stage });
        if let Some(job_ref) = poll {
            subscribe_job(inner, id, job_ref);
        }
    }
    Ok(slot)
}

/// Start polling `job_ref` and feed the results back into workflow `id`
fn subscribe_job(inner: &Arc<Inner>, id: WorkflowId, job_ref: JobRef) -> u64 {
    inner.poller.subscribe(job_ref, workflow_sink(inner, id, None))
}

/// Sink that applies status to workflow `id`, plus `listener` if given.
/// The applier task ends once the poller drops the sink.
fn workflow_sink(
    inner: &Arc<Inner>,
    id: WorkflowId,
    listener: Option<Arc<dyn StatusSink>>,
) -> Arc<dyn StatusSink> {
    let (applier, rx) = ChannelSink::new();
    tokio::spawn(apply_status_events(Arc::downgrade(inner), id, rx));
    let applier: Arc<dyn StatusSink> = Arc::new(applier);
    match listener {
        Some(listener) => Arc::new(FanOutSink::new(vec![applier, listener])),
        None => applier,
    }
}

async fn apply_status_events(
    weak: Weak<Inner>,
    id: WorkflowId,
    mut rx: mpsc::UnboundedReceiver<StatusEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let Some(slot) = inner.cached(id) else {
            continue;
        };

        let mut wf = slot.instance.lock().await;
        let current_job = wf.provisioning_job().map(|job| &job.job_ref);
        if current_job != Some(event.job_ref()) {
            continue;
        }
        inner.apply_status_event(&mut wf, event).await;
        if let Err(err) = inner.commit(&slot, &wf) {
            tracing::error!(workflow_id = %id, error = %err, "Failed to checkpoint status update");
        }
    }
}

fn failure_for(wf: &WorkflowInstance, stage: Stage, error: WorkflowError) -> WorkflowFailure {
    WorkflowFailure {
        workflow_id: wf.id(),
        stage,
        error,
        money_moved: wf.money_moved(),
        charge_reversed: wf.charge_reversed(),
        resume_from: (!wf.is_finished()).then(|| wf.stage()),
    }
}

fn persistence(err: StoreError) -> WorkflowError {
    WorkflowError::Persistence {
        reason: err.to_string().into(),
    }
}

fn persist_error(err: PersistError) -> WorkflowError {
    match err {
        PersistError::Incomplete(transition) => WorkflowError::Transition(transition),
        PersistError::Store(store) => persistence(store),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{init_test_tracing, ScriptedPartner};
    use crate::{
        ClientRecord, ClientRef, EntryKind, IdempotencyKey, InMemoryJournal, InMemoryLedger,
        InMemoryOutbox, InMemoryRegistry, InMemoryWorkflowStore, PartnerCallError, PollerConfig,
    };
    use std::time::Duration;

    struct Harness {
        orchestrator: Orchestrator,
        registry: Arc<InMemoryRegistry>,
        ledger: Arc<InMemoryLedger>,
        partner: Arc<ScriptedPartner>,
        outbox: Arc<InMemoryOutbox>,
        store: Arc<InMemoryWorkflowStore>,
        journal: Arc<InMemoryJournal>,
    }

    impl Harness {
        fn new(credit: i64) -> Self {
            Self::with_config(credit, WorkflowConfig::default())
        }

        fn with_config(credit: i64, config: WorkflowConfig) -> Self {
            init_test_tracing();
            let ledger = Arc::new(InMemoryLedger::new());
            ledger.open_account(reseller(), Decimal::from(credit), Decimal::ZERO);
            let registry = Arc::new(InMemoryRegistry::new());
            let partner = Arc::new(ScriptedPartner::new());
            let outbox = Arc::new(InMemoryOutbox::new());
            let store = Arc::new(InMemoryWorkflowStore::new());
            let journal = Arc::new(InMemoryJournal::new());

            let orchestrator = Orchestrator::new(config, Collaborators {
                registry: registry.clone(),
                ledger: ledger.clone(),
                partner: partner.clone(),
                notifier: outbox.clone(),
                store: store.clone(),
                journal: journal.clone(),
            })
            .unwrap();

            Self {
                orchestrator,
                registry,
                ledger,
                partner,
                outbox,
                store,
                journal,
            }
        }

        /// A fresh orchestrator over the same collaborators, as after a process restart
        fn restart(&self, config: WorkflowConfig) -> Orchestrator {
            Orchestrator::new(config, Collaborators {
                registry: self.registry.clone(),
                ledger: self.ledger.clone(),
                partner: self.partner.clone(),
                notifier: self.outbox.clone(),
                store: self.store.clone(),
                journal: self.journal.clone(),
            })
            .unwrap()
        }

        fn credit(&self) -> Decimal {
            self.ledger.current_credit(&reseller()).unwrap()
        }

        async fn charged(&self) -> WorkflowId {
            let id = self.orchestrator.start_workflow(reseller()).unwrap().id();
            self.advance(id, intake(false)).await;
            self.advance(id, select("eu-5gb")).await;
            self.advance(id, pay(10)).await;
            id
        }

        async fn advance(&self, id: WorkflowId, input: StageInput) -> WorkflowSnapshot {
            self.orchestrator.advance(id, input).await.unwrap()
        }

        async fn wait_for(&self, id: WorkflowId, done: impl FnMut(&WorkflowSnapshot) -> bool) {
            let mut rx = self.orchestrator.watch(id).await.unwrap();
            rx.wait_for(done).await.unwrap();
        }

        async fn wait_ready(&self, id: WorkflowId) {
            self.wait_for(id, |wf| {
                wf.provisioning_job()
                    .is_some_and(|job| job.status.as_str() == "ready")
            })
            .await;
        }
    }

    fn reseller() -> ResellerId {
        ResellerId::new("r1")
    }

    fn traveler() -> ClientIntake {
        ClientIntake {
            full_name: "A. Traveler".into(),
            email: "a.traveler@example.com".into(),
            phone: "+441234567890".into(),
            identity_document: "P1234567".into(),
        }
    }

    fn intake(confirm_existing: bool) -> StageInput {
        StageInput::Intake {
            intake: traveler(),
            confirm_existing,
        }
    }

    fn select(bundle: &str) -> StageInput {
        StageInput::SelectBundle {
            bundle_id: BundleId::new(bundle),
        }
    }

    fn pay(markup: i64) -> StageInput {
        StageInput::Pay {
            markup_percent: Some(Decimal::from(markup)),
        }
    }

    fn existing_client(owner: &str, active: &[&str]) -> ClientRecord {
        ClientRecord {
            client_ref: ClientRef::new("cli-existing"),
            full_name: "A. Traveler".into(),
            email: "a.traveler@example.com".into(),
            phone: "+441234567890".into(),
            identity_document: "P1234567".into(),
            owning_reseller: ResellerId::new(owner),
            active_bundles: active.iter().map(|b| BundleId::new(*b)).collect(),
        }
    }

    fn credits_posted(ledger: &InMemoryLedger) -> usize {
        ledger
            .entries()
            .iter()
            .filter(|e| e.kind == EntryKind::Credit)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn traveler_assignment_runs_end_to_end() {
        let h = Harness::new(100);
        let id = h.orchestrator.start_workflow(reseller()).unwrap().id();

        let wf = h.advance(id, intake(false)).await;
        assert_eq!(wf.stage(), Stage::PlanSelection);
        assert!(wf.client().unwrap().created);

        h.advance(id, select("eu-5gb")).await;
        let wf = h.advance(id, pay(10)).await;
        assert_eq!(wf.charge_record().unwrap().amount, Decimal::new(5500, 2));
        assert_eq!(h.credit(), Decimal::new(4500, 2));

        let wf = h.advance(id, StageInput::Provision).await;
        assert_eq!(wf.provisioning_job().unwrap().job_ref, JobRef::new("ord-1"));
        h.wait_ready(id).await;

        let wf = h.advance(id, StageInput::Deliver).await;
        assert_eq!(wf.stage(), Stage::Persistence);
        assert!(!wf.delivery_pending());

        let wf = h.advance(id, StageInput::Persist).await;
        assert_eq!(wf.stage(), Stage::Done);
        assert_eq!(wf.terminal_outcome(), Some(TerminalOutcome::Success));

        assert_eq!(h.outbox.sent().len(), 1);
        assert_eq!(h.store.record_count(), 1);
        assert!(h.store.list_checkpoints().unwrap().is_empty());
        assert_eq!(h.partner.orders_placed(), 1);

        let history: Vec<_> = h
            .orchestrator
            .history(id)
            .unwrap()
            .into_iter()
            .map(|e| e.event.event_type())
            .collect();
        assert_eq!(history.first(), Some(&"started"));
        assert_eq!(history.last(), Some(&"completed"));
        assert!(history.contains(&"charged"));
        assert!(history.contains(&"order_submitted"));

        let stats = h.orchestrator.stats();
        assert_eq!(stats.workflows_started, 1);
        assert_eq!(stats.workflows_completed, 1);
        assert_eq!(stats.charges, 1);
        assert_eq!(stats.reversals, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn short_credit_fails_payment_without_debit() {
        let h = Harness::new(40);
        let id = h.orchestrator.start_workflow(reseller()).unwrap().id();
        h.advance(id, intake(false)).await;
        h.advance(id, select("eu-5gb")).await;

        let failure = h.orchestrator.advance(id, pay(10)).await.unwrap_err();
        assert_eq!(
            failure.error,
            WorkflowError::InsufficientFunds {
                shortfall: Decimal::new(1500, 2)
            }
        );
        assert_eq!(failure.stage, Stage::Payment);
        assert!(!failure.money_moved);
        assert_eq!(failure.resume_from, Some(Stage::Payment));
        assert!(failure.is_safe_to_restart());
        assert!(h.ledger.entries().is_empty());

        let wf = h.orchestrator.get_workflow_state(id).await.unwrap();
        assert_eq!(wf.stage(), Stage::Payment);
        assert_eq!(wf.last_failure(), Some(&failure));
    }

    #[tokio::test(start_paused = true)]
    async fn pay_retry_after_lost_ledger_response_keeps_original_charge() {
        let h = Harness::new(55);
        let id = h.orchestrator.start_workflow(reseller()).unwrap().id();
        h.advance(id, intake(false)).await;
        h.advance(id, select("eu-5gb")).await;
        h.ledger
            .debit(&reseller(), Decimal::new(5500, 2), &IdempotencyKey::for_charge(id))
            .await
            .unwrap();

        let wf = h.advance(id, pay(10)).await;
        assert!(wf.money_moved());
        assert_eq!(wf.stage(), Stage::Provisioning);
        assert_eq!(wf.charge_record().unwrap().charge_ref.as_ref(), "le-1");
        assert_eq!(h.ledger.entries().len(), 1);
        assert_eq!(h.credit(), Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn existing_client_with_active_bundle_needs_confirmation() {
        let h = Harness::new(100);
        h.registry.insert(existing_client("r1", &["asia-1gb"]));
        let id = h.orchestrator.start_workflow(reseller()).unwrap().id();

        let failure = h.orchestrator.advance(id, intake(false)).await.unwrap_err();
        assert_eq!(
            failure.error,
            WorkflowError::Conflict(ConflictKind::ConfirmationRequired { active_bundles: 1 })
        );

        let failure = h.orchestrator.advance(id, intake(true)).await.unwrap_err();
        assert_eq!(
            failure.error,
            WorkflowError::Conflict(ConflictKind::MultipleActiveNotAllowed { active_bundles: 1 })
        );
        assert_eq!(h.registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_reuse_allowed_by_policy() {
        let config = WorkflowConfig {
            allow_multiple_active: true,
            ..WorkflowConfig::default()
        };
        let h = Harness::with_config(100, config);
        h.registry.insert(existing_client("r1", &["asia-1gb"]));
        let id = h.orchestrator.start_workflow(reseller()).unwrap().id();

        let wf = h.advance(id, intake(true)).await;
        let client = wf.client().unwrap();
        assert_eq!(client.client_ref, ClientRef::new("cli-existing"));
        assert!(!client.created);
        assert_eq!(h.registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn contact_of_other_reseller_is_blocked() {
        let h = Harness::new(100);
        h.registry.insert(existing_client("r2", &[]));
        let id = h.orchestrator.start_workflow(reseller()).unwrap().id();

        let failure = h.orchestrator.advance(id, intake(true)).await.unwrap_err();
        assert!(matches!(
            failure.error,
            WorkflowError::Conflict(ConflictKind::OwnedByOtherReseller { .. })
        ));
        assert_eq!(
            h.orchestrator.get_workflow_state(id).await.unwrap().stage(),
            Stage::Intake
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_bundle_is_a_validation_error() {
        let h = Harness::new(100);
        let id = h.orchestrator.start_workflow(reseller()).unwrap().id();
        h.advance(id, intake(false)).await;

        let failure = h.orchestrator.advance(id, select("moon-1tb")).await.unwrap_err();
        assert!(matches!(failure.error, WorkflowError::Validation { .. }));
        assert_eq!(failure.resume_from, Some(Stage::PlanSelection));
    }

    #[tokio::test(start_paused = true)]
    async fn stages_cannot_be_skipped() {
        let h = Harness::new(100);
        let id = h.orchestrator.start_workflow(reseller()).unwrap().id();

        let failure = h.orchestrator.advance(id, pay(10)).await.unwrap_err();
        assert!(matches!(
            failure.error,
            WorkflowError::Transition(TransitionError::WrongStage { .. })
        ));
        let wf = h.orchestrator.get_workflow_state(id).await.unwrap();
        assert!(wf.last_failure().is_none());
        assert!(h.ledger.entries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn order_timeout_holds_reversal_until_absence_confirmed() {
        let h = Harness::new(100);
        let id = h.charged().await;
        h.partner.fail_orders_with(Some(PartnerCallError::Timeout), false);
        h.partner.fail_lookups_with(Some(PartnerCallError::Transport {
            reason: "connection reset".into(),
        }));

        let failure = h
            .orchestrator
            .advance(id, StageInput::Provision)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, WorkflowError::PartnerUnknownOutcome { .. }));
        assert!(failure.money_moved);
        assert!(!failure.charge_reversed);
        assert!(!failure.is_safe_to_restart());
        assert_eq!(failure.resume_from, Some(Stage::Provisioning));
        assert_eq!(credits_posted(&h.ledger), 0);
        assert!(h.orchestrator.get_workflow_state(id).await.unwrap().reconciliation_pending());

        // A blind retry is refused
        let retry = h
            .orchestrator
            .advance(id, StageInput::Provision)
            .await
            .unwrap_err();
        assert_eq!(
            retry.error,
            WorkflowError::Transition(TransitionError::ReconciliationPending)
        );

        h.partner.fail_lookups_with(None);
        let failure = h.orchestrator.reconcile(id).await.unwrap_err();
        assert!(failure.charge_reversed);
        assert!(failure.is_safe_to_restart());
        assert_eq!(failure.resume_from, None);
        assert_eq!(credits_posted(&h.ledger), 1);
        assert_eq!(h.credit(), Decimal::from(100));

        let wf = h.orchestrator.get_workflow_state(id).await.unwrap();
        assert_eq!(wf.terminal_outcome(), Some(TerminalOutcome::Failed));
        assert!(wf.charge_record().is_some());
        assert_eq!(h.orchestrator.stats().unknown_outcomes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn order_accepted_despite_timeout_is_adopted() {
        let h = Harness::new(100);
        let id = h.charged().await;
        h.partner.fail_orders_with(Some(PartnerCallError::Timeout), true);

        let wf = h.advance(id, StageInput::Provision).await;
        assert_eq!(wf.provisioning_job().unwrap().job_ref, JobRef::new("ord-1"));
        assert!(!wf.reconciliation_pending());
        assert_eq!(h.partner.orders_placed(), 1);
        assert_eq!(credits_posted(&h.ledger), 0);

        h.wait_ready(id).await;
        h.advance(id, StageInput::Deliver).await;
    }

    #[tokio::test(start_paused = true)]
    async fn partner_rejection_before_order_reverses_charge() {
        let h = Harness::new(100);
        let id = h.charged().await;
        h.partner.set_eligible(false);

        let failure = h
            .orchestrator
            .advance(id, StageInput::Provision)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, WorkflowError::Validation { .. }));
        assert!(failure.money_moved);
        assert!(failure.charge_reversed);
        assert!(!h.partner.calls().contains(&"place_order"));
        assert_eq!(h.credit(), Decimal::from(100));

        let wf = h.orchestrator.get_workflow_state(id).await.unwrap();
        assert_eq!(wf.terminal_outcome(), Some(TerminalOutcome::Failed));
        assert!(h.store.list_checkpoints().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_assignment_is_a_conflict() {
        let h = Harness::new(100);
        let id = h.charged().await;
        h.partner.set_duplicate(true);

        let failure = h
            .orchestrator
            .advance(id, StageInput::Provision)
            .await
            .unwrap_err();
        assert!(matches!(
            failure.error,
            WorkflowError::Conflict(ConflictKind::DuplicateAssignment { .. })
        ));
        assert!(failure.charge_reversed);
    }

    #[tokio::test(start_paused = true)]
    async fn partner_reported_failure_reverses_charge() {
        let h = Harness::new(100);
        h.partner.script_new_orders(&["pending", "failed"]);
        let id = h.charged().await;

        h.advance(id, StageInput::Provision).await;
        h.wait_for(id, |wf| wf.terminal_outcome() == Some(TerminalOutcome::Failed))
            .await;

        let wf = h.orchestrator.get_workflow_state(id).await.unwrap();
        assert!(wf.charge_reversed());
        assert_eq!(h.credit(), Decimal::from(100));
        let failure = wf.last_failure().unwrap();
        assert!(matches!(failure.error, WorkflowError::Partner { .. }));
        assert!(failure.is_safe_to_restart());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_timeout_leaves_charge_and_resumes_through_reconcile() {
        let config = WorkflowConfig {
            poller: PollerConfig {
                interval_ms: 5_000,
                max_attempts: 3,
            },
            ..WorkflowConfig::default()
        };
        let h = Harness::with_config(100, config);
        h.partner.script_new_orders(&["provisioning"]);
        let id = h.charged().await;

        h.advance(id, StageInput::Provision).await;
        h.wait_for(id, |wf| wf.last_failure().is_some()).await;

        let wf = h.orchestrator.get_workflow_state(id).await.unwrap();
        let failure = wf.last_failure().unwrap();
        assert_eq!(failure.error, WorkflowError::Timeout { attempts: 3 });
        assert_eq!(failure.resume_from, Some(Stage::Provisioning));
        assert!(!wf.charge_reversed());
        assert!(!wf.is_finished());
        assert_eq!(h.partner.status_fetches(&JobRef::new("ord-1")), 3);

        h.partner.script_job(&JobRef::new("ord-1"), &["ready"]);
        let wf = h.orchestrator.reconcile(id).await.unwrap();
        assert_eq!(wf.provisioning_job().unwrap().status.as_str(), "ready");
        assert!(wf.last_failure().is_none());

        h.advance(id, StageInput::Deliver).await;
        h.advance(id, StageInput::Persist).await;
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_waits_for_ready_job() {
        let h = Harness::new(100);
        h.partner.script_new_orders(&["pending"]);
        let id = h.charged().await;
        h.advance(id, StageInput::Provision).await;

        let failure = h
            .orchestrator
            .advance(id, StageInput::Deliver)
            .await
            .unwrap_err();
        assert!(matches!(
            failure.error,
            WorkflowError::Transition(TransitionError::JobNotReady { .. })
        ));
        assert!(h.outbox.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delivery_is_flagged_and_retried_later() {
        let h = Harness::new(100);
        h.outbox.fail_next(1);
        let id = h.charged().await;
        h.advance(id, StageInput::Provision).await;
        h.wait_ready(id).await;

        let wf = h.advance(id, StageInput::Deliver).await;
        assert!(wf.delivery_pending());
        let wf = h.advance(id, StageInput::Persist).await;
        assert_eq!(wf.terminal_outcome(), Some(TerminalOutcome::Success));

        let record_id = wf.record_id().unwrap().to_owned();
        assert!(!h.store.get_record(&record_id).unwrap().unwrap().delivered);

        let wf = h.orchestrator.retry_delivery(id).await.unwrap();
        assert!(!wf.delivery_pending());
        assert!(h.store.get_record(&record_id).unwrap().unwrap().delivered);
        assert_eq!(h.store.record_count(), 1);
        assert_eq!(h.outbox.sent().len(), 1);

        assert!(matches!(
            h.orchestrator.retry_delivery(id).await,
            Err(WorkflowError::Validation { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_retry_neither_recharges_nor_duplicates() {
        let h = Harness::new(100);
        let id = h.charged().await;
        h.advance(id, StageInput::Provision).await;
        h.wait_ready(id).await;
        h.advance(id, StageInput::Deliver).await;

        h.store.set_records_failing(true);
        let failure = h
            .orchestrator
            .advance(id, StageInput::Persist)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, WorkflowError::Persistence { .. }));
        assert_eq!(failure.resume_from, Some(Stage::Persistence));
        assert!(failure.money_moved);

        h.store.set_records_failing(false);
        h.advance(id, StageInput::Persist).await;
        assert_eq!(h.store.record_count(), 1);
        assert_eq!(h.ledger.entries().len(), 1);
        assert_eq!(h.partner.orders_placed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_is_all_or_nothing() {
        let h = Harness::new(100);
        let id = h.orchestrator.start_workflow(reseller()).unwrap().id();
        h.advance(id, intake(false)).await;
        h.advance(id, select("eu-5gb")).await;

        let wf = h.orchestrator.reset(id).await.unwrap();
        assert_eq!(wf.stage(), Stage::Intake);
        assert!(wf.client().is_none());
        assert!(wf.selected_bundle().is_none());

        h.advance(id, intake(false)).await;
        h.advance(id, select("eu-5gb")).await;
        h.advance(id, pay(0)).await;
        assert!(matches!(
            h.orchestrator.reset(id).await,
            Err(WorkflowError::Transition(TransitionError::ChargeLocked))
        ));
        let wf = h.orchestrator.get_workflow_state(id).await.unwrap();
        assert_eq!(wf.stage(), Stage::Provisioning);
        assert!(wf.charge_record().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn charged_workflow_resumes_after_restart() {
        let h = Harness::new(100);
        let id = h.charged().await;
        let before = h.orchestrator.get_workflow_state(id).await.unwrap();

        let restarted = h.restart(WorkflowConfig::default());
        assert_eq!(restarted.recover_workflows().await.unwrap(), vec![id]);
        let wf = restarted.resume(id).await.unwrap();
        assert_eq!(wf, before);

        let wf = restarted.advance(id, StageInput::Provision).await.unwrap();
        assert!(wf.provisioning_job().is_some());
        assert_eq!(h.ledger.entries().len(), 1);

        let history = restarted.history(id).unwrap();
        assert!(history
            .iter()
            .any(|e| matches!(e.event, WorkflowEvent::Resumed { stage: Stage::Provisioning })));
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_resubscribes_in_flight_jobs() {
        let mut h = Harness::new(100);
        h.partner.script_new_orders(&["pending", "pending", "ready"]);
        let id = h.charged().await;
        h.advance(id, StageInput::Provision).await;

        h.orchestrator = h.restart(WorkflowConfig::default());
        assert_eq!(h.orchestrator.recover_workflows().await.unwrap(), vec![id]);
        h.wait_ready(id).await;

        h.advance(id, StageInput::Deliver).await;
        h.advance(id, StageInput::Persist).await;
        assert_eq!(h.partner.orders_placed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandon_archives_and_reports_money() {
        let h = Harness::new(100);
        h.partner.script_new_orders(&["pending"]);
        let id = h.charged().await;
        h.advance(id, StageInput::Provision).await;
        let job = JobRef::new("ord-1");
        assert!(h.orchestrator.cancel_subscription(&job));

        let wf = h.orchestrator.abandon(id).await.unwrap();
        assert_eq!(wf.terminal_outcome(), Some(TerminalOutcome::Aborted));
        assert!(wf.money_moved());
        assert!(!wf.charge_reversed());
        assert!(h.store.list_checkpoints().unwrap().is_empty());
        assert!(matches!(
            h.orchestrator.abandon(id).await,
            Err(WorkflowError::Transition(TransitionError::Finished(
                TerminalOutcome::Aborted
            )))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn ui_subscription_shares_status_with_workflow() {
        let h = Harness::new(100);
        h.partner.script_new_orders(&["pending", "provisioning", "ready"]);
        let id = h.charged().await;
        h.advance(id, StageInput::Provision).await;

        let (sink, mut rx) = ChannelSink::new();
        h.orchestrator
            .subscribe_status(JobRef::new("ord-1"), Arc::new(sink));

        let mut terminal = Vec::new();
        while let Some(event) = rx.recv().await {
            if event.is_terminal() {
                terminal.push(event);
            }
        }
        assert_eq!(terminal.len(), 1);
        h.wait_ready(id).await;
    }

    fn slow_poll_config() -> WorkflowConfig {
        WorkflowConfig {
            poller: PollerConfig {
                interval_ms: 5_000,
                max_attempts: 3,
            },
            ..WorkflowConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ui_cancel_keeps_workflow_polling() {
        let h = Harness::with_config(100, slow_poll_config());
        h.partner.script_new_orders(&["provisioning"]);
        let id = h.charged().await;
        h.advance(id, StageInput::Provision).await;

        let job = JobRef::new("ord-1");
        let (sink, _rx) = ChannelSink::new();
        h.orchestrator.subscribe_status(job.clone(), Arc::new(sink));
        assert!(h.orchestrator.cancel_subscription(&job));

        h.wait_for(id, |wf| wf.last_failure().is_some()).await;
        let wf = h.orchestrator.get_workflow_state(id).await.unwrap();
        assert_eq!(
            wf.last_failure().unwrap().error,
            WorkflowError::Timeout { attempts: 3 }
        );
        assert_eq!(h.partner.status_fetches(&job), 3);
        assert!(!wf.charge_reversed());
    }

    #[tokio::test(start_paused = true)]
    async fn ui_resubscribes_do_not_extend_poll_budget() {
        let h = Harness::with_config(100, slow_poll_config());
        h.partner.script_new_orders(&["provisioning"]);
        let id = h.charged().await;
        let started = tokio::time::Instant::now();
        h.advance(id, StageInput::Provision).await;

        let job = JobRef::new("ord-1");
        for _ in 0..2 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            h.orchestrator
                .subscribe_status(job.clone(), Arc::new(ChannelSink::new().0));
        }

        h.wait_for(id, |wf| wf.last_failure().is_some()).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(h.partner.status_fetches(&job), 3);
        let wf = h.orchestrator.get_workflow_state(id).await.unwrap();
        assert_eq!(
            wf.last_failure().unwrap().error,
            WorkflowError::Timeout { attempts: 3 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_partner_failure_after_delivery_is_not_refunded() {
        let h = Harness::new(100);
        let id = h.charged().await;
        h.advance(id, StageInput::Provision).await;
        h.wait_ready(id).await;
        h.advance(id, StageInput::Deliver).await;
        h.store.set_records_failing(true);
        h.orchestrator
            .advance(id, StageInput::Persist)
            .await
            .unwrap_err();

        let job = JobRef::new("ord-1");
        h.partner.script_job(&job, &["expired"]);
        let (sink, mut rx) = ChannelSink::new();
        h.orchestrator.subscribe_status(job.clone(), Arc::new(sink));
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(matches!(events.last(), Some(StatusEvent::Failed { .. })));

        let wf = h.orchestrator.get_workflow_state(id).await.unwrap();
        assert_eq!(wf.stage(), Stage::Persistence);
        assert_eq!(wf.terminal_outcome(), None);
        assert!(!wf.charge_reversed());
        assert_eq!(credits_posted(&h.ledger), 0);
        assert_eq!(h.credit(), Decimal::new(4500, 2));

        h.store.set_records_failing(false);
        let wf = h.advance(id, StageInput::Persist).await;
        assert_eq!(wf.terminal_outcome(), Some(TerminalOutcome::Success));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_payments_share_one_balance() {
        let h = Harness::new(60);
        let mut ids = Vec::new();
        for _ in 0..2 {
            let id = h.orchestrator.start_workflow(reseller()).unwrap().id();
            h.advance(id, intake(false)).await;
            h.advance(id, select("eu-5gb")).await;
            ids.push(id);
        }

        let (a, b) = tokio::join!(
            h.orchestrator.advance(ids[0], pay(10)),
            h.orchestrator.advance(ids[1], pay(10)),
        );
        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
        assert!(outcomes.iter().any(|o| matches!(
            o,
            Err(WorkflowFailure {
                error: WorkflowError::InsufficientFunds { .. },
                ..
            })
        )));
        assert_eq!(h.credit(), Decimal::from(5));
    }

    #[tokio::test(start_paused = true)]
    async fn plans_come_from_partner_catalogue() {
        let h = Harness::new(100);
        let plans = h.orchestrator.list_plans().await.unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].id, BundleId::new("eu-5gb"));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_workflow_is_not_found() {
        let h = Harness::new(100);
        let missing = WorkflowId::new();
        assert!(matches!(
            h.orchestrator.get_workflow_state(missing).await,
            Err(WorkflowError::NotFound(_))
        ));
        let failure = h
            .orchestrator
            .advance(missing, StageInput::Provision)
            .await
            .unwrap_err();
        assert_eq!(failure.error, WorkflowError::NotFound(missing));
    }
}
