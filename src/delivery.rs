//! Credential delivery and assignment persistence

use crate::{
    AssignmentRecord, CredentialsPayload, NotificationSender, NotifyError, PersistedRecord,
    RetryPolicy, StoreError, TransitionError, WorkflowInstance, WorkflowStore,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Result of one delivery run
#[derive(Clone, Debug, PartialEq)]
pub enum DeliveryOutcome {
    /// Credentials were accepted by the channel
    Delivered {
        /// Sends tried
        attempts: u32,
    },
    /// Every send failed
    Failed {
        /// Sends tried
        attempts: u32,
        /// Last channel error
        reason: Box<str>,
    },
}

impl DeliveryOutcome {
    /// Credentials reached the client
    pub fn delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Failure to write the assignment record
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Workflow lacks an artifact the record needs
    #[error(transparent)]
    Incomplete(#[from] TransitionError),
    /// Store write failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Last two pipeline steps: tell the client, then write the record
pub struct DeliveryStage {
    notifier: Arc<dyn NotificationSender>,
    store: Arc<dyn WorkflowStore>,
    retry: RetryPolicy,
}

impl DeliveryStage {
    /// Delivery through `notifier`, records into `store`
    pub fn new(
        notifier: Arc<dyn NotificationSender>,
        store: Arc<dyn WorkflowStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            notifier,
            store,
            retry,
        }
    }

    fn payload(instance: &WorkflowInstance) -> Result<CredentialsPayload, TransitionError> {
        let missing = |what: &str| TransitionError::MissingArtifact(what.into());
        let client = instance.client().ok_or_else(|| missing("client_ref"))?;
        let bundle = instance
            .selected_bundle()
            .ok_or_else(|| missing("selected_bundle"))?;
        let job = instance
            .provisioning_job()
            .ok_or_else(|| missing("provisioning_job"))?;
        Ok(CredentialsPayload::new(instance.id(), client, &bundle.name, job))
    }

    /// Single attempt, used inline by the pipeline
    pub async fn deliver(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<DeliveryOutcome, TransitionError> {
        let payload = Self::payload(instance)?;
        Ok(match self.notifier.send_credentials(&payload).await {
            Ok(()) => DeliveryOutcome::Delivered { attempts: 1 },
            Err(err) => {
                tracing::warn!(workflow_id = %instance.id(), error = %err, "Credential delivery failed");
                DeliveryOutcome::Failed {
                    attempts: 1,
                    reason: err.to_string().into(),
                }
            }
        })
    }

    /// Independent redelivery with backoff; never touches the charge or job
    pub async fn redeliver(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<DeliveryOutcome, TransitionError> {
        let payload = Self::payload(instance)?;
        let total = self.retry.max_attempts.max(1);
        let mut last: Option<NotifyError> = None;

        for attempt in 1..=total {
            if attempt > 1 {
                tokio::time::sleep(self.retry.delay_for_attempt(attempt - 1)).await;
            }
            match self.notifier.send_credentials(&payload).await {
                Ok(()) => return Ok(DeliveryOutcome::Delivered { attempts: attempt }),
                Err(err) => {
                    tracing::debug!(workflow_id = %instance.id(), attempt, error = %err, "Redelivery attempt failed");
                    last = Some(err);
                }
            }
        }

        Ok(DeliveryOutcome::Failed {
            attempts: total,
            reason: last
                .map(|e| e.to_string().into())
                .unwrap_or_else(|| "no attempt made".into()),
        })
    }

    /// Upsert the assignment record; repeated calls update the same row
    pub fn persist(
        &self,
        instance: &WorkflowInstance,
        now: DateTime<Utc>,
    ) -> Result<PersistedRecord, PersistError> {
        let record = AssignmentRecord::from_instance(instance, now)?;
        let persisted = self.store.upsert_record(&record)?;
        tracing::debug!(
            workflow_id = %instance.id(),
            record_id = %persisted.record_id,
            created = persisted.created,
            "Assignment record persisted"
        );
        Ok(persisted)
    }
}
