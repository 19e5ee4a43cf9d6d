//! Error types for the assignment workflow

use crate::{
    ChargeError, FieldError, LedgerError, ProvisioningError, ResolutionError, Stage,
    TransitionError, WorkflowId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Conflicts that need a human decision
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ConflictKind {
    /// Contact is owned by a different reseller
    OwnedByOtherReseller {
        /// Explanation safe to show the reseller
        reason: Box<str>,
    },
    /// Existing client has active bundles and the caller did not confirm
    ConfirmationRequired {
        /// Bundles the client already holds
        active_bundles: u32,
    },
    /// Confirmed, but policy forbids a second active bundle
    MultipleActiveNotAllowed {
        /// Bundles the client already holds
        active_bundles: u32,
    },
    /// Partner already has this bundle on this contact
    DuplicateAssignment {
        /// Bundle already assigned
        bundle: Box<str>,
    },
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OwnedByOtherReseller { reason } => write!(f, "ownership conflict: {reason}"),
            Self::ConfirmationRequired { active_bundles } => write!(
                f,
                "client already has {active_bundles} active bundle(s); confirmation required"
            ),
            Self::MultipleActiveNotAllowed { active_bundles } => write!(
                f,
                "client already has {active_bundles} active bundle(s) and multiple active bundles are disabled"
            ),
            Self::DuplicateAssignment { bundle } => {
                write!(f, "bundle {bundle} is already assigned to this client")
            }
        }
    }
}

/// Workflow-level error taxonomy
#[derive(Clone, Debug, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum WorkflowError {
    /// Bad input; nothing happened, the user can correct it
    #[error("validation error: {message}")]
    Validation {
        /// Summary
        message: Box<str>,
        /// Per-field problems, possibly empty
        fields: Vec<FieldError>,
    },
    /// Needs a human decision before continuing
    #[error("conflict: {0}")]
    Conflict(ConflictKind),
    /// Available credit does not cover the charge; nothing was debited
    #[error("insufficient funds: short by {shortfall}")]
    InsufficientFunds {
        /// Amount missing
        shortfall: Decimal,
    },
    /// Order call failed after it may have been accepted. Never retried
    /// blindly; reconcile first.
    #[error("partner outcome unknown: {reason}")]
    PartnerUnknownOutcome {
        /// What the call failed with
        reason: Box<str>,
    },
    /// Partner refused, or reported the job failed
    #[error("partner error: {reason}")]
    Partner {
        /// Partner explanation
        reason: Box<str>,
    },
    /// Status polling ran out of attempts; the job may still finish
    #[error("provisioning did not finish after {attempts} status checks")]
    Timeout {
        /// Status checks made
        attempts: u32,
    },
    /// Credentials could not be sent
    #[error("delivery failed: {reason}")]
    Delivery {
        /// What the channel failed with
        reason: Box<str>,
    },
    /// Checkpoint or record write failed
    #[error("persistence failed: {reason}")]
    Persistence {
        /// Store error
        reason: Box<str>,
    },
    /// Client registry could not be reached
    #[error("client registry unavailable: {reason}")]
    RegistryUnavailable {
        /// Registry error
        reason: Box<str>,
    },
    /// Ledger failed for a reason other than funds
    #[error("ledger error: {reason}")]
    Ledger {
        /// Ledger error
        reason: Box<str>,
    },
    /// Call made at the wrong point of the pipeline; nothing changed
    #[error(transparent)]
    Transition(TransitionError),
    /// No such workflow, loaded or checkpointed
    #[error("workflow not found: {0}")]
    NotFound(WorkflowId),
}

impl WorkflowError {
    /// Validation error without field details
    pub fn validation(message: impl Into<Box<str>>) -> Self {
        Self::Validation {
            message: message.into(),
            fields: Vec::new(),
        }
    }

    /// Retrying the same call later may succeed without user action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RegistryUnavailable { .. }
                | Self::Ledger { .. }
                | Self::Delivery { .. }
                | Self::Persistence { .. }
        )
    }
}

impl From<TransitionError> for WorkflowError {
    fn from(err: TransitionError) -> Self {
        Self::Transition(err)
    }
}

impl From<ResolutionError> for WorkflowError {
    fn from(err: ResolutionError) -> Self {
        match err {
            ResolutionError::Validation(fields) => Self::Validation {
                message: "client intake rejected".into(),
                fields,
            },
            ResolutionError::RegistryUnavailable(reason) => Self::RegistryUnavailable { reason },
            ResolutionError::Registry(reason) => Self::RegistryUnavailable { reason },
        }
    }
}

impl From<ChargeError> for WorkflowError {
    fn from(err: ChargeError) -> Self {
        match err {
            ChargeError::InsufficientFunds { shortfall } => Self::InsufficientFunds { shortfall },
            ChargeError::Ledger(LedgerError::Insufficient { available }) => Self::Ledger {
                reason: format!("insufficient credit ({available} available)").into(),
            },
            ChargeError::Ledger(other) => Self::Ledger {
                reason: other.to_string().into(),
            },
        }
    }
}

impl From<ProvisioningError> for WorkflowError {
    fn from(err: ProvisioningError) -> Self {
        match err {
            ProvisioningError::ValidationFailed { reason } => Self::validation(reason),
            ProvisioningError::DuplicateAssignment { bundle } => {
                Self::Conflict(ConflictKind::DuplicateAssignment { bundle })
            }
            ProvisioningError::Partner { reason } => Self::Partner { reason },
            ProvisioningError::UnknownOutcome { reason } => Self::PartnerUnknownOutcome { reason },
        }
    }
}

/// A failed stage, with what the caller needs to decide how to continue
#[derive(Clone, Debug, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("workflow {workflow_id} failed at {stage:?}: {error}")]
pub struct WorkflowFailure {
    /// Workflow that failed
    pub workflow_id: WorkflowId,
    /// Stage the failure happened in
    pub stage: Stage,
    /// What went wrong
    pub error: WorkflowError,
    /// A debit has been confirmed for this workflow
    pub money_moved: bool,
    /// The debit has been compensated by a credit
    pub charge_reversed: bool,
    /// Where to pick up again; `None` means the workflow is over
    pub resume_from: Option<Stage>,
}

impl WorkflowFailure {
    /// Starting a brand new workflow cannot double-charge or double-provision
    pub fn is_safe_to_restart(&self) -> bool {
        !self.money_moved || self.charge_reversed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_errors_map_onto_taxonomy() {
        let unknown: WorkflowError = ProvisioningError::UnknownOutcome {
            reason: "timeout".into(),
        }
        .into();
        assert!(matches!(unknown, WorkflowError::PartnerUnknownOutcome { .. }));

        let duplicate: WorkflowError = ProvisioningError::DuplicateAssignment {
            bundle: "eu-5gb".into(),
        }
        .into();
        assert!(matches!(
            duplicate,
            WorkflowError::Conflict(ConflictKind::DuplicateAssignment { .. })
        ));
    }

    #[test]
    fn restart_safety_follows_money() {
        let mut failure = WorkflowFailure {
            workflow_id: WorkflowId::new(),
            stage: Stage::Provisioning,
            error: WorkflowError::PartnerUnknownOutcome {
                reason: "timeout".into(),
            },
            money_moved: true,
            charge_reversed: false,
            resume_from: Some(Stage::Provisioning),
        };
        assert!(!failure.is_safe_to_restart());

        failure.charge_reversed = true;
        assert!(failure.is_safe_to_restart());
    }
}
