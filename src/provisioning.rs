//! Provisioning Coordinator
//!
//! Three partner round-trips in strict order: eligibility, duplicate check,
//! order placement. Only the last one has a partner-side effect, and a
//! transport failure on it is reported as an unknown outcome rather than a
//! failure.

use crate::{
    ActivationPayload, Bundle, ChargeRecord, ClientRef, IdempotencyKey, JobRef, JobStatus,
    OrderReceipt, OrderRequest, PartnerApi, PartnerCallError, WorkflowId,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Partner-side unit of work for one workflow
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningJob {
    /// Partner order reference
    pub job_ref: JobRef,
    /// Key the order was placed with
    pub order_key: IdempotencyKey,
    /// Last status seen
    pub status: JobStatus,
    /// eSIM identifier
    pub iccid: Box<str>,
    /// Activation material
    pub activation: ActivationPayload,
    /// Partner expiry, or `submitted_at + validity_days` when omitted
    pub expires_at: DateTime<Utc>,
    /// When the order was accepted
    pub submitted_at: DateTime<Utc>,
}

/// Provisioning failure
#[derive(Clone, Debug, thiserror::Error, Serialize, Deserialize)]
pub enum ProvisioningError {
    /// Partner says the contact cannot take the bundle
    #[error("client is not eligible: {reason}")]
    ValidationFailed {
        /// Partner explanation
        reason: Box<str>,
    },
    /// Contact already holds the bundle
    #[error("bundle {bundle} is already assigned to this contact")]
    DuplicateAssignment {
        /// Bundle already assigned
        bundle: Box<str>,
    },
    /// Explicit rejection, or a failure before the order call was made
    #[error("partner error: {reason}")]
    Partner {
        /// Partner or transport error
        reason: Box<str>,
    },
    /// The order call may have been accepted; reconcile before compensating
    #[error("order outcome unknown: {reason}")]
    UnknownOutcome {
        /// What the order call failed with
        reason: Box<str>,
    },
}

impl ProvisioningError {
    /// No order exists partner-side, so the charge can be reversed at once
    pub fn order_confirmed_absent(&self) -> bool {
        !matches!(self, Self::UnknownOutcome { .. })
    }
}

/// Provisioning Coordinator
pub struct ProvisioningCoordinator {
    partner: Arc<dyn PartnerApi>,
    allow_multiple_active: bool,
}

impl ProvisioningCoordinator {
    /// Coordinator over `partner`
    pub fn new(partner: Arc<dyn PartnerApi>, allow_multiple_active: bool) -> Self {
        Self {
            partner,
            allow_multiple_active,
        }
    }

    /// Submit one order for `client_ref` and `bundle`, paid by `charge`
    pub async fn submit(
        &self,
        workflow_id: WorkflowId,
        client_ref: &ClientRef,
        contact: &str,
        bundle: &Bundle,
        charge: &ChargeRecord,
    ) -> Result<ProvisioningJob, ProvisioningError> {
        let eligibility = self
            .partner
            .validate_eligibility(contact, &bundle.id)
            .await
            .map_err(pre_order_error)?;
        if !eligibility.eligible {
            return Err(ProvisioningError::ValidationFailed {
                reason: eligibility
                    .reason
                    .unwrap_or_else(|| "partner reported contact ineligible".into()),
            });
        }
        if eligibility.active_bundles > 0 && !self.allow_multiple_active {
            return Err(ProvisioningError::ValidationFailed {
                reason: format!(
                    "contact already carries {} active bundle(s)",
                    eligibility.active_bundles
                )
                .into(),
            });
        }

        // Second, independent check to catch an assignment that raced in
        // after eligibility was granted.
        let duplicate = self
            .partner
            .check_duplicate(contact, &bundle.id)
            .await
            .map_err(pre_order_error)?;
        if duplicate {
            return Err(ProvisioningError::DuplicateAssignment {
                bundle: bundle.id.as_str().into(),
            });
        }

        let order_key = IdempotencyKey::for_order(workflow_id);
        let request = OrderRequest {
            order_key: order_key.clone(),
            bundle_id: bundle.id.clone(),
            client_ref: client_ref.clone(),
            contact: contact.into(),
            charge_ref: charge.charge_ref.clone(),
            amount: charge.amount,
            currency: charge.currency.clone(),
        };

        let receipt = match self.partner.place_order(&request).await {
            Ok(receipt) => receipt,
            Err(err) if err.is_ambiguous() => {
                tracing::error!(
                    workflow_id = %workflow_id,
                    order_key = %order_key,
                    error = %err,
                    "Order call failed with unknown outcome"
                );
                return Err(ProvisioningError::UnknownOutcome {
                    reason: err.to_string().into(),
                });
            }
            Err(err) => {
                return Err(ProvisioningError::Partner {
                    reason: err.to_string().into(),
                })
            }
        };

        let job = job_from_receipt(receipt, order_key, bundle, Utc::now());
        tracing::info!(
            workflow_id = %workflow_id,
            job_ref = %job.job_ref,
            status = %job.status,
            "Order accepted by partner"
        );
        Ok(job)
    }

    /// Reconciliation query: find the order placed for `workflow_id`, if any
    pub async fn lookup(
        &self,
        workflow_id: WorkflowId,
        bundle: &Bundle,
    ) -> Result<Option<ProvisioningJob>, PartnerCallError> {
        let order_key = IdempotencyKey::for_order(workflow_id);
        let found = self.partner.find_order(&order_key).await?;
        Ok(found.map(|receipt| job_from_receipt(receipt, order_key, bundle, Utc::now())))
    }

    /// Single authoritative status read
    pub async fn status(&self, job_ref: &JobRef) -> Result<JobStatus, PartnerCallError> {
        self.partner.get_status(job_ref).await
    }
}

fn pre_order_error(err: PartnerCallError) -> ProvisioningError {
    // Nothing was ordered yet, so even a timeout here is a clean failure.
    ProvisioningError::Partner {
        reason: err.to_string().into(),
    }
}

fn job_from_receipt(
    receipt: OrderReceipt,
    order_key: IdempotencyKey,
    bundle: &Bundle,
    now: DateTime<Utc>,
) -> ProvisioningJob {
    let expires_at = receipt
        .expires_at
        .unwrap_or_else(|| now + Duration::days(i64::from(bundle.validity_days)));
    ProvisioningJob {
        job_ref: receipt.order_ref,
        order_key,
        status: receipt.status,
        iccid: receipt.iccid,
        activation: receipt.activation,
        expires_at,
        submitted_at: now,
    }
}
