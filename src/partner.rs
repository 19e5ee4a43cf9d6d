//! Partner provisioning API contract

use crate::{BundleId, ClientRef, IdempotencyKey, JobRef};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A purchasable connectivity plan
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    /// Partner bundle id
    pub id: BundleId,
    /// Display name
    pub name: Box<str>,
    /// Base price before reseller markup
    pub price: Decimal,
    /// Currency of `price`
    pub currency: Box<str>,
    /// Days the bundle stays valid after activation
    pub validity_days: u32,
    /// Covered country codes
    pub countries: Vec<Box<str>>,
    /// Covered regions
    pub regions: Vec<Box<str>>,
}

/// Partner-reported job status, kept verbatim.
///
/// Interpretation is delegated to [`crate::StatusClassification`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobStatus(pub Box<str>);

impl JobStatus {
    /// Wrap a raw partner status
    pub fn new(status: impl Into<Box<str>>) -> Self {
        Self(status.into())
    }

    /// Raw partner status
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobStatus({})", self.0)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Eligibility verdict for a contact identifier
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Eligibility {
    /// Whether the partner will provision this contact
    pub eligible: bool,
    /// Bundles the partner already has active for this contact
    pub active_bundles: u32,
    /// Partner explanation when not eligible
    pub reason: Option<Box<str>>,
}

/// Activation material handed to the end client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivationPayload {
    /// SM-DP+ server address
    pub smdp_address: Box<str>,
    /// Activation code
    pub matching_id: Box<str>,
    /// LPA string for QR rendering
    pub qr_code: Option<Box<str>>,
}

/// Order placement request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Lets the partner deduplicate and lets us find the order again
    pub order_key: IdempotencyKey,
    /// Bundle to provision
    pub bundle_id: BundleId,
    /// Client receiving the eSIM
    pub client_ref: ClientRef,
    /// Contact identifier the partner keys on
    pub contact: Box<str>,
    /// Ledger reference of the paying charge
    pub charge_ref: Box<str>,
    /// Amount charged
    pub amount: Decimal,
    /// Currency of `amount`
    pub currency: Box<str>,
}

/// Partner acknowledgement of an accepted order
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderReceipt {
    /// Partner job reference, polled for status
    pub order_ref: JobRef,
    /// eSIM identifier
    pub iccid: Box<str>,
    /// Activation material
    pub activation: ActivationPayload,
    /// Status at acceptance
    pub status: JobStatus,
    /// Partner expiry, when given
    pub expires_at: Option<DateTime<Utc>>,
}

/// Failure of a single partner round-trip
#[derive(Clone, Debug, thiserror::Error, Serialize, Deserialize)]
pub enum PartnerCallError {
    /// The partner answered and refused
    #[error("partner rejected request: {reason}")]
    Rejected {
        /// Partner's explanation
        reason: Box<str>,
    },
    /// No answer within the deadline
    #[error("partner call timed out")]
    Timeout,
    /// Connection-level failure
    #[error("partner transport error: {reason}")]
    Transport {
        /// Underlying error text
        reason: Box<str>,
    },
}

impl PartnerCallError {
    /// The partner may have acted on the request even though we saw an error
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transport { .. })
    }
}

/// Partner provisioning API.
///
/// Every method is one round-trip. `place_order` is the only call with a
/// partner-side effect and is not safely retryable.
#[async_trait]
pub trait PartnerApi: Send + Sync + 'static {
    /// Catalogue of bundles currently on sale
    async fn list_bundles(&self) -> Result<Vec<Bundle>, PartnerCallError>;

    /// Whether the partner will provision `bundle_id` for `contact`
    async fn validate_eligibility(
        &self,
        contact: &str,
        bundle_id: &BundleId,
    ) -> Result<Eligibility, PartnerCallError>;

    /// `true` when this contact already holds (or is being assigned) the bundle
    async fn check_duplicate(
        &self,
        contact: &str,
        bundle_id: &BundleId,
    ) -> Result<bool, PartnerCallError>;

    /// Place the order; a timeout here leaves the outcome unknown
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderReceipt, PartnerCallError>;

    /// Current status of an accepted order
    async fn get_status(&self, order_ref: &JobRef) -> Result<JobStatus, PartnerCallError>;

    /// Reconciliation lookup by the key the order was placed with
    async fn find_order(
        &self,
        order_key: &IdempotencyKey,
    ) -> Result<Option<OrderReceipt>, PartnerCallError>;
}
