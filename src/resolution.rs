//! Client Resolution Engine
//!
//! Decides whether an intake refers to an existing client of this reseller,
//! a brand new client, or someone we are not allowed to touch. Runs before
//! any money moves or partner call is made.

use crate::{ClientRecord, ClientRegistry, NewClient, RegistryError, ResellerId};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("email pattern")
});
// `+`, country code and subscriber digits: at least ten digits in total.
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+[1-9][0-9]{9,14}$").expect("phone pattern"));

/// Raw client-intake fields as typed by the reseller
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientIntake {
    /// Full legal name
    pub full_name: Box<str>,
    /// Email address
    pub email: Box<str>,
    /// Phone number, `+` and country code first
    pub phone: Box<str>,
    /// Identity document number
    pub identity_document: Box<str>,
}

/// A single rejected field
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Name of the rejected field
    pub field: Box<str>,
    /// Why it was rejected
    pub message: Box<str>,
}

impl FieldError {
    fn new(field: &str, message: &str) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Outcome of resolving an intake
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ResolutionDecision {
    /// An existing record of this reseller is reused
    Reuse {
        /// Matched record
        client: ClientRecord,
        /// The client already has active bundles; the caller must confirm
        /// before continuing
        requires_confirmation: bool,
    },
    /// No match: a new record was registered
    Create {
        /// Freshly registered record
        client: ClientRecord,
    },
    /// The contact belongs to another reseller
    Blocked {
        /// Why the workflow may not use this contact
        reason: Box<str>,
    },
}

impl ResolutionDecision {
    /// Resolved record, unless blocked
    pub fn client(&self) -> Option<&ClientRecord> {
        match self {
            Self::Reuse { client, .. } | Self::Create { client } => Some(client),
            Self::Blocked { .. } => None,
        }
    }
}

/// Failure to resolve an intake
#[derive(Clone, Debug, thiserror::Error, Serialize, Deserialize)]
pub enum ResolutionError {
    /// One or more fields are malformed
    #[error("invalid intake: {}", join_fields(.0))]
    Validation(Vec<FieldError>),
    /// Registry could not be reached
    #[error("client registry unavailable: {0}")]
    RegistryUnavailable(Box<str>),
    /// Registry answered with an error
    #[error("client registry error: {0}")]
    Registry(Box<str>),
}

fn join_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<RegistryError> for ResolutionError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Unavailable(reason) => Self::RegistryUnavailable(reason),
            other => Self::Registry(other.to_string().into()),
        }
    }
}

/// Check intake field formats without touching the registry
pub fn validate_intake(intake: &ClientIntake) -> Result<(), Vec<FieldError>> {
    let mut errors = Vec::new();

    if intake.full_name.trim().chars().count() < 2 {
        errors.push(FieldError::new("full_name", "must be at least 2 characters"));
    }
    if !EMAIL_RE.is_match(intake.email.trim()) {
        errors.push(FieldError::new("email", "must be a valid email address"));
    }
    if !PHONE_RE.is_match(intake.phone.trim()) {
        errors.push(FieldError::new(
            "phone",
            "must be +<country code><number> with at least 10 digits",
        ));
    }
    if intake.identity_document.trim().chars().count() < 3 {
        errors.push(FieldError::new(
            "identity_document",
            "must be at least 3 characters",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Client Resolution Engine
pub struct ClientResolutionEngine {
    registry: Arc<dyn ClientRegistry>,
}

impl ClientResolutionEngine {
    /// Engine over `registry`
    pub fn new(registry: Arc<dyn ClientRegistry>) -> Self {
        Self { registry }
    }

    /// Resolve an intake for `reseller`.
    ///
    /// May register a new client; never merges or deletes records. Registry
    /// outages surface as `RegistryUnavailable` and are not retried here.
    pub async fn resolve(
        &self,
        reseller: &ResellerId,
        intake: &ClientIntake,
    ) -> Result<ResolutionDecision, ResolutionError> {
        validate_intake(intake).map_err(ResolutionError::Validation)?;

        let email = intake.email.trim();
        let phone = intake.phone.trim();

        let existing = self.registry.lookup_by_contact(email, phone).await?;

        let decision = match existing {
            Some(record) if &record.owning_reseller != reseller => {
                tracing::warn!(
                    reseller = %reseller,
                    client_ref = %record.client_ref,
                    "Contact belongs to another reseller"
                );
                ResolutionDecision::Blocked {
                    reason: "client is registered under a different reseller".into(),
                }
            }
            Some(record) => {
                let requires_confirmation = record.active_bundle_count() > 0;
                ResolutionDecision::Reuse {
                    client: record,
                    requires_confirmation,
                }
            }
            None => {
                let client = self
                    .registry
                    .create(NewClient {
                        full_name: intake.full_name.trim().into(),
                        email: email.into(),
                        phone: phone.into(),
                        identity_document: intake.identity_document.trim().into(),
                        owning_reseller: reseller.clone(),
                    })
                    .await?;
                tracing::info!(reseller = %reseller, client_ref = %client.client_ref, "Registered new client");
                ResolutionDecision::Create { client }
            }
        };

        Ok(decision)
    }
}
