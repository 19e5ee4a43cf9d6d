//! Credential delivery channel

use crate::{ProvisioningJob, ResolvedClient, WorkflowId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// What the end client receives once the eSIM is ready
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CredentialsPayload {
    /// Workflow that produced the eSIM
    pub workflow_id: WorkflowId,
    /// Recipient name
    pub client_name: Box<str>,
    /// Recipient email
    pub email: Box<str>,
    /// Recipient phone
    pub phone: Box<str>,
    /// Human-readable bundle name
    pub bundle_name: Box<str>,
    /// eSIM identifier
    pub iccid: Box<str>,
    /// SM-DP+ server address
    pub smdp_address: Box<str>,
    /// Activation code
    pub matching_id: Box<str>,
    /// LPA string for QR rendering
    pub qr_code: Option<Box<str>>,
    /// When the eSIM stops working
    pub expires_at: DateTime<Utc>,
}

impl CredentialsPayload {
    /// Assemble the payload from workflow artifacts
    pub fn new(
        workflow_id: WorkflowId,
        client: &ResolvedClient,
        bundle_name: &str,
        job: &ProvisioningJob,
    ) -> Self {
        Self {
            workflow_id,
            client_name: client.full_name.clone(),
            email: client.email.clone(),
            phone: client.phone.clone(),
            bundle_name: bundle_name.into(),
            iccid: job.iccid.clone(),
            smdp_address: job.activation.smdp_address.clone(),
            matching_id: job.activation.matching_id.clone(),
            qr_code: job.activation.qr_code.clone(),
            expires_at: job.expires_at,
        }
    }
}

/// Failure to deliver credentials
#[derive(Clone, Debug, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum NotifyError {
    /// Channel could not be reached
    #[error("notification channel unreachable: {reason}")]
    Unreachable {
        /// Transport error
        reason: Box<str>,
    },
    /// Channel refused the message
    #[error("notification rejected: {reason}")]
    Rejected {
        /// Channel explanation
        reason: Box<str>,
    },
}

/// Outbound channel (email, SMS, ...) for activation credentials
#[async_trait]
pub trait NotificationSender: Send + Sync + 'static {
    /// Send `payload` to the client once; retries are the caller's concern
    async fn send_credentials(&self, payload: &CredentialsPayload) -> Result<(), NotifyError>;
}

/// Records sent payloads; can be told to fail
pub struct InMemoryOutbox {
    sent: Mutex<Vec<CredentialsPayload>>,
    failures_left: Mutex<u32>,
}

impl InMemoryOutbox {
    /// Empty outbox that delivers everything
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failures_left: Mutex::new(0),
        }
    }

    /// Fail the next `count` sends
    pub fn fail_next(&self, count: u32) {
        if let Ok(mut left) = self.failures_left.lock() {
            *left = count;
        }
    }

    /// Payloads delivered so far
    pub fn sent(&self) -> Vec<CredentialsPayload> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Default for InMemoryOutbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSender for InMemoryOutbox {
    async fn send_credentials(&self, payload: &CredentialsPayload) -> Result<(), NotifyError> {
        {
            let mut left = self.failures_left.lock().map_err(|e| NotifyError::Unreachable {
                reason: e.to_string().into(),
            })?;
            if *left > 0 {
                *left -= 1;
                return Err(NotifyError::Unreachable {
                    reason: "smtp relay refused connection".into(),
                });
            }
        }
        self.sent
            .lock()
            .map_err(|e| NotifyError::Unreachable {
                reason: e.to_string().into(),
            })?
            .push(payload.clone());
        Ok(())
    }
}
