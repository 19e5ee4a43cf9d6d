//! Client registry collaborator

use crate::{BundleId, ClientRef, ResellerId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

/// Client record as owned by the external registry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Registry reference
    pub client_ref: ClientRef,
    /// Full legal name
    pub full_name: Box<str>,
    /// Email address
    pub email: Box<str>,
    /// Phone number in E.164 form
    pub phone: Box<str>,
    /// Identity document number
    pub identity_document: Box<str>,
    /// Reseller that owns this client
    pub owning_reseller: ResellerId,
    /// Bundles currently active for this client
    pub active_bundles: Vec<BundleId>,
}

impl ClientRecord {
    /// Number of active bundles
    pub fn active_bundle_count(&self) -> usize {
        self.active_bundles.len()
    }
}

/// Registration payload for a new client
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewClient {
    /// Full legal name
    pub full_name: Box<str>,
    /// Email address
    pub email: Box<str>,
    /// Phone number in E.164 form
    pub phone: Box<str>,
    /// Identity document number
    pub identity_document: Box<str>,
    /// Reseller registering the client
    pub owning_reseller: ResellerId,
}

/// Registry failure
#[derive(Clone, Debug, thiserror::Error, Serialize, Deserialize)]
pub enum RegistryError {
    /// Registry could not be reached; callers may retry
    #[error("client registry unavailable: {0}")]
    Unavailable(Box<str>),
    /// No record with that reference
    #[error("client not found: {0}")]
    NotFound(ClientRef),
    /// Registry refused the request
    #[error("registry rejected request: {0}")]
    Rejected(Box<str>),
}

/// Client registry contract
#[async_trait]
pub trait ClientRegistry: Send + Sync + 'static {
    /// Find a record whose email or phone matches
    async fn lookup_by_contact(
        &self,
        email: &str,
        phone: &str,
    ) -> Result<Option<ClientRecord>, RegistryError>;

    /// Register a new client
    async fn create(&self, client: NewClient) -> Result<ClientRecord, RegistryError>;

    /// Record by reference
    async fn fetch(&self, client_ref: &ClientRef) -> Result<ClientRecord, RegistryError>;
}

/// In-memory registry for testing
pub struct InMemoryRegistry {
    data: RwLock<Vec<ClientRecord>>,
    counter: AtomicU64,
    reachable: AtomicBool,
}

impl InMemoryRegistry {
    /// Empty registry, reachable
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Vec::new()),
            counter: AtomicU64::new(1),
            reachable: AtomicBool::new(true),
        }
    }

    /// Seed an existing record
    pub fn insert(&self, record: ClientRecord) {
        if let Ok(mut data) = self.data.write() {
            data.push(record);
        }
    }

    /// Simulate the registry going offline (or coming back)
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    /// No records stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_reachable(&self) -> Result<(), RegistryError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RegistryError::Unavailable("registry offline".into()))
        }
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientRegistry for InMemoryRegistry {
    async fn lookup_by_contact(
        &self,
        email: &str,
        phone: &str,
    ) -> Result<Option<ClientRecord>, RegistryError> {
        self.ensure_reachable()?;
        let data = self
            .data
            .read()
            .map_err(|e| RegistryError::Unavailable(e.to_string().into()))?;
        Ok(data
            .iter()
            .find(|r| r.email.eq_ignore_ascii_case(email) || &*r.phone == phone)
            .cloned())
    }

    async fn create(&self, client: NewClient) -> Result<ClientRecord, RegistryError> {
        self.ensure_reachable()?;
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let record = ClientRecord {
            client_ref: ClientRef::new(format!("cli-{seq}")),
            full_name: client.full_name,
            email: client.email,
            phone: client.phone,
            identity_document: client.identity_document,
            owning_reseller: client.owning_reseller,
            active_bundles: Vec::new(),
        };
        let mut data = self
            .data
            .write()
            .map_err(|e| RegistryError::Unavailable(e.to_string().into()))?;
        data.push(record.clone());
        Ok(record)
    }

    async fn fetch(&self, client_ref: &ClientRef) -> Result<ClientRecord, RegistryError> {
        self.ensure_reachable()?;
        let data = self
            .data
            .read()
            .map_err(|e| RegistryError::Unavailable(e.to_string().into()))?;
        data.iter()
            .find(|r| &r.client_ref == client_ref)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(client_ref.clone()))
    }
}
