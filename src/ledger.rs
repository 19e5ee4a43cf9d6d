//! Balance ledger collaborator

use crate::{IdempotencyKey, ResellerId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Direction of a ledger entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Charge against the reseller
    Debit,
    /// Compensating credit; never an edit of the original debit
    Credit,
}

/// One append-only ledger line
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Ledger-assigned reference, `le-{n}`
    pub entry_ref: Box<str>,
    /// Account the entry posts to
    pub reseller: ResellerId,
    /// Debit or credit
    pub kind: EntryKind,
    /// Amount moved
    pub amount: Decimal,
    /// Key that makes the posting idempotent
    pub key: IdempotencyKey,
    /// Reason given for a credit
    pub reason: Option<Box<str>>,
    /// When the entry was posted
    pub posted_at: DateTime<Utc>,
}

/// Confirmation of a posted entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PostingReceipt {
    /// Reference of the posted entry
    pub entry_ref: Box<str>,
    /// Amount moved
    pub amount: Decimal,
    /// When the entry was posted
    pub posted_at: DateTime<Utc>,
    /// Available credit right after the posting
    pub available_after: Decimal,
}

/// Ledger failure
#[derive(Clone, Debug, thiserror::Error, Serialize, Deserialize)]
pub enum LedgerError {
    /// Checked atomically with the debit itself
    #[error("insufficient credit: {available} available")]
    Insufficient {
        /// Credit available at the time of the check
        available: Decimal,
    },
    /// No account for the reseller
    #[error("unknown reseller: {0}")]
    UnknownReseller(ResellerId),
    /// Ledger could not be reached
    #[error("ledger unavailable: {0}")]
    Unavailable(Box<str>),
}

/// Balance ledger contract.
///
/// `debit` must check sufficiency and post in one atomic step so concurrent
/// debits for the same reseller can never overdraw.
#[async_trait]
pub trait BalanceLedger: Send + Sync + 'static {
    /// `current_credit - pending_holds`
    async fn available_credit(&self, reseller: &ResellerId) -> Result<Decimal, LedgerError>;

    /// Replaying a key returns the original receipt without posting again
    async fn debit(
        &self,
        reseller: &ResellerId,
        amount: Decimal,
        key: &IdempotencyKey,
    ) -> Result<PostingReceipt, LedgerError>;

    /// Receipt already posted under `key`, if any
    async fn find_posting(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<PostingReceipt>, LedgerError>;

    /// Post a compensating credit
    async fn credit(
        &self,
        reseller: &ResellerId,
        amount: Decimal,
        key: &IdempotencyKey,
        reason: &str,
    ) -> Result<PostingReceipt, LedgerError>;
}

#[derive(Clone, Copy, Debug, Default)]
struct Account {
    credit: Decimal,
    holds: Decimal,
}

impl Account {
    fn available(&self) -> Decimal {
        self.credit - self.holds
    }
}

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<ResellerId, Account>,
    entries: Vec<LedgerEntry>,
    by_key: HashMap<IdempotencyKey, PostingReceipt>,
}

/// In-memory single-writer ledger for testing
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    reachable: AtomicBool,
}

impl InMemoryLedger {
    /// Empty ledger, reachable
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            reachable: AtomicBool::new(true),
        }
    }

    /// Open (or overwrite) an account
    pub fn open_account(&self, reseller: ResellerId, credit: Decimal, holds: Decimal) {
        if let Ok(mut state) = self.state.lock() {
            state.accounts.insert(reseller, Account { credit, holds });
        }
    }

    /// Simulate the ledger going offline (or coming back)
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Every posted entry, oldest first
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.state
            .lock()
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }

    /// Credit of `reseller`, ignoring holds
    pub fn current_credit(&self, reseller: &ResellerId) -> Option<Decimal> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.accounts.get(reseller).map(|a| a.credit))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LedgerState>, LedgerError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("ledger offline".into()));
        }
        self.state
            .lock()
            .map_err(|e| LedgerError::Unavailable(e.to_string().into()))
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerState {
    fn post(
        &mut self,
        reseller: &ResellerId,
        kind: EntryKind,
        amount: Decimal,
        key: &IdempotencyKey,
        reason: Option<&str>,
    ) -> Result<PostingReceipt, LedgerError> {
        if let Some(receipt) = self.by_key.get(key) {
            return Ok(receipt.clone());
        }

        let account = self
            .accounts
            .get_mut(reseller)
            .ok_or_else(|| LedgerError::UnknownReseller(reseller.clone()))?;

        match kind {
            EntryKind::Debit => {
                let available = account.available();
                if amount > available {
                    return Err(LedgerError::Insufficient { available });
                }
                account.credit -= amount;
            }
            EntryKind::Credit => account.credit += amount,
        }

        let posted_at = Utc::now();
        let entry_ref: Box<str> = format!("le-{}", self.entries.len() + 1).into();
        let receipt = PostingReceipt {
            entry_ref: entry_ref.clone(),
            amount,
            posted_at,
            available_after: account.available(),
        };

        self.entries.push(LedgerEntry {
            entry_ref,
            reseller: reseller.clone(),
            kind,
            amount,
            key: key.clone(),
            reason: reason.map(Into::into),
            posted_at,
        });
        self.by_key.insert(key.clone(), receipt.clone());
        Ok(receipt)
    }
}

#[async_trait]
impl BalanceLedger for InMemoryLedger {
    async fn available_credit(&self, reseller: &ResellerId) -> Result<Decimal, LedgerError> {
        let state = self.lock()?;
        state
            .accounts
            .get(reseller)
            .map(Account::available)
            .ok_or_else(|| LedgerError::UnknownReseller(reseller.clone()))
    }

    async fn debit(
        &self,
        reseller: &ResellerId,
        amount: Decimal,
        key: &IdempotencyKey,
    ) -> Result<PostingReceipt, LedgerError> {
        self.lock()?.post(reseller, EntryKind::Debit, amount, key, None)
    }

    async fn find_posting(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<PostingReceipt>, LedgerError> {
        Ok(self.lock()?.by_key.get(key).cloned())
    }

    async fn credit(
        &self,
        reseller: &ResellerId,
        amount: Decimal,
        key: &IdempotencyKey,
        reason: &str,
    ) -> Result<PostingReceipt, LedgerError> {
        self.lock()?
            .post(reseller, EntryKind::Credit, amount, key, Some(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkflowId;

    fn ledger_with(credit: i64, holds: i64) -> (InMemoryLedger, ResellerId) {
        let ledger = InMemoryLedger::new();
        let reseller = ResellerId::new("r1");
        ledger.open_account(reseller.clone(), Decimal::from(credit), Decimal::from(holds));
        (ledger, reseller)
    }

    #[tokio::test]
    async fn holds_reduce_available_credit() {
        let (ledger, reseller) = ledger_with(100, 30);
        assert_eq!(ledger.available_credit(&reseller).await.unwrap(), Decimal::from(70));
    }

    #[tokio::test]
    async fn debit_replay_posts_once() {
        let (ledger, reseller) = ledger_with(100, 0);
        let key = IdempotencyKey::for_charge(WorkflowId::new());

        let first = ledger.debit(&reseller, Decimal::from(40), &key).await.unwrap();
        let second = ledger.debit(&reseller, Decimal::from(40), &key).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(ledger.entries().len(), 1);
        assert_eq!(ledger.current_credit(&reseller), Some(Decimal::from(60)));
    }

    #[tokio::test]
    async fn overdraw_is_refused_without_mutation() {
        let (ledger, reseller) = ledger_with(40, 0);
        let key = IdempotencyKey::for_charge(WorkflowId::new());

        let err = ledger.debit(&reseller, Decimal::from(55), &key).await.unwrap_err();
        assert!(matches!(err, LedgerError::Insufficient { available } if available == Decimal::from(40)));
        assert!(ledger.entries().is_empty());
    }

    #[tokio::test]
    async fn credit_appends_compensating_entry() {
        let (ledger, reseller) = ledger_with(100, 0);
        let id = WorkflowId::new();
        ledger
            .debit(&reseller, Decimal::from(55), &IdempotencyKey::for_charge(id))
            .await
            .unwrap();
        ledger
            .credit(
                &reseller,
                Decimal::from(55),
                &IdempotencyKey::for_reversal(id),
                "provisioning failed",
            )
            .await
            .unwrap();

        let kinds: Vec<_> = ledger.entries().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, [EntryKind::Debit, EntryKind::Credit]);
        assert_eq!(ledger.current_credit(&reseller), Some(Decimal::from(100)));
    }
}
