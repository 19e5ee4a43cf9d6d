//! Balance Reservation & Charge Unit

use crate::{BalanceLedger, IdempotencyKey, LedgerError, PostingReceipt, ResellerId, WorkflowId};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Confirmed debit. Once set on a workflow it is never cleared.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChargeRecord {
    /// Ledger entry of the debit
    pub charge_ref: Box<str>,
    /// Reseller whose balance was debited
    pub reseller: ResellerId,
    /// Bundle price before markup
    pub base_amount: Decimal,
    /// Markup after clamping
    pub markup_percent: Decimal,
    /// Amount actually debited
    pub amount: Decimal,
    /// Currency of `amount`
    pub currency: Box<str>,
    /// Key the debit was posted under
    pub key: IdempotencyKey,
    /// When the ledger posted the debit
    pub charged_at: DateTime<Utc>,
}

/// Compensating credit posted against a charge
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReversalRecord {
    /// Ledger entry of the credit
    pub reversal_ref: Box<str>,
    /// Charge this credit compensates
    pub charge_ref: Box<str>,
    /// Amount credited back
    pub amount: Decimal,
    /// Why the charge was reversed
    pub reason: Box<str>,
    /// When the ledger posted the credit
    pub reversed_at: DateTime<Utc>,
}

/// Failure to charge or reverse
#[derive(Clone, Debug, thiserror::Error, Serialize, Deserialize)]
pub enum ChargeError {
    /// Balance does not cover the amount; nothing was debited
    #[error("insufficient funds: short by {shortfall}")]
    InsufficientFunds {
        /// Amount missing
        shortfall: Decimal,
    },
    /// Ledger call failed
    #[error(transparent)]
    Ledger(LedgerError),
}

/// Clamp a markup percentage into `[0, 50]`
pub fn clamp_markup(markup_percent: Decimal) -> Decimal {
    markup_percent.clamp(Decimal::ZERO, Decimal::from(50))
}

/// `base * (1 + markup/100)` rounded to cents, markup clamped first
pub fn final_amount(base_amount: Decimal, markup_percent: Decimal) -> Decimal {
    let factor = Decimal::ONE + clamp_markup(markup_percent) / Decimal::ONE_HUNDRED;
    (base_amount * factor).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Balance Reservation & Charge Unit over a [`BalanceLedger`]
pub struct BalanceUnit {
    ledger: Arc<dyn BalanceLedger>,
}

impl BalanceUnit {
    /// Charge against `ledger`
    pub fn new(ledger: Arc<dyn BalanceLedger>) -> Self {
        Self { ledger }
    }

    /// Debit `reseller` for a bundle.
    ///
    /// A workflow that was already charged gets its original posting back
    /// and nothing is checked or debited again. Otherwise available credit
    /// is read immediately before debiting and a short balance fails without
    /// mutation. The ledger re-checks atomically, so a concurrent charge that
    /// drained the balance in between still surfaces as `InsufficientFunds`.
    pub async fn charge(
        &self,
        workflow_id: WorkflowId,
        reseller: &ResellerId,
        base_amount: Decimal,
        markup_percent: Decimal,
        currency: &str,
    ) -> Result<ChargeRecord, ChargeError> {
        let markup = clamp_markup(markup_percent);
        let key = IdempotencyKey::for_charge(workflow_id);

        let posted = self
            .ledger
            .find_posting(&key)
            .await
            .map_err(ChargeError::Ledger)?;
        let receipt = match posted {
            Some(receipt) => {
                tracing::info!(
                    workflow_id = %workflow_id,
                    entry = %receipt.entry_ref,
                    "Charge already posted, reusing receipt"
                );
                receipt
            }
            None => self.debit(reseller, final_amount(base_amount, markup), &key).await?,
        };

        tracing::info!(
            workflow_id = %workflow_id,
            reseller = %reseller,
            amount = %receipt.amount,
            entry = %receipt.entry_ref,
            "Reseller charged"
        );

        Ok(ChargeRecord {
            charge_ref: receipt.entry_ref,
            reseller: reseller.clone(),
            base_amount,
            markup_percent: markup,
            amount: receipt.amount,
            currency: currency.into(),
            key,
            charged_at: receipt.posted_at,
        })
    }

    async fn debit(
        &self,
        reseller: &ResellerId,
        amount: Decimal,
        key: &IdempotencyKey,
    ) -> Result<PostingReceipt, ChargeError> {
        let available = self
            .ledger
            .available_credit(reseller)
            .await
            .map_err(ChargeError::Ledger)?;
        if amount > available {
            tracing::info!(reseller = %reseller, %amount, %available, "Charge refused before debit");
            return Err(ChargeError::InsufficientFunds {
                shortfall: amount - available,
            });
        }

        self.ledger
            .debit(reseller, amount, key)
            .await
            .map_err(|err| match err {
                LedgerError::Insufficient { available } => ChargeError::InsufficientFunds {
                    shortfall: amount - available,
                },
                other => ChargeError::Ledger(other),
            })
    }

    /// Post the compensating credit for `charge`
    pub async fn reverse(
        &self,
        workflow_id: WorkflowId,
        charge: &ChargeRecord,
        reason: &str,
    ) -> Result<ReversalRecord, ChargeError> {
        let receipt = self
            .ledger
            .credit(
                &charge.reseller,
                charge.amount,
                &IdempotencyKey::for_reversal(workflow_id),
                reason,
            )
            .await
            .map_err(ChargeError::Ledger)?;

        tracing::warn!(
            workflow_id = %workflow_id,
            charge_ref = %charge.charge_ref,
            amount = %charge.amount,
            reason = %reason,
            "Charge reversed"
        );

        Ok(ReversalRecord {
            reversal_ref: receipt.entry_ref,
            charge_ref: charge.charge_ref.clone(),
            amount: charge.amount,
            reason: reason.into(),
            reversed_at: receipt.posted_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryLedger;

    fn unit_with_credit(credit: Decimal) -> (BalanceUnit, Arc<InMemoryLedger>, ResellerId) {
        let ledger = Arc::new(InMemoryLedger::new());
        let reseller = ResellerId::new("r1");
        ledger.open_account(reseller.clone(), credit, Decimal::ZERO);
        (BalanceUnit::new(ledger.clone()), ledger, reseller)
    }

    #[test]
    fn markup_is_applied_and_rounded() {
        assert_eq!(final_amount(Decimal::from(50), Decimal::from(10)), Decimal::new(5500, 2));
        assert_eq!(
            final_amount(Decimal::new(1999, 2), Decimal::new(125, 1)),
            Decimal::new(2249, 2)
        );
    }

    #[test]
    fn markup_is_clamped() {
        assert_eq!(final_amount(Decimal::from(10), Decimal::from(80)), Decimal::from(15));
        assert_eq!(final_amount(Decimal::from(10), Decimal::from(-5)), Decimal::from(10));
    }

    #[test]
    fn final_amount_is_monotonic_in_markup() {
        let base = Decimal::new(3333, 2);
        let mut previous = Decimal::ZERO;
        for step in 0..=100 {
            let markup = Decimal::new(step * 5, 1);
            let amount = final_amount(base, markup);
            let exact = (base * (Decimal::ONE + markup / Decimal::ONE_HUNDRED))
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
            assert_eq!(amount, exact);
            assert!(amount >= previous);
            previous = amount;
        }
    }

    #[tokio::test]
    async fn traveler_is_charged_with_markup() {
        let (unit, ledger, reseller) = unit_with_credit(Decimal::from(100));
        let charge = unit
            .charge(WorkflowId::new(), &reseller, Decimal::from(50), Decimal::from(10), "USD")
            .await
            .unwrap();

        assert_eq!(charge.amount, Decimal::new(5500, 2));
        assert_eq!(ledger.current_credit(&reseller), Some(Decimal::from(45)));
    }

    #[tokio::test]
    async fn short_balance_reports_shortfall_and_does_not_debit() {
        let (unit, ledger, reseller) = unit_with_credit(Decimal::from(40));
        let err = unit
            .charge(WorkflowId::new(), &reseller, Decimal::from(50), Decimal::from(10), "USD")
            .await
            .unwrap_err();

        assert!(
            matches!(err, ChargeError::InsufficientFunds { shortfall } if shortfall == Decimal::new(1500, 2))
        );
        assert!(ledger.entries().is_empty());
    }

    #[tokio::test]
    async fn concurrent_charges_cannot_both_pass() {
        let (unit, ledger, reseller) = unit_with_credit(Decimal::from(55));
        let (a, b) = tokio::join!(
            unit.charge(WorkflowId::new(), &reseller, Decimal::from(50), Decimal::from(10), "USD"),
            unit.charge(WorkflowId::new(), &reseller, Decimal::from(50), Decimal::from(10), "USD"),
        );

        let results = [a, b];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let short = results
            .iter()
            .filter(|r| matches!(r, Err(ChargeError::InsufficientFunds { .. })))
            .count();
        assert_eq!((ok, short), (1, 1));
        assert_eq!(ledger.current_credit(&reseller), Some(Decimal::ZERO));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_charges_across_threads() {
        let (unit, ledger, reseller) = unit_with_credit(Decimal::from(55));
        let unit = Arc::new(unit);

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let unit = unit.clone();
                let reseller = reseller.clone();
                tokio::spawn(async move {
                    unit.charge(WorkflowId::new(), &reseller, Decimal::from(50), Decimal::from(10), "USD")
                        .await
                })
            })
            .collect();

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(ledger.entries().len(), 1);
    }

    #[tokio::test]
    async fn replayed_charge_returns_original_posting() {
        let (unit, ledger, reseller) = unit_with_credit(Decimal::from(55));
        let id = WorkflowId::new();
        // Debit landed but its response never reached the workflow
        let posted = ledger
            .debit(&reseller, Decimal::new(5500, 2), &IdempotencyKey::for_charge(id))
            .await
            .unwrap();

        let charge = unit
            .charge(id, &reseller, Decimal::from(50), Decimal::from(10), "USD")
            .await
            .unwrap();

        assert_eq!(charge.charge_ref, posted.entry_ref);
        assert_eq!(charge.amount, Decimal::new(5500, 2));
        assert_eq!(ledger.entries().len(), 1);
        assert_eq!(ledger.current_credit(&reseller), Some(Decimal::ZERO));
    }

    #[tokio::test]
    async fn reversal_restores_credit_and_keeps_charge() {
        let (unit, ledger, reseller) = unit_with_credit(Decimal::from(100));
        let id = WorkflowId::new();
        let charge = unit
            .charge(id, &reseller, Decimal::from(50), Decimal::from(10), "USD")
            .await
            .unwrap();
        let reversal = unit.reverse(id, &charge, "partner rejected").await.unwrap();

        assert_eq!(reversal.charge_ref, charge.charge_ref);
        assert_eq!(ledger.current_credit(&reseller), Some(Decimal::from(100)));
        assert_eq!(ledger.entries().len(), 2);
    }
}
