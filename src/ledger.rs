//! Append-only payment record of a single share.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::money::Money;
use crate::split::ShareDraft;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentKind {
    Full,
    Partial,
}

impl PaymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentKind::Full => "full",
            PaymentKind::Partial => "partial",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "full" => Some(PaymentKind::Full),
            "partial" => Some(PaymentKind::Partial),
            _ => None,
        }
    }

    /// The kind a payment is recorded with: `Full` exactly when it closes the
    /// remaining balance. Callers cannot ask for a kind, so a "full" request for less
    /// is kept as `Partial`.
    pub fn resolve(amount: Money, remaining: Money) -> PaymentKind {
        if amount == remaining {
            PaymentKind::Full
        } else {
            PaymentKind::Partial
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub expense_id: Uuid,
    pub from_user_id: Uuid,
    pub to_user_id: Uuid,
    pub amount: Money,
    pub kind: PaymentKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub expense_id: Uuid,
    pub user_id: Uuid,
    pub assigned_amount: Money,
    pub paid_amount: Money,
    pub paid: bool,
}

impl Share {
    /// Unpaid remainder, `assigned_amount - paid_amount`.
    pub fn remaining(&self) -> Money {
        Money::new(
            self.assigned_amount.minor() - self.paid_amount.minor(),
            self.assigned_amount.currency(),
        )
    }
}

/// A share together with the payments made against it.
///
/// `paid_amount` and `paid` are always the fold of `payments` over the opening state,
/// so replaying the same payments always rebuilds the same share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShareLedger {
    share: Share,
    prepaid: bool,
    payments: Vec<Payment>,
}

/// Everything about a new payment except how it is classified.
#[derive(Debug, Clone, Copy)]
pub struct PaymentRequest {
    pub id: Uuid,
    pub to_user_id: Uuid,
    pub amount: Money,
    pub created_at: DateTime<Utc>,
}

impl ShareLedger {
    pub fn open(expense_id: Uuid, draft: &ShareDraft) -> Self {
        let currency = draft.assigned_amount.currency();
        let mut share = Share {
            expense_id,
            user_id: draft.user_id,
            assigned_amount: draft.assigned_amount,
            paid_amount: Money::zero(currency),
            paid: false,
        };
        if draft.prepaid {
            share.paid_amount = share.assigned_amount;
        }
        share.paid = share.paid_amount == share.assigned_amount;
        ShareLedger {
            share,
            prepaid: draft.prepaid,
            payments: Vec::new(),
        }
    }

    /// Rebuilds a share from its opening state and payment list.
    pub fn replay<I>(expense_id: Uuid, draft: &ShareDraft, payments: I) -> Result<Self>
    where
        I: IntoIterator<Item = Payment>,
    {
        let mut ledger = ShareLedger::open(expense_id, draft);
        let mut payments: Vec<Payment> = payments.into_iter().collect();
        payments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        for payment in payments {
            ledger.apply(payment)?;
        }
        Ok(ledger)
    }

    pub fn share(&self) -> &Share {
        &self.share
    }

    pub fn user_id(&self) -> Uuid {
        self.share.user_id
    }

    pub fn is_prepaid(&self) -> bool {
        self.prepaid
    }

    pub fn payments(&self) -> &[Payment] {
        &self.payments
    }

    pub fn remaining(&self) -> Money {
        self.share.remaining()
    }

    /// Appends a payment from this share's holder. Nothing changes when it fails.
    pub fn record_payment(&mut self, request: PaymentRequest) -> Result<&Payment> {
        let remaining = self.remaining();
        self.check_amount(request.amount, remaining)?;

        let payment = Payment {
            id: request.id,
            expense_id: self.share.expense_id,
            from_user_id: self.share.user_id,
            to_user_id: request.to_user_id,
            amount: request.amount,
            kind: PaymentKind::resolve(request.amount, remaining),
            created_at: request.created_at,
        };
        self.apply(payment)?;
        Ok(&self.payments[self.payments.len() - 1])
    }

    fn check_amount(&self, amount: Money, remaining: Money) -> Result<()> {
        if !amount.is_positive() {
            return Err(LedgerError::NonPositiveAmount { amount });
        }
        if amount.compare(&remaining)?.is_gt() {
            return Err(LedgerError::Overpayment {
                user_id: self.share.user_id,
                attempted: amount,
                remaining,
            });
        }
        Ok(())
    }

    fn apply(&mut self, payment: Payment) -> Result<()> {
        self.check_amount(payment.amount, self.remaining())?;
        self.share.paid_amount = self.share.paid_amount.checked_add(payment.amount)?;
        self.share.paid = self.share.paid_amount == self.share.assigned_amount;
        self.payments.push(payment);
        Ok(())
    }

    /// Payments in the order they were made, each with the balance left after it.
    pub fn history(&self) -> PaymentHistory<'_> {
        PaymentHistory {
            payments: self.payments.iter(),
            remaining: if self.prepaid {
                Money::zero(self.share.assigned_amount.currency())
            } else {
                self.share.assigned_amount
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry<'a> {
    pub payment: &'a Payment,
    pub remaining_balance: Money,
}

/// Lazy walk over a share's payments; clone it to start over.
#[derive(Debug, Clone)]
pub struct PaymentHistory<'a> {
    payments: std::slice::Iter<'a, Payment>,
    remaining: Money,
}

impl<'a> Iterator for PaymentHistory<'a> {
    type Item = HistoryEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let payment = self.payments.next()?;
        self.remaining = Money::new(
            self.remaining.minor() - payment.amount.minor(),
            self.remaining.currency(),
        );
        Some(HistoryEntry {
            payment,
            remaining_balance: self.remaining,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.payments.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn mxn() -> Currency {
        "MXN".parse().unwrap()
    }

    fn debtor_ledger(assigned: i64) -> ShareLedger {
        let draft = ShareDraft {
            user_id: Uuid::from_u128(2),
            assigned_amount: Money::new(assigned, mxn()),
            prepaid: false,
        };
        ShareLedger::open(Uuid::from_u128(100), &draft)
    }

    fn request(minor: i64, second: u32) -> PaymentRequest {
        PaymentRequest {
            id: Uuid::new_v4(),
            to_user_id: Uuid::from_u128(1),
            amount: Money::new(minor, mxn()),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, second).unwrap(),
        }
    }

    #[test]
    fn partial_payments_close_the_share() {
        let mut ledger = debtor_ledger(3333);

        let first = ledger
            .record_payment(request(2000, 0))
            .unwrap();
        assert_eq!(first.kind, PaymentKind::Partial);
        assert!(!ledger.share().paid);
        assert_eq!(ledger.remaining().minor(), 1333);

        let second = ledger
            .record_payment(request(1333, 1))
            .unwrap();
        assert_eq!(second.kind, PaymentKind::Full);
        assert!(ledger.share().paid);
        assert_eq!(ledger.share().paid_amount.minor(), 3333);
    }

    #[test]
    fn overpayment_leaves_share_unchanged() {
        let mut ledger = debtor_ledger(3333);
        let before = ledger.clone();

        let err = ledger
            .record_payment(request(3334, 0))
            .unwrap_err();

        assert_eq!(
            err,
            LedgerError::Overpayment {
                user_id: Uuid::from_u128(2),
                attempted: Money::new(3334, mxn()),
                remaining: Money::new(3333, mxn()),
            }
        );
        assert_eq!(ledger, before);
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        let mut ledger = debtor_ledger(500);
        assert!(matches!(
            ledger.record_payment(request(0, 0)),
            Err(LedgerError::NonPositiveAmount { .. })
        ));
        assert!(matches!(
            ledger.record_payment(request(-5, 0)),
            Err(LedgerError::NonPositiveAmount { .. })
        ));
        assert!(ledger.payments().is_empty());
    }

    #[test]
    fn short_full_payment_is_recorded_as_partial() {
        let mut ledger = debtor_ledger(1000);
        let payment = ledger
            .record_payment(request(400, 0))
            .unwrap();
        assert_eq!(payment.kind, PaymentKind::Partial);
        assert!(!ledger.share().paid);
    }

    #[test]
    fn prepaid_share_accepts_no_payment() {
        let draft = ShareDraft {
            user_id: Uuid::from_u128(1),
            assigned_amount: Money::new(3334, mxn()),
            prepaid: true,
        };
        let mut ledger = ShareLedger::open(Uuid::from_u128(100), &draft);
        assert!(ledger.share().paid);
        assert_eq!(ledger.share().paid_amount.minor(), 3334);
        assert!(matches!(
            ledger.record_payment(request(1, 0)),
            Err(LedgerError::Overpayment { .. })
        ));
    }

    #[test]
    fn zero_share_opens_paid() {
        let ledger = debtor_ledger(0);
        assert!(ledger.share().paid);
    }

    #[test]
    fn history_tracks_remaining_balance_and_restarts() {
        let mut ledger = debtor_ledger(3333);
        ledger
            .record_payment(request(2000, 0))
            .unwrap();
        ledger
            .record_payment(request(1000, 1))
            .unwrap();

        let history = ledger.history();
        let remaining: Vec<i64> = history
            .clone()
            .map(|entry| entry.remaining_balance.minor())
            .collect();
        assert_eq!(remaining, vec![1333, 333]);
        assert_eq!(history.count(), 2);
        assert_eq!(ledger.history().count(), 2);
    }

    #[test]
    fn replay_orders_by_creation_time() {
        let mut ledger = debtor_ledger(3000);
        ledger
            .record_payment(request(1000, 0))
            .unwrap();
        ledger
            .record_payment(request(2000, 5))
            .unwrap();

        let mut shuffled = ledger.payments().to_vec();
        shuffled.reverse();
        let draft = ShareDraft {
            user_id: Uuid::from_u128(2),
            assigned_amount: Money::new(3000, mxn()),
            prepaid: false,
        };
        let rebuilt = ShareLedger::replay(Uuid::from_u128(100), &draft, shuffled).unwrap();
        assert_eq!(rebuilt, ledger);
    }

    #[test]
    fn replay_rejects_overpaying_history() {
        let mut ledger = debtor_ledger(1000);
        ledger
            .record_payment(request(1000, 0))
            .unwrap();
        let mut payments = ledger.payments().to_vec();
        let mut extra = payments[0].clone();
        extra.id = Uuid::new_v4();
        payments.push(extra);

        let draft = ShareDraft {
            user_id: Uuid::from_u128(2),
            assigned_amount: Money::new(1000, mxn()),
            prepaid: false,
        };
        assert!(matches!(
            ShareLedger::replay(Uuid::from_u128(100), &draft, payments),
            Err(LedgerError::Overpayment { .. })
        ));
    }

    proptest! {
        #[test]
        fn never_overpays_and_replays_identically(
            assigned in 1i64..=100_000,
            attempts in prop::collection::vec(-10i64..=40_000, 0..=25),
        ) {
            let mut ledger = debtor_ledger(assigned);
            for (second, minor) in attempts.iter().enumerate() {
                let before = ledger.clone();
                let remaining = ledger.remaining().minor();
                let result = ledger.record_payment(request(*minor, second as u32 % 60));
                if *minor <= 0 || *minor > remaining {
                    prop_assert!(result.is_err());
                    prop_assert_eq!(&ledger, &before);
                } else {
                    prop_assert!(result.is_ok());
                }
                prop_assert!(ledger.share().paid_amount.minor() <= assigned);
                prop_assert_eq!(
                    ledger.share().paid,
                    ledger.share().paid_amount.minor() == assigned
                );
            }

            let draft = ShareDraft {
                user_id: Uuid::from_u128(2),
                assigned_amount: Money::new(assigned, mxn()),
                prepaid: false,
            };
            let replayed = ShareLedger::replay(
                Uuid::from_u128(100),
                &draft,
                ledger.payments().to_vec(),
            ).unwrap();
            prop_assert_eq!(replayed.share(), ledger.share());
        }
    }
}
