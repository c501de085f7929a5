//! One expense with its shares and payments, and the rules for changing them.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::ledger::{Payment, PaymentRequest, Share, ShareLedger};
use crate::money::Money;
use crate::split::{split_expense, SplitPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpenseStatus {
    Pending,
    Settled,
    Cancelled,
}

impl ExpenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpenseStatus::Pending => "pending",
            ExpenseStatus::Settled => "settled",
            ExpenseStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ExpenseStatus::Pending),
            "settled" => Some(ExpenseStatus::Settled),
            "cancelled" => Some(ExpenseStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expense {
    pub id: Uuid,
    pub group_id: Uuid,
    pub payer_id: Uuid,
    pub description: String,
    pub category: String,
    pub total_amount: Money,
    pub occurred_at: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub status: ExpenseStatus,
}

#[derive(Debug, Clone)]
pub struct NewExpense {
    pub group_id: Uuid,
    pub payer_id: Uuid,
    pub description: String,
    pub category: String,
    pub total_amount: Money,
    pub participants: Vec<Uuid>,
    pub policy: SplitPolicy,
    pub occurred_at: NaiveDate,
}

/// What a successful payment produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentReceipt {
    pub payment: Payment,
    pub share: Share,
    pub status: ExpenseStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpenseAggregate {
    expense: Expense,
    shares: Vec<ShareLedger>,
    version: u64,
}

impl ExpenseAggregate {
    pub fn create(id: Uuid, new: NewExpense, created_at: DateTime<Utc>) -> Result<Self> {
        if new.description.trim().is_empty() {
            return Err(LedgerError::InvalidInput(
                "expense description must not be empty".to_string(),
            ));
        }
        let drafts = split_expense(
            new.total_amount,
            new.payer_id,
            &new.participants,
            &new.policy,
        )?;
        let shares = drafts
            .iter()
            .map(|draft| ShareLedger::open(id, draft))
            .collect();

        let mut aggregate = ExpenseAggregate {
            expense: Expense {
                id,
                group_id: new.group_id,
                payer_id: new.payer_id,
                description: new.description.trim().to_string(),
                category: normalize_category(&new.category),
                total_amount: new.total_amount,
                occurred_at: new.occurred_at,
                created_at,
                status: ExpenseStatus::Pending,
            },
            shares,
            version: 0,
        };
        aggregate.check_total()?;
        aggregate.refresh_status();
        Ok(aggregate)
    }

    /// Reassembles a persisted expense, refusing state that breaks the invariants.
    pub fn restore(expense: Expense, shares: Vec<ShareLedger>, version: u64) -> Result<Self> {
        let mut aggregate = ExpenseAggregate {
            expense,
            shares,
            version,
        };
        aggregate.check_total()?;
        let stored = aggregate.expense.status;
        aggregate.refresh_status();
        if aggregate.expense.status != stored {
            return Err(LedgerError::Storage(format!(
                "expense {} is stored as {} but its shares say {}",
                aggregate.expense.id,
                stored.as_str(),
                aggregate.expense.status.as_str()
            )));
        }
        Ok(aggregate)
    }

    pub fn expense(&self) -> &Expense {
        &self.expense
    }

    pub fn id(&self) -> Uuid {
        self.expense.id
    }

    pub fn status(&self) -> ExpenseStatus {
        self.expense.status
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// The same state stamped with a new store version.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn shares(&self) -> &[ShareLedger] {
        &self.shares
    }

    pub fn share(&self, user_id: Uuid) -> Option<&ShareLedger> {
        self.shares.iter().find(|s| s.user_id() == user_id)
    }

    fn share_mut(&mut self, user_id: Uuid) -> Result<&mut ShareLedger> {
        let expense_id = self.expense.id;
        self.shares
            .iter_mut()
            .find(|s| s.user_id() == user_id)
            .ok_or(LedgerError::ShareNotFound {
                expense_id,
                user_id,
            })
    }

    pub fn record_payment(
        &mut self,
        share_user_id: Uuid,
        amount: Money,
        payment_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<PaymentReceipt> {
        let expense_id = self.expense.id;
        if self.expense.status == ExpenseStatus::Cancelled {
            return Err(LedgerError::ExpenseCancelled(expense_id));
        }
        let to_user_id = self.expense.payer_id;
        let share = self.share_mut(share_user_id)?;
        if share.is_prepaid() {
            return Err(LedgerError::ShareAlreadyPaid {
                expense_id,
                user_id: share_user_id,
            });
        }
        let payment = share
            .record_payment(PaymentRequest {
                id: payment_id,
                to_user_id,
                amount,
                created_at,
            })?
            .clone();
        let share = share.share().clone();
        self.refresh_status();

        Ok(PaymentReceipt {
            payment,
            share,
            status: self.expense.status,
        })
    }

    /// Pays off whatever is left on a share ("mark as paid").
    pub fn settle_share(
        &mut self,
        share_user_id: Uuid,
        payment_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<PaymentReceipt> {
        let expense_id = self.expense.id;
        if self.expense.status == ExpenseStatus::Cancelled {
            return Err(LedgerError::ExpenseCancelled(expense_id));
        }
        let share = self.share(share_user_id).ok_or(LedgerError::ShareNotFound {
            expense_id,
            user_id: share_user_id,
        })?;
        if share.share().paid {
            return Err(LedgerError::ShareAlreadyPaid {
                expense_id,
                user_id: share_user_id,
            });
        }
        let remaining = share.remaining();
        self.record_payment(share_user_id, remaining, payment_id, created_at)
    }

    /// Cancels the expense on behalf of `requester_id`.
    pub fn cancel(&mut self, requester_id: Uuid) -> Result<()> {
        if requester_id != self.expense.payer_id {
            return Err(LedgerError::NotAuthorized {
                user_id: requester_id,
            });
        }
        if self.expense.status == ExpenseStatus::Cancelled {
            return Err(LedgerError::ExpenseNotDeletable {
                expense_id: self.expense.id,
                reason: "it is already cancelled",
            });
        }
        let has_payments = self
            .shares
            .iter()
            .any(|s| !s.is_prepaid() && s.share().paid_amount.is_positive());
        if has_payments {
            return Err(LedgerError::ExpenseNotDeletable {
                expense_id: self.expense.id,
                reason: "payments have already been made against it",
            });
        }
        self.expense.status = ExpenseStatus::Cancelled;
        Ok(())
    }

    pub fn involves(&self, user_id: Uuid) -> bool {
        self.share(user_id).is_some()
    }

    fn check_total(&self) -> Result<()> {
        let total = self.expense.total_amount;
        let assigned = Money::sum(
            total.currency(),
            self.shares.iter().map(|s| s.share().assigned_amount),
        )?;
        if assigned != total {
            return Err(LedgerError::SplitSumMismatch {
                expected: total,
                actual: assigned,
            });
        }
        Ok(())
    }

    fn refresh_status(&mut self) {
        if self.expense.status == ExpenseStatus::Cancelled {
            return;
        }
        self.expense.status = if self.shares.iter().all(|s| s.share().paid) {
            ExpenseStatus::Settled
        } else {
            ExpenseStatus::Pending
        };
    }
}

fn normalize_category(category: &str) -> String {
    let category = category.trim();
    if category.is_empty() {
        "general".to_string()
    } else {
        category.to_lowercase()
    }
}
