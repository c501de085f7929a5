use thiserror::Error;
use uuid::Uuid;

use crate::money::{Currency, Money};

/// Failures of value-level money arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoneyError {
    #[error("currency mismatch: cannot combine {left} and {right}")]
    CurrencyMismatch { left: Currency, right: Currency },

    #[error("subtracting {subtrahend} from {minuend} would go below zero")]
    NegativeResult { minuend: Money, subtrahend: Money },

    #[error("amount overflow")]
    Overflow,

    #[error("cannot split into zero parts")]
    ZeroParts,

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid currency code: {0}")]
    InvalidCurrency(String),
}

/// Classes of failure, used by callers to decide between retrying, rejecting and
/// reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Conflict,
    Policy,
    NotFound,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("invalid participants: {reason}")]
    InvalidParticipants {
        reason: &'static str,
        user_id: Option<Uuid>,
    },

    #[error("split amounts sum to {actual}, expected {expected}")]
    SplitSumMismatch { expected: Money, actual: Money },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("payment amount must be positive, got {amount}")]
    NonPositiveAmount { amount: Money },

    #[error("payment of {attempted} exceeds the remaining {remaining} owed by {user_id}")]
    Overpayment {
        user_id: Uuid,
        attempted: Money,
        remaining: Money,
    },

    #[error("expense not found: {0}")]
    ExpenseNotFound(Uuid),

    #[error("user {user_id} has no share in expense {expense_id}")]
    ShareNotFound { expense_id: Uuid, user_id: Uuid },

    #[error("share of {user_id} in expense {expense_id} is already paid")]
    ShareAlreadyPaid { expense_id: Uuid, user_id: Uuid },

    #[error("expense {0} was cancelled")]
    ExpenseCancelled(Uuid),

    #[error("expense {expense_id} was modified concurrently")]
    ConcurrentModification { expense_id: Uuid },

    #[error("expense {expense_id} cannot be deleted: {reason}")]
    ExpenseNotDeletable {
        expense_id: Uuid,
        reason: &'static str,
    },

    #[error("user {user_id} is not allowed to do this")]
    NotAuthorized { user_id: Uuid },

    #[error("invalid period {start} to {end}: {reason}")]
    InvalidPeriod {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
        reason: &'static str,
    },

    #[error(transparent)]
    Money(#[from] MoneyError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LedgerError::InvalidParticipants { .. }
            | LedgerError::SplitSumMismatch { .. }
            | LedgerError::InvalidAmount(_)
            | LedgerError::InvalidInput(_)
            | LedgerError::NonPositiveAmount { .. }
            | LedgerError::InvalidPeriod { .. }
            | LedgerError::Money(_) => ErrorClass::Validation,
            LedgerError::ConcurrentModification { .. } => ErrorClass::Conflict,
            LedgerError::Overpayment { .. }
            | LedgerError::ShareAlreadyPaid { .. }
            | LedgerError::ExpenseCancelled(_)
            | LedgerError::ExpenseNotDeletable { .. }
            | LedgerError::NotAuthorized { .. } => ErrorClass::Policy,
            LedgerError::ExpenseNotFound(_) | LedgerError::ShareNotFound { .. } => {
                ErrorClass::NotFound
            }
            LedgerError::Storage(_) => ErrorClass::Internal,
        }
    }

    /// Stable machine-readable tag for the failure kind.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidParticipants { .. } => "invalid_participants",
            LedgerError::SplitSumMismatch { .. } => "split_sum_mismatch",
            LedgerError::InvalidAmount(_) => "invalid_amount",
            LedgerError::InvalidInput(_) => "invalid_input",
            LedgerError::NonPositiveAmount { .. } => "non_positive_amount",
            LedgerError::Overpayment { .. } => "overpayment",
            LedgerError::ExpenseNotFound(_) => "expense_not_found",
            LedgerError::ShareNotFound { .. } => "share_not_found",
            LedgerError::ShareAlreadyPaid { .. } => "share_already_paid",
            LedgerError::ExpenseCancelled(_) => "expense_cancelled",
            LedgerError::ConcurrentModification { .. } => "concurrent_modification",
            LedgerError::ExpenseNotDeletable { .. } => "expense_not_deletable",
            LedgerError::NotAuthorized { .. } => "not_authorized",
            LedgerError::InvalidPeriod { .. } => "invalid_period",
            LedgerError::Money(MoneyError::CurrencyMismatch { .. }) => "currency_mismatch",
            LedgerError::Money(_) => "invalid_amount",
            LedgerError::Storage(_) => "storage",
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
