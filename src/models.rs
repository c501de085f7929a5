use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::balance::MemberBalance;
use crate::expense::{Expense, ExpenseAggregate};
use crate::ledger::{HistoryEntry, Payment, PaymentKind, Share};
use crate::money::Money;

// Database row types
#[derive(Debug, Clone, FromRow)]
pub struct MemberRow {
    pub id: Uuid,
    pub group_id: Uuid,
    pub name: String,
    pub paypal_email: Option<String>,
    pub iban: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ExpenseRow {
    pub id: Uuid,
    pub group_id: Uuid,
    pub payer_id: Uuid,
    pub description: String,
    pub category: String,
    pub total_minor: i64,
    pub currency: String,
    pub occurred_at: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub status: String,
    pub version: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct ShareRow {
    pub expense_id: Uuid,
    pub user_id: Uuid,
    pub position: i32,
    pub assigned_minor: i64,
    pub paid_minor: i64,
    pub paid: bool,
    pub prepaid: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct PaymentRow {
    pub id: Uuid,
    pub expense_id: Uuid,
    pub from_user_id: Uuid,
    pub to_user_id: Uuid,
    pub amount_minor: i64,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

// API response types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: Uuid,
    pub name: String,
    pub paypal_email: Option<String>,
    pub iban: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpenseResponse {
    pub expense: Expense,
    pub shares: Vec<Share>,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentHistoryItem {
    pub payment: Payment,
    pub remaining_balance: Money,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairwiseBalanceResponse {
    pub group_id: Uuid,
    pub user_id: Uuid,
    pub other_user_id: Uuid,
    /// Positive: the other user owes `user_id`.
    pub balance: Money,
}

#[derive(Debug, Clone, Serialize)]
pub struct Balance {
    pub user_id: Uuid,
    pub user_name: Option<String>,
    pub balance: Money, // positive = owed money, negative = owes money
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketItemView {
    pub label: String,
    pub amount: Money,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketScanResponse {
    pub items: Vec<TicketItemView>,
    pub total: Money,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub kind: &'static str,
    pub message: String,
    pub details: serde_json::Value,
}

// Request DTOs
fn default_category() -> String {
    "general".to_string()
}

fn default_true() -> bool {
    true
}

fn default_payment_kind() -> PaymentKind {
    PaymentKind::Partial
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum SplitRequest {
    Equal {
        #[serde(default = "default_true")]
        include_payer: bool,
    },
    Custom {
        amounts: HashMap<Uuid, String>,
    },
}

impl Default for SplitRequest {
    fn default() -> Self {
        SplitRequest::Equal {
            include_payer: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateExpenseRequest {
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    pub amount: String,
    pub currency: Option<String>,
    pub payer_id: Option<Uuid>,
    pub participant_ids: Vec<Uuid>,
    #[serde(default)]
    pub split: SplitRequest,
    pub occurred_at: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordPaymentRequest {
    /// Whose share is being paid; defaults to the caller.
    pub user_id: Option<Uuid>,
    pub amount: String,
    #[serde(default = "default_payment_kind")]
    pub kind: PaymentKind,
}

// Conversion helpers
impl From<MemberRow> for Member {
    fn from(row: MemberRow) -> Self {
        Member {
            id: row.id,
            name: row.name,
            paypal_email: row.paypal_email,
            iban: row.iban,
        }
    }
}

impl From<&ExpenseAggregate> for ExpenseResponse {
    fn from(aggregate: &ExpenseAggregate) -> Self {
        ExpenseResponse {
            expense: aggregate.expense().clone(),
            shares: aggregate
                .shares()
                .iter()
                .map(|s| s.share().clone())
                .collect(),
            version: aggregate.version(),
        }
    }
}

impl From<HistoryEntry<'_>> for PaymentHistoryItem {
    fn from(entry: HistoryEntry<'_>) -> Self {
        PaymentHistoryItem {
            payment: entry.payment.clone(),
            remaining_balance: entry.remaining_balance,
        }
    }
}

impl Balance {
    pub fn named(balance: MemberBalance, members: &[Member]) -> Self {
        Balance {
            user_id: balance.user_id,
            user_name: members
                .iter()
                .find(|m| m.id == balance.user_id)
                .map(|m| m.name.clone()),
            balance: balance.balance,
        }
    }
}
