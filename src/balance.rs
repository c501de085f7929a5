//! Read-only balance and reporting queries over a snapshot of expenses.
//!
//! Nothing here is stored: every answer is recomputed from the shares and payments
//! of the expenses handed in.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::expense::{ExpenseAggregate, ExpenseStatus};
use crate::money::{Currency, Money};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UserTotals {
    /// Outstanding amounts others owe the user.
    pub owed_to_user: Money,
    /// Outstanding amounts the user owes others.
    pub user_owes: Money,
    /// `owed_to_user - user_owes`.
    pub net: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberBalance {
    pub user_id: Uuid,
    /// Positive: the group owes this member. Negative: the member owes the group.
    pub balance: Money,
}

/// A netted debt between two users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Debt {
    pub from_user_id: Uuid,
    pub to_user_id: Uuid,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryTotal {
    pub category: String,
    pub expense_count: usize,
    /// Sum of the full expense totals.
    pub total: Money,
    /// Sum of the user's own assigned shares.
    pub user_share: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthTotal {
    pub year: i32,
    pub month: u32,
    pub expense_count: usize,
    pub total: Money,
    pub user_share: Money,
}

/// Inclusive range of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

/// Longest range a report may cover, in calendar months.
pub const MAX_PERIOD_MONTHS: i64 = 120;

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(LedgerError::InvalidPeriod {
                start,
                end,
                reason: "start is after end",
            });
        }
        let months = i64::from(end.year() - start.year()) * 12 + i64::from(end.month())
            - i64::from(start.month())
            + 1;
        if months > MAX_PERIOD_MONTHS {
            return Err(LedgerError::InvalidPeriod {
                start,
                end,
                reason: "period spans more than ten years",
            });
        }
        Ok(DateRange { start, end })
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }

    /// Every `(year, month)` the range touches, in order.
    fn months(&self) -> Vec<(i32, u32)> {
        let mut months = Vec::new();
        let (mut year, mut month) = (self.start.year(), self.start.month());
        while (year, month) <= (self.end.year(), self.end.month()) {
            months.push((year, month));
            if month == 12 {
                year += 1;
                month = 1;
            } else {
                month += 1;
            }
        }
        months
    }
}

pub struct BalanceEngine<'a> {
    expenses: &'a [ExpenseAggregate],
    currency: Currency,
}

impl<'a> BalanceEngine<'a> {
    pub fn new(expenses: &'a [ExpenseAggregate], currency: Currency) -> Self {
        BalanceEngine { expenses, currency }
    }

    fn live(&self) -> impl Iterator<Item = &'a ExpenseAggregate> {
        self.expenses
            .iter()
            .filter(|e| e.status() != ExpenseStatus::Cancelled)
    }

    fn zero(&self) -> Money {
        Money::zero(self.currency)
    }

    /// Net amount `other` owes `user` within `group_id`; negative when `user` is the
    /// debtor. Debts in both directions are netted into one number.
    pub fn pairwise_balance(&self, user: Uuid, other: Uuid, group_id: Uuid) -> Result<Money> {
        let mut balance = self.zero();
        if user == other {
            return Ok(balance);
        }
        for expense in self.live().filter(|e| e.expense().group_id == group_id) {
            let payer = expense.expense().payer_id;
            if payer == user {
                if let Some(share) = expense.share(other) {
                    balance = balance.checked_add(share.remaining())?;
                }
            } else if payer == other {
                if let Some(share) = expense.share(user) {
                    balance = balance.signed_sub(share.remaining())?;
                }
            }
        }
        Ok(balance)
    }

    pub fn user_totals(&self, user: Uuid) -> Result<UserTotals> {
        let mut owed_to_user = self.zero();
        let mut user_owes = self.zero();
        for expense in self.live() {
            if expense.expense().payer_id == user {
                for share in expense.shares() {
                    if share.user_id() != user {
                        owed_to_user = owed_to_user.checked_add(share.remaining())?;
                    }
                }
            } else if let Some(share) = expense.share(user) {
                user_owes = user_owes.checked_add(share.remaining())?;
            }
        }
        Ok(UserTotals {
            owed_to_user,
            user_owes,
            net: owed_to_user.signed_sub(user_owes)?,
        })
    }

    /// Net position of every member appearing in the group's expenses, ordered by user
    /// id. The balances always add up to zero.
    pub fn member_balances(&self, group_id: Uuid) -> Result<Vec<MemberBalance>> {
        let mut balances: BTreeMap<Uuid, Money> = BTreeMap::new();
        for expense in self.live().filter(|e| e.expense().group_id == group_id) {
            let payer = expense.expense().payer_id;
            for share in expense.shares() {
                let zero = self.zero();
                let remaining = share.remaining();
                let entry = balances.entry(share.user_id()).or_insert(zero);
                *entry = entry.signed_sub(remaining)?;
                let entry = balances.entry(payer).or_insert(zero);
                *entry = entry.checked_add(remaining)?;
            }
        }
        Ok(balances
            .into_iter()
            .map(|(user_id, balance)| MemberBalance { user_id, balance })
            .collect())
    }

    /// Every non-zero pairwise balance in the group as a single directed debt.
    pub fn group_debts(&self, group_id: Uuid) -> Result<Vec<Debt>> {
        let members: Vec<Uuid> = self
            .member_balances(group_id)?
            .into_iter()
            .map(|m| m.user_id)
            .collect();

        let mut debts = Vec::new();
        for (idx, &a) in members.iter().enumerate() {
            for &b in &members[idx + 1..] {
                let balance = self.pairwise_balance(a, b, group_id)?;
                if balance.is_positive() {
                    debts.push(Debt {
                        from_user_id: b,
                        to_user_id: a,
                        amount: balance,
                    });
                } else if balance.is_negative() {
                    debts.push(Debt {
                        from_user_id: a,
                        to_user_id: b,
                        amount: balance.negated(),
                    });
                }
            }
        }
        Ok(debts)
    }

    fn involving(
        &self,
        user: Uuid,
        period: DateRange,
    ) -> impl Iterator<Item = &'a ExpenseAggregate> {
        self.live()
            .filter(move |e| e.involves(user) && period.contains(e.expense().occurred_at))
    }

    pub fn category_breakdown(
        &self,
        user: Uuid,
        period: DateRange,
    ) -> Result<Vec<CategoryTotal>> {
        let mut categories: BTreeMap<String, CategoryTotal> = BTreeMap::new();
        for expense in self.involving(user, period) {
            let entry = categories
                .entry(expense.expense().category.clone())
                .or_insert_with(|| CategoryTotal {
                    category: expense.expense().category.clone(),
                    expense_count: 0,
                    total: self.zero(),
                    user_share: self.zero(),
                });
            entry.expense_count += 1;
            entry.total = entry.total.checked_add(expense.expense().total_amount)?;
            entry.user_share = entry.user_share.checked_add(user_share(expense, user))?;
        }
        Ok(categories.into_values().collect())
    }

    /// One entry per calendar month of `range`, empty months included.
    pub fn monthly_trend(&self, user: Uuid, range: DateRange) -> Result<Vec<MonthTotal>> {
        let mut months: BTreeMap<(i32, u32), MonthTotal> = range
            .months()
            .into_iter()
            .map(|(year, month)| {
                (
                    (year, month),
                    MonthTotal {
                        year,
                        month,
                        expense_count: 0,
                        total: self.zero(),
                        user_share: self.zero(),
                    },
                )
            })
            .collect();

        for expense in self.involving(user, range) {
            let day = expense.expense().occurred_at;
            if let Some(entry) = months.get_mut(&(day.year(), day.month())) {
                entry.expense_count += 1;
                entry.total = entry.total.checked_add(expense.expense().total_amount)?;
                entry.user_share = entry.user_share.checked_add(user_share(expense, user))?;
            }
        }
        Ok(months.into_values().collect())
    }
}

fn user_share(expense: &ExpenseAggregate, user: Uuid) -> Money {
    expense
        .share(user)
        .map(|s| s.share().assigned_amount)
        .unwrap_or_else(|| Money::zero(expense.expense().total_amount.currency()))
}
