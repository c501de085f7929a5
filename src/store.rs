//! Persistence boundary for expense aggregates.
//!
//! Writes use optimistic concurrency: an aggregate is saved against the version it
//! was loaded at, and a store that has moved on in the meantime refuses the write
//! with `ConcurrentModification`. Two payments racing on the same share can therefore
//! never both land; the loser retries against fresh state.

use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::expense::ExpenseAggregate;

#[rocket::async_trait]
pub trait SettlementStore: Send + Sync {
    /// Stores a freshly created expense at version 0.
    async fn insert(&self, aggregate: &ExpenseAggregate) -> Result<()>;

    async fn load(&self, expense_id: Uuid) -> Result<ExpenseAggregate>;

    /// Writes back an aggregate loaded at `aggregate.version()`, bumping the version.
    async fn save(&self, aggregate: &ExpenseAggregate) -> Result<()>;

    /// All expenses of a group, newest first, each read as of one instant.
    async fn group_snapshot(&self, group_id: Uuid) -> Result<Vec<ExpenseAggregate>>;

    /// All expenses where the user holds a share, newest first.
    async fn user_snapshot(&self, user_id: Uuid) -> Result<Vec<ExpenseAggregate>>;
}

/// Process-local store, used when no database is configured and in tests.
#[derive(Default)]
pub struct MemoryStore {
    expenses: RwLock<HashMap<Uuid, ExpenseAggregate>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn select<F>(&self, keep: F) -> Vec<ExpenseAggregate>
    where
        F: Fn(&ExpenseAggregate) -> bool,
    {
        let expenses = self.expenses.read().await;
        let mut selected: Vec<ExpenseAggregate> =
            expenses.values().filter(|e| keep(e)).cloned().collect();
        selected.sort_by(|a, b| b.expense().created_at.cmp(&a.expense().created_at));
        selected
    }
}

#[rocket::async_trait]
impl SettlementStore for MemoryStore {
    async fn insert(&self, aggregate: &ExpenseAggregate) -> Result<()> {
        let mut expenses = self.expenses.write().await;
        if expenses.contains_key(&aggregate.id()) {
            return Err(LedgerError::Storage(format!(
                "expense {} already exists",
                aggregate.id()
            )));
        }
        expenses.insert(aggregate.id(), aggregate.clone().with_version(0));
        Ok(())
    }

    async fn load(&self, expense_id: Uuid) -> Result<ExpenseAggregate> {
        self.expenses
            .read()
            .await
            .get(&expense_id)
            .cloned()
            .ok_or(LedgerError::ExpenseNotFound(expense_id))
    }

    async fn save(&self, aggregate: &ExpenseAggregate) -> Result<()> {
        let mut expenses = self.expenses.write().await;
        let current = expenses
            .get(&aggregate.id())
            .ok_or(LedgerError::ExpenseNotFound(aggregate.id()))?;
        if current.version() != aggregate.version() {
            return Err(LedgerError::ConcurrentModification {
                expense_id: aggregate.id(),
            });
        }
        let next = aggregate.clone().with_version(aggregate.version() + 1);
        expenses.insert(aggregate.id(), next);
        Ok(())
    }

    async fn group_snapshot(&self, group_id: Uuid) -> Result<Vec<ExpenseAggregate>> {
        Ok(self.select(|e| e.expense().group_id == group_id).await)
    }

    async fn user_snapshot(&self, user_id: Uuid) -> Result<Vec<ExpenseAggregate>> {
        Ok(self.select(|e| e.involves(user_id)).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expense::tests::{mxn, new_expense, user};
    use crate::money::Money;
    use chrono::Utc;

    fn dinner() -> ExpenseAggregate {
        ExpenseAggregate::create(
            Uuid::new_v4(),
            new_expense(10000, user(1), vec![user(1), user(2), user(3)]),
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn stale_write_is_refused() {
        let store = MemoryStore::new();
        let expense = dinner();
        store.insert(&expense).await.unwrap();

        let mut first = store.load(expense.id()).await.unwrap();
        let mut second = store.load(expense.id()).await.unwrap();
        for copy in [&mut first, &mut second] {
            copy.record_payment(
                user(2),
                Money::new(3000, mxn()),
                Uuid::new_v4(),
                Utc::now(),
            )
            .unwrap();
        }

        store.save(&first).await.unwrap();
        assert_eq!(
            store.save(&second).await,
            Err(LedgerError::ConcurrentModification {
                expense_id: expense.id()
            })
        );

        let stored = store.load(expense.id()).await.unwrap();
        assert_eq!(stored.version(), 1);
        assert_eq!(
            stored.share(user(2)).unwrap().share().paid_amount.minor(),
            3000
        );
    }

    #[tokio::test]
    async fn missing_expense_is_not_found() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        assert_eq!(
            store.load(id).await,
            Err(LedgerError::ExpenseNotFound(id))
        );
    }

    #[tokio::test]
    async fn snapshots_filter_by_group_and_user() {
        let store = MemoryStore::new();
        let dinner = dinner();
        let solo = ExpenseAggregate::create(
            Uuid::new_v4(),
            new_expense(500, user(4), vec![user(4)]),
            dinner.expense().created_at + chrono::Duration::seconds(1),
        )
        .unwrap();
        store.insert(&dinner).await.unwrap();
        store.insert(&solo).await.unwrap();

        let group = store.group_snapshot(Uuid::from_u128(500)).await.unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(group[0].id(), solo.id());

        let mine = store.user_snapshot(user(2)).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id(), dinner.id());

        assert!(store.insert(&dinner).await.is_err());
    }
}
