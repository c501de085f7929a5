//! Application service: the operations the HTTP layer exposes, run against a
//! `SettlementStore` on behalf of an explicit caller.

use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::balance::{BalanceEngine, CategoryTotal, DateRange, Debt, MonthTotal, UserTotals};
use crate::clock::Clock;
use crate::directory::ParticipantDirectory;
use crate::error::{LedgerError, Result};
use crate::expense::{ExpenseAggregate, NewExpense, PaymentReceipt};
use crate::ledger::PaymentKind;
use crate::models::{Balance, PaymentHistoryItem};
use crate::money::{Currency, Money};
use crate::split::SplitPolicy;
use crate::store::SettlementStore;

/// Who is calling, and in which group. Built from the session token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub requester_id: Uuid,
    pub group_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct CreateExpense {
    pub description: String,
    pub category: String,
    pub total_amount: Money,
    /// Defaults to the caller.
    pub payer_id: Option<Uuid>,
    pub participants: Vec<Uuid>,
    pub policy: SplitPolicy,
    /// Defaults to today.
    pub occurred_at: Option<NaiveDate>,
}

pub struct LedgerService {
    store: Arc<dyn SettlementStore>,
    directory: Arc<dyn ParticipantDirectory>,
    clock: Arc<dyn Clock>,
    currency: Currency,
    write_retries: u32,
}

impl LedgerService {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        directory: Arc<dyn ParticipantDirectory>,
        clock: Arc<dyn Clock>,
        currency: Currency,
        write_retries: u32,
    ) -> Self {
        LedgerService {
            store,
            directory,
            clock,
            currency,
            write_retries,
        }
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.now().date_naive()
    }

    pub async fn create_expense(
        &self,
        ctx: &RequestContext,
        input: CreateExpense,
    ) -> Result<ExpenseAggregate> {
        if input.total_amount.currency() != self.currency {
            return Err(LedgerError::InvalidAmount(format!(
                "this ledger only records {} amounts, got {}",
                self.currency,
                input.total_amount.currency()
            )));
        }
        let new = NewExpense {
            group_id: ctx.group_id,
            payer_id: input.payer_id.unwrap_or(ctx.requester_id),
            description: input.description,
            category: input.category,
            total_amount: input.total_amount,
            participants: input.participants,
            policy: input.policy,
            occurred_at: input.occurred_at.unwrap_or_else(|| self.today()),
        };
        let aggregate = ExpenseAggregate::create(Uuid::new_v4(), new, self.clock.now())?;
        self.store.insert(&aggregate).await?;

        info!(
            expense_id = %aggregate.id(),
            group_id = %ctx.group_id,
            payer_id = %aggregate.expense().payer_id,
            total = %aggregate.expense().total_amount,
            shares = aggregate.shares().len(),
            "expense created"
        );
        Ok(aggregate)
    }

    /// Records a payment towards a share. `requested` is what the client asked for and
    /// only shows up in the log; the stored kind depends on the amount alone.
    pub async fn record_payment(
        &self,
        ctx: &RequestContext,
        expense_id: Uuid,
        share_user_id: Uuid,
        amount: Money,
        requested: PaymentKind,
    ) -> Result<PaymentReceipt> {
        let payment_id = Uuid::new_v4();
        let (receipt, _) = self
            .mutate(ctx, expense_id, |aggregate| {
                authorize_payment(ctx, aggregate, share_user_id)?;
                aggregate.record_payment(share_user_id, amount, payment_id, self.clock.now())
            })
            .await?;

        info!(
            expense_id = %expense_id,
            payment_id = %receipt.payment.id,
            from = %share_user_id,
            amount = %receipt.payment.amount,
            kind = receipt.payment.kind.as_str(),
            requested = requested.as_str(),
            status = receipt.status.as_str(),
            "payment recorded"
        );
        Ok(receipt)
    }

    /// Marks a share as paid by recording a payment of whatever it still owes.
    pub async fn settle_share(
        &self,
        ctx: &RequestContext,
        expense_id: Uuid,
        share_user_id: Uuid,
    ) -> Result<PaymentReceipt> {
        let payment_id = Uuid::new_v4();
        let (receipt, _) = self
            .mutate(ctx, expense_id, |aggregate| {
                authorize_payment(ctx, aggregate, share_user_id)?;
                aggregate.settle_share(share_user_id, payment_id, self.clock.now())
            })
            .await?;

        info!(
            expense_id = %expense_id,
            from = %share_user_id,
            amount = %receipt.payment.amount,
            "share settled"
        );
        Ok(receipt)
    }

    pub async fn cancel_expense(
        &self,
        ctx: &RequestContext,
        expense_id: Uuid,
    ) -> Result<ExpenseAggregate> {
        let (_, aggregate) = self
            .mutate(ctx, expense_id, |aggregate| aggregate.cancel(ctx.requester_id))
            .await?;
        info!(expense_id = %expense_id, by = %ctx.requester_id, "expense cancelled");
        Ok(aggregate)
    }

    pub async fn expense(&self, ctx: &RequestContext, expense_id: Uuid) -> Result<ExpenseAggregate> {
        self.load_scoped(ctx, expense_id).await
    }

    pub async fn group_expenses(&self, ctx: &RequestContext) -> Result<Vec<ExpenseAggregate>> {
        self.store.group_snapshot(ctx.group_id).await
    }

    pub async fn payment_history(
        &self,
        ctx: &RequestContext,
        expense_id: Uuid,
        share_user_id: Uuid,
    ) -> Result<Vec<PaymentHistoryItem>> {
        let aggregate = self.load_scoped(ctx, expense_id).await?;
        let share = aggregate
            .share(share_user_id)
            .ok_or(LedgerError::ShareNotFound {
                expense_id,
                user_id: share_user_id,
            })?;
        Ok(share.history().map(PaymentHistoryItem::from).collect())
    }

    /// What `other` owes the caller in the caller's group; negative when the caller owes.
    pub async fn pairwise_balance(&self, ctx: &RequestContext, other: Uuid) -> Result<Money> {
        let snapshot = self.store.group_snapshot(ctx.group_id).await?;
        BalanceEngine::new(&snapshot, self.currency).pairwise_balance(
            ctx.requester_id,
            other,
            ctx.group_id,
        )
    }

    pub async fn user_totals(&self, ctx: &RequestContext) -> Result<UserTotals> {
        let snapshot = self.store.user_snapshot(ctx.requester_id).await?;
        BalanceEngine::new(&snapshot, self.currency).user_totals(ctx.requester_id)
    }

    pub async fn category_breakdown(
        &self,
        ctx: &RequestContext,
        period: DateRange,
    ) -> Result<Vec<CategoryTotal>> {
        let snapshot = self.store.user_snapshot(ctx.requester_id).await?;
        BalanceEngine::new(&snapshot, self.currency).category_breakdown(ctx.requester_id, period)
    }

    pub async fn monthly_trend(
        &self,
        ctx: &RequestContext,
        range: DateRange,
    ) -> Result<Vec<MonthTotal>> {
        let snapshot = self.store.user_snapshot(ctx.requester_id).await?;
        BalanceEngine::new(&snapshot, self.currency).monthly_trend(ctx.requester_id, range)
    }

    pub async fn group_balances(&self, ctx: &RequestContext) -> Result<Vec<Balance>> {
        let snapshot = self.store.group_snapshot(ctx.group_id).await?;
        let balances = BalanceEngine::new(&snapshot, self.currency).member_balances(ctx.group_id)?;
        let members = self.directory.group_members(ctx.group_id).await?;
        Ok(balances
            .into_iter()
            .map(|balance| Balance::named(balance, &members))
            .collect())
    }

    pub async fn group_debts(&self, ctx: &RequestContext) -> Result<Vec<Debt>> {
        let snapshot = self.store.group_snapshot(ctx.group_id).await?;
        BalanceEngine::new(&snapshot, self.currency).group_debts(ctx.group_id)
    }

    /// Loads an expense, hiding expenses of other groups.
    async fn load_scoped(&self, ctx: &RequestContext, expense_id: Uuid) -> Result<ExpenseAggregate> {
        let aggregate = self.store.load(expense_id).await?;
        if aggregate.expense().group_id != ctx.group_id {
            debug!(expense_id = %expense_id, group_id = %ctx.group_id, "expense outside caller's group");
            return Err(LedgerError::ExpenseNotFound(expense_id));
        }
        Ok(aggregate)
    }

    /// Load, change, save. A write that loses against a concurrent one is redone on
    /// fresh state, at most `write_retries` more times.
    async fn mutate<T, F>(
        &self,
        ctx: &RequestContext,
        expense_id: Uuid,
        mut change: F,
    ) -> Result<(T, ExpenseAggregate)>
    where
        F: FnMut(&mut ExpenseAggregate) -> Result<T> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            let mut aggregate = self.load_scoped(ctx, expense_id).await?;
            let outcome = change(&mut aggregate)?;
            match self.store.save(&aggregate).await {
                Ok(()) => {
                    let version = aggregate.version() + 1;
                    return Ok((outcome, aggregate.with_version(version)));
                }
                Err(LedgerError::ConcurrentModification { .. }) if attempt < self.write_retries => {
                    attempt += 1;
                    warn!(expense_id = %expense_id, attempt, "write conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A share may be paid by its holder, or confirmed by the expense payer.
fn authorize_payment(
    ctx: &RequestContext,
    aggregate: &ExpenseAggregate,
    share_user_id: Uuid,
) -> Result<()> {
    if ctx.requester_id == share_user_id || ctx.requester_id == aggregate.expense().payer_id {
        Ok(())
    } else {
        Err(LedgerError::NotAuthorized {
            user_id: ctx.requester_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::{TimeZone, Utc};

    use crate::clock::SteppingClock;
    use crate::directory::StaticDirectory;
    use crate::expense::tests::{mxn, user};
    use crate::expense::ExpenseStatus;
    use crate::models::Member;
    use crate::store::MemoryStore;

    fn group() -> Uuid {
        Uuid::from_u128(500)
    }

    fn ctx(n: u128) -> RequestContext {
        RequestContext {
            requester_id: user(n),
            group_id: group(),
        }
    }

    fn member(n: u128, name: &str) -> Member {
        Member {
            id: user(n),
            name: name.to_string(),
            paypal_email: None,
            iban: None,
        }
    }

    fn service_with(store: Arc<dyn SettlementStore>, write_retries: u32) -> LedgerService {
        let directory = StaticDirectory::new().with_group(
            group(),
            vec![member(1, "Ana"), member(2, "Beto"), member(3, "Carla")],
        );
        let clock = SteppingClock::starting_at(Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap());
        LedgerService::new(store, Arc::new(directory), Arc::new(clock), mxn(), write_retries)
    }

    fn service() -> LedgerService {
        service_with(Arc::new(MemoryStore::new()), 3)
    }

    fn dinner(total: i64) -> CreateExpense {
        CreateExpense {
            description: "Dinner".to_string(),
            category: "food".to_string(),
            total_amount: Money::new(total, mxn()),
            payer_id: None,
            participants: vec![user(1), user(2), user(3)],
            policy: SplitPolicy::Equal {
                include_payer: true,
            },
            occurred_at: None,
        }
    }

    fn money(minor: i64) -> Money {
        Money::new(minor, mxn())
    }

    /// Fails the first `conflicts` saves as if another writer got there first.
    struct ContendedStore {
        inner: MemoryStore,
        conflicts: AtomicU32,
    }

    #[rocket::async_trait]
    impl SettlementStore for ContendedStore {
        async fn insert(&self, aggregate: &ExpenseAggregate) -> Result<()> {
            self.inner.insert(aggregate).await
        }

        async fn load(&self, expense_id: Uuid) -> Result<ExpenseAggregate> {
            self.inner.load(expense_id).await
        }

        async fn save(&self, aggregate: &ExpenseAggregate) -> Result<()> {
            let left = self.conflicts.load(Ordering::SeqCst);
            if left > 0 {
                self.conflicts.store(left - 1, Ordering::SeqCst);
                return Err(LedgerError::ConcurrentModification {
                    expense_id: aggregate.id(),
                });
            }
            self.inner.save(aggregate).await
        }

        async fn group_snapshot(&self, group_id: Uuid) -> Result<Vec<ExpenseAggregate>> {
            self.inner.group_snapshot(group_id).await
        }

        async fn user_snapshot(&self, user_id: Uuid) -> Result<Vec<ExpenseAggregate>> {
            self.inner.user_snapshot(user_id).await
        }
    }

    #[tokio::test]
    async fn create_defaults_payer_and_date_from_context() {
        let service = service();
        let expense = service.create_expense(&ctx(1), dinner(10000)).await.unwrap();
        assert_eq!(expense.expense().payer_id, user(1));
        assert_eq!(expense.expense().group_id, group());
        assert_eq!(
            expense.expense().occurred_at,
            NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()
        );
        assert_eq!(service.expense(&ctx(2), expense.id()).await.unwrap(), expense);
    }

    #[tokio::test]
    async fn create_rejects_foreign_currency() {
        let service = service();
        let mut input = dinner(10000);
        input.total_amount = Money::new(10000, "USD".parse().unwrap());
        assert!(matches!(
            service.create_expense(&ctx(1), input).await,
            Err(LedgerError::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn requested_kind_does_not_decide_recorded_kind() {
        let service = service();
        let expense = service.create_expense(&ctx(1), dinner(10000)).await.unwrap();

        let receipt = service
            .record_payment(&ctx(2), expense.id(), user(2), money(400), PaymentKind::Full)
            .await
            .unwrap();
        assert_eq!(receipt.payment.kind, PaymentKind::Partial);
        assert!(!receipt.share.paid);

        let receipt = service
            .record_payment(&ctx(2), expense.id(), user(2), money(2933), PaymentKind::Partial)
            .await
            .unwrap();
        assert_eq!(receipt.payment.kind, PaymentKind::Full);
        assert!(receipt.share.paid);
    }

    #[tokio::test]
    async fn payments_flow_into_balances() {
        let service = service();
        let expense = service.create_expense(&ctx(1), dinner(10000)).await.unwrap();

        let receipt = service
            .record_payment(&ctx(2), expense.id(), user(2), money(1333), PaymentKind::Partial)
            .await
            .unwrap();
        assert_eq!(receipt.share.paid_amount.minor(), 1333);

        assert_eq!(
            service.pairwise_balance(&ctx(1), user(2)).await.unwrap().minor(),
            2000
        );
        assert_eq!(
            service.pairwise_balance(&ctx(2), user(1)).await.unwrap().minor(),
            -2000
        );

        let totals = service.user_totals(&ctx(1)).await.unwrap();
        assert_eq!(totals.owed_to_user.minor(), 5333);

        let balances = service.group_balances(&ctx(3)).await.unwrap();
        let ana = balances.iter().find(|b| b.user_id == user(1)).unwrap();
        assert_eq!(ana.user_name.as_deref(), Some("Ana"));
        assert_eq!(ana.balance.minor(), 5333);
        assert_eq!(balances.iter().map(|b| b.balance.minor()).sum::<i64>(), 0);

        let debts = service.group_debts(&ctx(1)).await.unwrap();
        assert_eq!(debts.len(), 2);
        assert!(debts.iter().all(|d| d.to_user_id == user(1)));
    }

    #[tokio::test]
    async fn payer_may_confirm_but_strangers_may_not_pay() {
        let service = service();
        let expense = service.create_expense(&ctx(1), dinner(10000)).await.unwrap();

        assert_eq!(
            service
                .record_payment(&ctx(3), expense.id(), user(2), money(100), PaymentKind::Partial)
                .await,
            Err(LedgerError::NotAuthorized { user_id: user(3) })
        );

        let receipt = service.settle_share(&ctx(1), expense.id(), user(2)).await.unwrap();
        assert_eq!(receipt.payment.amount.minor(), 3333);
        assert_eq!(receipt.payment.kind, PaymentKind::Full);

        let history = service
            .payment_history(&ctx(2), expense.id(), user(2))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].remaining_balance.is_zero());
    }

    #[tokio::test]
    async fn other_groups_cannot_see_expense() {
        let service = service();
        let expense = service.create_expense(&ctx(1), dinner(10000)).await.unwrap();
        let outsider = RequestContext {
            requester_id: user(2),
            group_id: Uuid::from_u128(501),
        };
        assert_eq!(
            service.expense(&outsider, expense.id()).await,
            Err(LedgerError::ExpenseNotFound(expense.id()))
        );
        assert_eq!(
            service
                .record_payment(&outsider, expense.id(), user(2), money(100), PaymentKind::Partial)
                .await,
            Err(LedgerError::ExpenseNotFound(expense.id()))
        );
    }

    #[tokio::test]
    async fn cancelled_expense_leaves_balances() {
        let service = service();
        let expense = service.create_expense(&ctx(1), dinner(10000)).await.unwrap();
        let cancelled = service.cancel_expense(&ctx(1), expense.id()).await.unwrap();
        assert_eq!(cancelled.status(), ExpenseStatus::Cancelled);
        assert_eq!(cancelled.version(), 1);

        assert!(service.pairwise_balance(&ctx(1), user(2)).await.unwrap().is_zero());
        assert_eq!(service.group_expenses(&ctx(1)).await.unwrap().len(), 1);
        assert_eq!(
            service
                .record_payment(&ctx(2), expense.id(), user(2), money(100), PaymentKind::Partial)
                .await,
            Err(LedgerError::ExpenseCancelled(expense.id()))
        );
    }

    #[tokio::test]
    async fn conflicting_write_is_retried() {
        let store = Arc::new(ContendedStore {
            inner: MemoryStore::new(),
            conflicts: AtomicU32::new(2),
        });
        let service = service_with(store.clone(), 3);
        let expense = service.create_expense(&ctx(1), dinner(10000)).await.unwrap();

        service
            .record_payment(&ctx(2), expense.id(), user(2), money(1000), PaymentKind::Partial)
            .await
            .unwrap();
        let stored = store.load(expense.id()).await.unwrap();
        assert_eq!(stored.share(user(2)).unwrap().payments().len(), 1);
    }

    #[tokio::test]
    async fn conflict_surfaces_once_retries_run_out() {
        let store = Arc::new(ContendedStore {
            inner: MemoryStore::new(),
            conflicts: AtomicU32::new(5),
        });
        let service = service_with(store, 1);
        let expense = service.create_expense(&ctx(1), dinner(10000)).await.unwrap();
        assert_eq!(
            service
                .record_payment(&ctx(2), expense.id(), user(2), money(1000), PaymentKind::Partial)
                .await,
            Err(LedgerError::ConcurrentModification {
                expense_id: expense.id()
            })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_full_payments_cannot_both_land() {
        let service = Arc::new(service());
        let expense = service.create_expense(&ctx(1), dinner(10000)).await.unwrap();
        let expense_id = expense.id();

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    service
                        .record_payment(&ctx(2), expense_id, user(2), money(3333), PaymentKind::Full)
                        .await
                })
            })
            .collect();

        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap());
        }

        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(LedgerError::Overpayment { .. }))));

        let stored = service.expense(&ctx(1), expense_id).await.unwrap();
        let share = stored.share(user(2)).unwrap();
        assert_eq!(share.share().paid_amount.minor(), 3333);
        assert_eq!(share.payments().len(), 1);
    }

    #[tokio::test]
    async fn reports_use_callers_expenses() {
        let service = service();
        service.create_expense(&ctx(1), dinner(9000)).await.unwrap();
        let mut taxi = dinner(3000);
        taxi.category = "transport".to_string();
        taxi.occurred_at = NaiveDate::from_ymd_opt(2024, 1, 15);
        service.create_expense(&ctx(2), taxi).await.unwrap();

        let period = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        )
        .unwrap();
        let categories = service.category_breakdown(&ctx(3), period).await.unwrap();
        assert_eq!(categories.len(), 2);
        assert_eq!(categories[0].category, "food");
        assert_eq!(categories[0].user_share.minor(), 3000);

        let trend = service.monthly_trend(&ctx(3), period).await.unwrap();
        assert_eq!(trend.len(), 3);
        assert_eq!(trend[1].expense_count, 0);
        assert_eq!(trend[2].total.minor(), 9000);
    }
}
