//! Postgres adapters: the settlement store and the member directory.

use std::collections::HashMap;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::directory::ParticipantDirectory;
use crate::error::{LedgerError, Result};
use crate::expense::{Expense, ExpenseAggregate, ExpenseStatus};
use crate::ledger::{Payment, PaymentKind, ShareLedger};
use crate::models::{ExpenseRow, Member, MemberRow, PaymentRow, ShareRow};
use crate::money::{Currency, Money};
use crate::split::ShareDraft;
use crate::store::SettlementStore;

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

pub async fn init_pool(database_url: &str) -> std::result::Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
}

pub async fn run_migrations(database_url: &str) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let (mut client, connection) = tokio_postgres::connect(database_url, tokio_postgres::NoTls).await?;

    // Spawn the connection handler
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "migration connection error");
        }
    });

    let report = embedded::migrations::runner().run_async(&mut client).await?;
    for migration in report.applied_migrations() {
        tracing::info!(%migration, "applied migration");
    }

    Ok(())
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

const EXPENSE_COLUMNS: &str = "id, group_id, payer_id, description, category, total_minor, currency, \
     occurred_at, created_at, status, version";

const SHARE_COLUMNS: &str = "expense_id, user_id, position, assigned_minor, paid_minor, paid, prepaid";

const PAYMENT_COLUMNS: &str = "id, expense_id, from_user_id, to_user_id, amount_minor, kind, created_at";

pub struct PgSettlementStore {
    pool: PgPool,
}

impl PgSettlementStore {
    pub fn new(pool: PgPool) -> Self {
        PgSettlementStore { pool }
    }

    /// Reads the given expenses with their shares and payments inside one
    /// repeatable-read transaction, so balances never mix two points in time.
    async fn snapshot(&self, filter: &str, id: Uuid) -> Result<Vec<ExpenseAggregate>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let expense_rows: Vec<ExpenseRow> = sqlx::query_as(&format!(
            "SELECT {EXPENSE_COLUMNS} FROM expenses WHERE {filter} ORDER BY created_at DESC"
        ))
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        let ids: Vec<Uuid> = expense_rows.iter().map(|row| row.id).collect();
        let share_rows: Vec<ShareRow> = sqlx::query_as(&format!(
            "SELECT {SHARE_COLUMNS} FROM expense_shares WHERE expense_id = ANY($1) ORDER BY position"
        ))
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;
        let payment_rows: Vec<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE expense_id = ANY($1) ORDER BY created_at, id"
        ))
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut shares_by_expense: HashMap<Uuid, Vec<ShareRow>> = HashMap::new();
        for row in share_rows {
            shares_by_expense.entry(row.expense_id).or_default().push(row);
        }
        let mut payments_by_expense: HashMap<Uuid, Vec<PaymentRow>> = HashMap::new();
        for row in payment_rows {
            payments_by_expense.entry(row.expense_id).or_default().push(row);
        }

        expense_rows
            .into_iter()
            .map(|row| {
                let shares = shares_by_expense.remove(&row.id).unwrap_or_default();
                let payments = payments_by_expense.remove(&row.id).unwrap_or_default();
                assemble(row, shares, payments)
            })
            .collect()
    }
}

#[rocket::async_trait]
impl SettlementStore for PgSettlementStore {
    async fn insert(&self, aggregate: &ExpenseAggregate) -> Result<()> {
        let expense = aggregate.expense();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO expenses (id, group_id, payer_id, description, category, total_minor, currency, occurred_at, created_at, status, version)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0)"
        )
        .bind(expense.id)
        .bind(expense.group_id)
        .bind(expense.payer_id)
        .bind(&expense.description)
        .bind(&expense.category)
        .bind(expense.total_amount.minor())
        .bind(expense.total_amount.currency().as_str())
        .bind(expense.occurred_at)
        .bind(expense.created_at)
        .bind(expense.status.as_str())
        .execute(&mut *tx)
        .await?;

        for (position, ledger) in aggregate.shares().iter().enumerate() {
            let share = ledger.share();
            sqlx::query(
                "INSERT INTO expense_shares (expense_id, user_id, position, assigned_minor, paid_minor, paid, prepaid)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)"
            )
            .bind(expense.id)
            .bind(share.user_id)
            .bind(position as i32)
            .bind(share.assigned_amount.minor())
            .bind(share.paid_amount.minor())
            .bind(share.paid)
            .bind(ledger.is_prepaid())
            .execute(&mut *tx)
            .await?;
        }
        insert_payments(&mut tx, aggregate).await?;

        tx.commit().await?;
        tracing::debug!(expense_id = %expense.id, "expense inserted");
        Ok(())
    }

    async fn load(&self, expense_id: Uuid) -> Result<ExpenseAggregate> {
        self.snapshot("id = $1", expense_id)
            .await?
            .pop()
            .ok_or(LedgerError::ExpenseNotFound(expense_id))
    }

    async fn save(&self, aggregate: &ExpenseAggregate) -> Result<()> {
        let expense = aggregate.expense();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE expenses SET status = $1, version = version + 1 WHERE id = $2 AND version = $3"
        )
        .bind(expense.status.as_str())
        .bind(expense.id)
        .bind(aggregate.version() as i64)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM expenses WHERE id = $1")
                .bind(expense.id)
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;
            return Err(match exists {
                Some(_) => LedgerError::ConcurrentModification {
                    expense_id: expense.id,
                },
                None => LedgerError::ExpenseNotFound(expense.id),
            });
        }

        for ledger in aggregate.shares() {
            let share = ledger.share();
            sqlx::query(
                "UPDATE expense_shares SET paid_minor = $1, paid = $2 WHERE expense_id = $3 AND user_id = $4"
            )
            .bind(share.paid_amount.minor())
            .bind(share.paid)
            .bind(expense.id)
            .bind(share.user_id)
            .execute(&mut *tx)
            .await?;
        }
        insert_payments(&mut tx, aggregate).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn group_snapshot(&self, group_id: Uuid) -> Result<Vec<ExpenseAggregate>> {
        self.snapshot("group_id = $1", group_id).await
    }

    async fn user_snapshot(&self, user_id: Uuid) -> Result<Vec<ExpenseAggregate>> {
        self.snapshot(
            "id IN (SELECT expense_id FROM expense_shares WHERE user_id = $1)",
            user_id,
        )
        .await
    }
}

/// Payments are append-only; rows already stored are left alone.
async fn insert_payments(
    tx: &mut Transaction<'_, Postgres>,
    aggregate: &ExpenseAggregate,
) -> Result<()> {
    for payment in aggregate.shares().iter().flat_map(|s| s.payments()) {
        sqlx::query(
            "INSERT INTO payments (id, expense_id, from_user_id, to_user_id, amount_minor, kind, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO NOTHING"
        )
        .bind(payment.id)
        .bind(payment.expense_id)
        .bind(payment.from_user_id)
        .bind(payment.to_user_id)
        .bind(payment.amount.minor())
        .bind(payment.kind.as_str())
        .bind(payment.created_at)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

fn corrupt(message: String) -> LedgerError {
    tracing::error!(%message, "stored ledger state is inconsistent");
    LedgerError::Storage(message)
}

/// Rebuilds an aggregate by replaying its payments over the stored shares.
fn assemble(
    row: ExpenseRow,
    share_rows: Vec<ShareRow>,
    payment_rows: Vec<PaymentRow>,
) -> Result<ExpenseAggregate> {
    let currency: Currency = row
        .currency
        .parse()
        .map_err(|_| corrupt(format!("expense {} has currency {:?}", row.id, row.currency)))?;
    let status = ExpenseStatus::parse(&row.status)
        .ok_or_else(|| corrupt(format!("expense {} has status {:?}", row.id, row.status)))?;

    let mut payments: Vec<Payment> = Vec::with_capacity(payment_rows.len());
    for p in payment_rows {
        let kind = PaymentKind::parse(&p.kind)
            .ok_or_else(|| corrupt(format!("payment {} has kind {:?}", p.id, p.kind)))?;
        payments.push(Payment {
            id: p.id,
            expense_id: p.expense_id,
            from_user_id: p.from_user_id,
            to_user_id: p.to_user_id,
            amount: Money::new(p.amount_minor, currency),
            kind,
            created_at: p.created_at,
        });
    }

    let mut shares = Vec::with_capacity(share_rows.len());
    for (index, s) in share_rows.into_iter().enumerate() {
        if usize::try_from(s.position).ok() != Some(index) {
            return Err(corrupt(format!(
                "share of {} in expense {} is at position {}, expected {index}",
                s.user_id, row.id, s.position
            )));
        }
        let draft = ShareDraft {
            user_id: s.user_id,
            assigned_amount: Money::new(s.assigned_minor, currency),
            prepaid: s.prepaid,
        };
        let own = payments.iter().filter(|p| p.from_user_id == s.user_id).cloned();
        let ledger = ShareLedger::replay(row.id, &draft, own)?;
        if ledger.share().paid_amount.minor() != s.paid_minor || ledger.share().paid != s.paid {
            return Err(corrupt(format!(
                "share of {} in expense {} does not match its payments",
                s.user_id, row.id
            )));
        }
        shares.push(ledger);
    }

    let expense = Expense {
        id: row.id,
        group_id: row.group_id,
        payer_id: row.payer_id,
        description: row.description,
        category: row.category,
        total_amount: Money::new(row.total_minor, currency),
        occurred_at: row.occurred_at,
        created_at: row.created_at,
        status,
    };
    ExpenseAggregate::restore(expense, shares, row.version as u64)
}

pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        PgDirectory { pool }
    }
}

#[rocket::async_trait]
impl ParticipantDirectory for PgDirectory {
    async fn group_members(&self, group_id: Uuid) -> Result<Vec<Member>> {
        let rows: Vec<MemberRow> = sqlx::query_as(
            "SELECT id, group_id, name, paypal_email, iban, created_at FROM members WHERE group_id = $1 ORDER BY created_at"
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Member::from).collect())
    }
}
