//! PostgreSQL ledger store
//!
//! Each compound operation runs inside one `pool.begin()` transaction.
//! Rows that gate a transition (task, offer, escrow) are read with
//! `FOR UPDATE` so concurrent requests serialize on them, and balance
//! debits use a guarded `UPDATE ... WHERE balance >= $1`.

use super::{
    EscrowHold, EscrowSettlement, InboundCredit, LedgerStore, SettlementTrigger,
    WithdrawalPosting,
};
use crate::{
    error::EscrowError,
    ledger::Amount,
    models::{
        Currency, Dispute, DisputeStatus, EscrowBalance, EscrowStatus, LedgerTotals,
        NewTransaction, OfferStatus, Task, TaskOffer, TaskStatus, Transaction, TransactionKind,
        Wallet,
    },
    EscrowResult,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{
    postgres::{PgPool, PgPoolOptions, PgRow},
    Postgres, Row,
};
use std::time::Duration;
use tracing::info;

type PgTx<'a> = sqlx::Transaction<'a, Postgres>;

const WALLET_COLUMNS: &str = "id, user_id, currency, address, balance, created_at";
const ESCROW_COLUMNS: &str =
    "id, task_id, client_id, freelancer_id, amount, currency, status, created_at";
const TRANSACTION_COLUMNS: &str =
    "id, kind, from_wallet_id, to_wallet_id, to_address, task_id, amount, currency, confirmed, created_at";
const DISPUTE_COLUMNS: &str =
    "id, task_id, opened_by, assigned_admin, status, resolution, created_at, updated_at";
const OFFER_COLUMNS: &str = "id, task_id, freelancer_id, price, status, created_at";

pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> EscrowResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> EscrowResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }
}

fn wallet_from_row(row: &PgRow) -> EscrowResult<Wallet> {
    Ok(Wallet {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        currency: row.try_get::<String, _>("currency")?.parse()?,
        address: row.try_get("address")?,
        balance: row.try_get("balance")?,
        created_at: row.try_get("created_at")?,
    })
}

fn escrow_from_row(row: &PgRow) -> EscrowResult<EscrowBalance> {
    Ok(EscrowBalance {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        client_id: row.try_get("client_id")?,
        freelancer_id: row.try_get("freelancer_id")?,
        amount: row.try_get("amount")?,
        currency: row.try_get::<String, _>("currency")?.parse()?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: row.try_get("created_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> EscrowResult<Transaction> {
    Ok(Transaction {
        id: row.try_get("id")?,
        kind: row.try_get::<String, _>("kind")?.parse()?,
        from_wallet_id: row.try_get("from_wallet_id")?,
        to_wallet_id: row.try_get("to_wallet_id")?,
        to_address: row.try_get("to_address")?,
        task_id: row.try_get("task_id")?,
        amount: row.try_get("amount")?,
        currency: row.try_get::<String, _>("currency")?.parse()?,
        confirmed: row.try_get("confirmed")?,
        created_at: row.try_get("created_at")?,
    })
}

fn task_from_row(row: &PgRow) -> EscrowResult<Task> {
    Ok(Task {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        title: row.try_get("title")?,
        currency: row.try_get::<String, _>("currency")?.parse()?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: row.try_get("created_at")?,
    })
}

fn offer_from_row(row: &PgRow) -> EscrowResult<TaskOffer> {
    Ok(TaskOffer {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        freelancer_id: row.try_get("freelancer_id")?,
        price: row.try_get("price")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: row.try_get("created_at")?,
    })
}

fn dispute_from_row(row: &PgRow) -> EscrowResult<Dispute> {
    let resolution: Option<String> = row.try_get("resolution")?;
    Ok(Dispute {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        opened_by: row.try_get("opened_by")?,
        assigned_admin: row.try_get("assigned_admin")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        resolution: resolution.map(|r| r.parse()).transpose()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn insert_transaction(tx: &mut PgTx<'_>, new: &NewTransaction) -> EscrowResult<Transaction> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO transactions
            (kind, from_wallet_id, to_wallet_id, to_address, task_id, amount, currency, confirmed)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {}
        "#,
        TRANSACTION_COLUMNS
    ))
    .bind(new.kind.as_str())
    .bind(new.from_wallet_id)
    .bind(new.to_wallet_id)
    .bind(&new.to_address)
    .bind(new.task_id)
    .bind(new.amount)
    .bind(new.currency.code())
    .bind(new.confirmed)
    .fetch_one(&mut **tx)
    .await?;

    transaction_from_row(&row)
}

/// Guarded debit inside an open transaction
async fn debit_in_tx(tx: &mut PgTx<'_>, wallet_id: i64, amount: &Amount) -> EscrowResult<Wallet> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE wallets
        SET balance = balance - $1
        WHERE id = $2 AND currency = $3 AND balance >= $1
        RETURNING {}
        "#,
        WALLET_COLUMNS
    ))
    .bind(amount.value())
    .bind(wallet_id)
    .bind(amount.currency().code())
    .fetch_optional(&mut **tx)
    .await?;

    match row {
        Some(row) => wallet_from_row(&row),
        None => {
            let current = sqlx::query("SELECT currency, balance FROM wallets WHERE id = $1")
                .bind(wallet_id)
                .fetch_optional(&mut **tx)
                .await?
                .ok_or_else(|| EscrowError::not_found(format!("wallet {}", wallet_id)))?;
            let currency: Currency = current.try_get::<String, _>("currency")?.parse()?;
            if currency != amount.currency() {
                return Err(EscrowError::CurrencyMismatch {
                    left: currency,
                    right: amount.currency(),
                });
            }
            Err(EscrowError::insufficient_funds(
                amount.value(),
                current.try_get("balance")?,
            ))
        }
    }
}

async fn credit_in_tx(tx: &mut PgTx<'_>, wallet_id: i64, amount: &Amount) -> EscrowResult<Wallet> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE wallets
        SET balance = balance + $1
        WHERE id = $2 AND currency = $3
        RETURNING {}
        "#,
        WALLET_COLUMNS
    ))
    .bind(amount.value())
    .bind(wallet_id)
    .bind(amount.currency().code())
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| {
        EscrowError::not_found(format!(
            "{} wallet {}",
            amount.currency(),
            wallet_id
        ))
    })?;

    wallet_from_row(&row)
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn wallet(&self, wallet_id: i64) -> EscrowResult<Option<Wallet>> {
        let row = sqlx::query(&format!("SELECT {} FROM wallets WHERE id = $1", WALLET_COLUMNS))
            .bind(wallet_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn wallet_for_user(
        &self,
        user_id: i64,
        currency: Currency,
    ) -> EscrowResult<Option<Wallet>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM wallets WHERE user_id = $1 AND currency = $2",
            WALLET_COLUMNS
        ))
        .bind(user_id)
        .bind(currency.code())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn wallet_by_address(
        &self,
        address: &str,
        currency: Currency,
    ) -> EscrowResult<Option<Wallet>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM wallets WHERE address = $1 AND currency = $2",
            WALLET_COLUMNS
        ))
        .bind(address)
        .bind(currency.code())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn wallets_for_user(&self, user_id: i64) -> EscrowResult<Vec<Wallet>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM wallets WHERE user_id = $1 ORDER BY currency",
            WALLET_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(wallet_from_row).collect()
    }

    async fn list_wallets(&self) -> EscrowResult<Vec<Wallet>> {
        let rows = sqlx::query(&format!("SELECT {} FROM wallets ORDER BY id", WALLET_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(wallet_from_row).collect()
    }

    async fn insert_wallet(
        &self,
        user_id: i64,
        currency: Currency,
        address: &str,
    ) -> EscrowResult<Wallet> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO wallets (user_id, currency, address, balance)
            VALUES ($1, $2, $3, 0)
            ON CONFLICT (user_id, currency) DO NOTHING
            RETURNING {}
            "#,
            WALLET_COLUMNS
        ))
        .bind(user_id)
        .bind(currency.code())
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(row) => wallet_from_row(&row),
            None => self
                .wallet_for_user(user_id, currency)
                .await?
                .ok_or_else(|| EscrowError::internal("wallet vanished after insert conflict")),
        }
    }

    async fn credit_wallet(&self, wallet_id: i64, amount: &Amount) -> EscrowResult<Wallet> {
        let mut tx = self.pool.begin().await?;
        let wallet = credit_in_tx(&mut tx, wallet_id, amount).await?;
        tx.commit().await?;
        Ok(wallet)
    }

    async fn debit_wallet(&self, wallet_id: i64, amount: &Amount) -> EscrowResult<Wallet> {
        let mut tx = self.pool.begin().await?;
        let wallet = debit_in_tx(&mut tx, wallet_id, amount).await?;
        tx.commit().await?;
        Ok(wallet)
    }

    async fn apply_withdrawal(&self, posting: &WithdrawalPosting) -> EscrowResult<Transaction> {
        let mut tx = self.pool.begin().await?;
        let currency = posting.debit.currency();

        debit_in_tx(&mut tx, posting.from_wallet_id, &posting.debit).await?;
        if let Some(internal) = posting.internal_wallet_id {
            credit_in_tx(&mut tx, internal, &posting.remaining).await?;
        }

        let transfer = insert_transaction(
            &mut tx,
            &NewTransaction {
                kind: if posting.internal_wallet_id.is_some() {
                    TransactionKind::InternalTransfer
                } else {
                    TransactionKind::Withdrawal
                },
                from_wallet_id: Some(posting.from_wallet_id),
                to_wallet_id: posting.internal_wallet_id,
                to_address: Some(posting.to_address.clone()),
                task_id: None,
                amount: posting.remaining.value(),
                currency,
                confirmed: posting.internal_wallet_id.is_some(),
            },
        )
        .await?;
        if !posting.commission.is_zero() {
            insert_transaction(
                &mut tx,
                &NewTransaction {
                    kind: TransactionKind::Commission,
                    from_wallet_id: Some(posting.from_wallet_id),
                    to_wallet_id: None,
                    to_address: Some(posting.operator_address.clone()),
                    task_id: None,
                    amount: posting.commission.value(),
                    currency,
                    confirmed: false,
                },
            )
            .await?;
        }

        tx.commit().await?;
        Ok(transfer)
    }

    async fn transactions_for_wallet(&self, wallet_id: i64) -> EscrowResult<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM transactions
            WHERE from_wallet_id = $1 OR to_wallet_id = $1
            ORDER BY id DESC
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(wallet_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn is_ingested(&self, txid: &str) -> EscrowResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM wallet_transactions WHERE txid = $1)")
                .bind(txid)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn mark_seen(
        &self,
        txid: &str,
        wallet_id: Option<i64>,
        currency: Currency,
    ) -> EscrowResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO wallet_transactions (txid, wallet_id, amount, currency, confirmed)
            VALUES ($1, $2, 0, $3, TRUE)
            ON CONFLICT (txid) DO NOTHING
            "#,
        )
        .bind(txid)
        .bind(wallet_id)
        .bind(currency.code())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn ingest_credits(
        &self,
        wallet_id: i64,
        credits: &[InboundCredit],
    ) -> EscrowResult<Vec<InboundCredit>> {
        let mut tx = self.pool.begin().await?;
        let mut applied = Vec::new();
        let mut total: Option<Amount> = None;

        for credit in credits {
            let inserted: Option<String> = sqlx::query_scalar(
                r#"
                INSERT INTO wallet_transactions (txid, wallet_id, amount, currency, confirmed)
                VALUES ($1, $2, $3, $4, TRUE)
                ON CONFLICT (txid) DO NOTHING
                RETURNING txid
                "#,
            )
            .bind(&credit.txid)
            .bind(wallet_id)
            .bind(credit.amount.value())
            .bind(credit.amount.currency().code())
            .fetch_optional(&mut *tx)
            .await?;

            if inserted.is_none() || credit.amount.is_zero() {
                continue;
            }
            insert_transaction(
                &mut tx,
                &NewTransaction {
                    kind: TransactionKind::Deposit,
                    from_wallet_id: None,
                    to_wallet_id: Some(wallet_id),
                    to_address: None,
                    task_id: None,
                    amount: credit.amount.value(),
                    currency: credit.amount.currency(),
                    confirmed: true,
                },
            )
            .await?;
            total = Some(match total {
                Some(sum) => sum.checked_add(&credit.amount)?,
                None => credit.amount,
            });
            applied.push(credit.clone());
        }

        if let Some(total) = total {
            credit_in_tx(&mut tx, wallet_id, &total).await?;
        }
        tx.commit().await?;
        Ok(applied)
    }

    async fn task(&self, task_id: i64) -> EscrowResult<Option<Task>> {
        let row = sqlx::query(
            "SELECT id, client_id, title, currency, status, created_at FROM tasks WHERE id = $1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn offer(&self, offer_id: i64) -> EscrowResult<Option<TaskOffer>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM task_offers WHERE id = $1",
            OFFER_COLUMNS
        ))
        .bind(offer_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(offer_from_row).transpose()
    }

    async fn accepted_offer(&self, task_id: i64) -> EscrowResult<Option<TaskOffer>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM task_offers WHERE task_id = $1 AND status = 'accepted' LIMIT 1",
            OFFER_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(offer_from_row).transpose()
    }

    async fn open_escrow(&self, hold: &EscrowHold) -> EscrowResult<EscrowBalance> {
        let mut tx = self.pool.begin().await?;

        let task_status: TaskStatus =
            sqlx::query_scalar::<_, String>("SELECT status FROM tasks WHERE id = $1 FOR UPDATE")
                .bind(hold.task_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| EscrowError::not_found(format!("task {}", hold.task_id)))?
                .parse()?;
        if !task_status.can_accept_offer() {
            return Err(EscrowError::invalid_state(
                task_status.as_str(),
                TaskStatus::InProgress.as_str(),
                "task is not open",
            ));
        }

        let offer_status: OfferStatus = sqlx::query_scalar::<_, String>(
            "SELECT status FROM task_offers WHERE id = $1 AND task_id = $2 FOR UPDATE",
        )
        .bind(hold.offer_id)
        .bind(hold.task_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EscrowError::not_found(format!("offer {}", hold.offer_id)))?
        .parse()?;
        if offer_status != OfferStatus::Pending {
            return Err(EscrowError::invalid_state(
                offer_status.as_str(),
                OfferStatus::Accepted.as_str(),
                "offer is no longer pending",
            ));
        }

        debit_in_tx(&mut tx, hold.client_wallet_id, &hold.amount).await?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO escrow_balances (task_id, client_id, freelancer_id, amount, currency, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            RETURNING {}
            "#,
            ESCROW_COLUMNS
        ))
        .bind(hold.task_id)
        .bind(hold.client_id)
        .bind(hold.freelancer_id)
        .bind(hold.amount.value())
        .bind(hold.amount.currency().code())
        .fetch_one(&mut *tx)
        .await?;
        let escrow = escrow_from_row(&row)?;

        sqlx::query(
            r#"
            UPDATE task_offers
            SET status = CASE WHEN id = $1 THEN 'accepted' ELSE 'rejected' END
            WHERE task_id = $2
            "#,
        )
        .bind(hold.offer_id)
        .bind(hold.task_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE tasks SET status = 'in_progress', updated_at = NOW() WHERE id = $1")
            .bind(hold.task_id)
            .execute(&mut *tx)
            .await?;

        insert_transaction(
            &mut tx,
            &NewTransaction {
                kind: TransactionKind::EscrowHold,
                from_wallet_id: Some(hold.client_wallet_id),
                to_wallet_id: None,
                to_address: None,
                task_id: Some(hold.task_id),
                amount: hold.amount.value(),
                currency: hold.amount.currency(),
                confirmed: true,
            },
        )
        .await?;

        tx.commit().await?;
        Ok(escrow)
    }

    async fn escrow(&self, escrow_id: i64) -> EscrowResult<Option<EscrowBalance>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM escrow_balances WHERE id = $1",
            ESCROW_COLUMNS
        ))
        .bind(escrow_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(escrow_from_row).transpose()
    }

    async fn escrow_for_task(&self, task_id: i64) -> EscrowResult<Option<EscrowBalance>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM escrow_balances WHERE task_id = $1 ORDER BY id DESC LIMIT 1",
            ESCROW_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(escrow_from_row).transpose()
    }

    async fn escrows_for_user(&self, user_id: i64) -> EscrowResult<Vec<EscrowBalance>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM escrow_balances
            WHERE client_id = $1 OR freelancer_id = $1
            ORDER BY created_at DESC
            "#,
            ESCROW_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(escrow_from_row).collect()
    }

    async fn settle_escrow(&self, settlement: &EscrowSettlement) -> EscrowResult<EscrowBalance> {
        let outcome = settlement.outcome();
        let mut tx = self.pool.begin().await?;

        // Task first, in the same order as open_escrow and open_dispute
        let task_row = sqlx::query(
            r#"
            SELECT t.id, t.status FROM tasks t
            JOIN escrow_balances e ON e.task_id = t.id
            WHERE e.id = $1
            FOR UPDATE OF t
            "#,
        )
        .bind(settlement.escrow_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EscrowError::not_found(format!("escrow {}", settlement.escrow_id)))?;
        let task_id: i64 = task_row.try_get("id")?;
        let task_status: TaskStatus = task_row.try_get::<String, _>("status")?.parse()?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM escrow_balances WHERE id = $1 FOR UPDATE",
            ESCROW_COLUMNS
        ))
        .bind(settlement.escrow_id)
        .fetch_one(&mut *tx)
        .await?;
        let escrow = escrow_from_row(&row)?;
        escrow.status.validate_transition(outcome)?;

        match settlement.trigger {
            SettlementTrigger::Completion => {
                if !task_status.can_complete() {
                    return Err(EscrowError::invalid_state(
                        task_status.as_str(),
                        TaskStatus::Completed.as_str(),
                        "task is not in progress",
                    ));
                }
            }
            SettlementTrigger::Dispute {
                dispute_id,
                resolution,
                resolver_id,
            } => {
                if task_status != TaskStatus::Disputed {
                    return Err(EscrowError::invalid_state(
                        task_status.as_str(),
                        TaskStatus::Completed.as_str(),
                        "task is not disputed",
                    ));
                }
                let dispute = sqlx::query(&format!(
                    "SELECT {} FROM disputes WHERE id = $1 AND task_id = $2 FOR UPDATE",
                    DISPUTE_COLUMNS
                ))
                .bind(dispute_id)
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| EscrowError::not_found(format!("dispute {}", dispute_id)))?;
                let dispute = dispute_from_row(&dispute)?;
                if dispute.status != DisputeStatus::Open {
                    return Err(EscrowError::invalid_state(
                        dispute.status.as_str(),
                        DisputeStatus::Resolved.as_str(),
                        "dispute is not open",
                    ));
                }

                let closed = sqlx::query(
                    r#"
                    UPDATE disputes
                    SET status = 'resolved', resolution = $2, updated_at = NOW()
                    WHERE id = $1 AND status = 'open' AND assigned_admin = $3
                    "#,
                )
                .bind(dispute_id)
                .bind(resolution.as_str())
                .bind(resolver_id)
                .execute(&mut *tx)
                .await?;
                if closed.rows_affected() == 0 {
                    return Err(EscrowError::forbidden(
                        "only the assigned admin can resolve this dispute",
                    ));
                }
            }
        }

        let amount = Amount::new(escrow.amount, escrow.currency)?;
        credit_in_tx(&mut tx, settlement.beneficiary_wallet_id, &amount).await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE escrow_balances SET status = $1, updated_at = NOW()
            WHERE id = $2
            RETURNING {}
            "#,
            ESCROW_COLUMNS
        ))
        .bind(outcome.as_str())
        .bind(settlement.escrow_id)
        .fetch_one(&mut *tx)
        .await?;
        let settled = escrow_from_row(&row)?;

        sqlx::query("UPDATE tasks SET status = 'completed', updated_at = NOW() WHERE id = $1")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        if outcome == EscrowStatus::Released {
            sqlx::query(
                r#"
                INSERT INTO profiles (user_id, completed_tasks) VALUES ($1, 1)
                ON CONFLICT (user_id)
                DO UPDATE SET completed_tasks = profiles.completed_tasks + 1
                "#,
            )
            .bind(escrow.freelancer_id)
            .execute(&mut *tx)
            .await?;
        }

        insert_transaction(
            &mut tx,
            &NewTransaction {
                kind: if outcome == EscrowStatus::Released {
                    TransactionKind::EscrowRelease
                } else {
                    TransactionKind::EscrowRefund
                },
                from_wallet_id: None,
                to_wallet_id: Some(settlement.beneficiary_wallet_id),
                to_address: None,
                task_id: Some(escrow.task_id),
                amount: amount.value(),
                currency: amount.currency(),
                confirmed: true,
            },
        )
        .await?;

        tx.commit().await?;
        Ok(settled)
    }

    async fn open_dispute(&self, task_id: i64, opened_by: i64) -> EscrowResult<Dispute> {
        let mut tx = self.pool.begin().await?;

        let status: TaskStatus =
            sqlx::query_scalar::<_, String>("SELECT status FROM tasks WHERE id = $1 FOR UPDATE")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| EscrowError::not_found(format!("task {}", task_id)))?
                .parse()?;
        if !status.can_dispute() {
            return Err(EscrowError::invalid_state(
                status.as_str(),
                TaskStatus::Disputed.as_str(),
                "task is not in progress",
            ));
        }

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO disputes (task_id, opened_by, status)
            VALUES ($1, $2, 'open')
            ON CONFLICT (task_id) DO NOTHING
            RETURNING {}
            "#,
            DISPUTE_COLUMNS
        ))
        .bind(task_id)
        .bind(opened_by)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            EscrowError::validation(format!("dispute already exists for task {}", task_id))
        })?;
        let dispute = dispute_from_row(&row)?;

        sqlx::query("UPDATE tasks SET status = 'disputed', updated_at = NOW() WHERE id = $1")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(dispute)
    }

    async fn assign_dispute(&self, dispute_id: i64, admin_id: i64) -> EscrowResult<Dispute> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE disputes SET assigned_admin = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'open'
              AND (assigned_admin IS NULL OR assigned_admin = $2)
            RETURNING {}
            "#,
            DISPUTE_COLUMNS
        ))
        .bind(dispute_id)
        .bind(admin_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => dispute_from_row(&row),
            None => match self.dispute(dispute_id).await? {
                Some(existing) if existing.status != DisputeStatus::Open => {
                    Err(EscrowError::invalid_state(
                        existing.status.as_str(),
                        DisputeStatus::Open.as_str(),
                        "dispute is not open",
                    ))
                }
                Some(_) => Err(EscrowError::forbidden(
                    "dispute is already assigned to another admin",
                )),
                None => Err(EscrowError::not_found(format!("dispute {}", dispute_id))),
            },
        }
    }

    async fn dispute(&self, dispute_id: i64) -> EscrowResult<Option<Dispute>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM disputes WHERE id = $1",
            DISPUTE_COLUMNS
        ))
        .bind(dispute_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(dispute_from_row).transpose()
    }

    async fn completed_tasks(&self, user_id: i64) -> EscrowResult<i64> {
        let count: Option<i64> =
            sqlx::query_scalar("SELECT completed_tasks FROM profiles WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(count.unwrap_or(0))
    }

    async fn is_user_blocked(&self, user_id: i64) -> EscrowResult<bool> {
        let blocked: Option<bool> =
            sqlx::query_scalar("SELECT blocked FROM profiles WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(blocked.unwrap_or(false))
    }

    async fn ledger_totals(&self, currency: Currency) -> EscrowResult<LedgerTotals> {
        let wallet_balances: Decimal = sqlx::query_scalar(
            "SELECT COALESCE(SUM(balance), 0) FROM wallets WHERE currency = $1",
        )
        .bind(currency.code())
        .fetch_one(&self.pool)
        .await?;
        let escrow_held: Decimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0) FROM escrow_balances
            WHERE currency = $1 AND status = 'pending'
            "#,
        )
        .bind(currency.code())
        .fetch_one(&self.pool)
        .await?;

        Ok(LedgerTotals {
            currency,
            wallet_balances,
            escrow_held,
        })
    }
}
