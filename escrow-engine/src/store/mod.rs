//! Ledger persistence
//!
//! [`LedgerStore`] is the seam between the services and the database.
//! Every method that touches more than one row is a single unit of work:
//! either all of its effects are visible afterwards or none are. Balance
//! debits are guarded (`balance >= amount`) inside the same statement that
//! applies them, so two concurrent debits can never both pass a stale check.

pub mod memory;
pub mod postgres;

use crate::{
    ledger::Amount,
    models::{
        Currency, Dispute, DisputeResolution, EscrowBalance, EscrowStatus, LedgerTotals, Task,
        TaskOffer, Transaction, Wallet,
    },
    EscrowResult,
};
use async_trait::async_trait;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

/// A confirmed inbound chain payment to credit to one wallet
#[derive(Debug, Clone, PartialEq)]
pub struct InboundCredit {
    pub txid: String,
    pub amount: Amount,
}

/// Everything needed to move an offer price into escrow
#[derive(Debug, Clone)]
pub struct EscrowHold {
    pub task_id: i64,
    pub offer_id: i64,
    pub client_id: i64,
    pub freelancer_id: i64,
    pub client_wallet_id: i64,
    pub amount: Amount,
}

/// Why an escrow is being settled. The store re-checks the task and
/// dispute rows for the trigger under the same lock that settles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementTrigger {
    /// The client confirmed an `in_progress` task
    Completion,
    /// The assigned admin resolved the task's open dispute
    Dispute {
        dispute_id: i64,
        resolution: DisputeResolution,
        resolver_id: i64,
    },
}

impl SettlementTrigger {
    pub fn outcome(&self) -> EscrowStatus {
        match self {
            Self::Completion => EscrowStatus::Released,
            Self::Dispute { resolution, .. } => resolution.escrow_outcome(),
        }
    }
}

/// Terminal settlement of a pending escrow
#[derive(Debug, Clone)]
pub struct EscrowSettlement {
    pub escrow_id: i64,
    pub beneficiary_wallet_id: i64,
    pub trigger: SettlementTrigger,
}

impl EscrowSettlement {
    pub fn outcome(&self) -> EscrowStatus {
        self.trigger.outcome()
    }
}

/// Balance effects of an accepted withdrawal request
#[derive(Debug, Clone)]
pub struct WithdrawalPosting {
    pub from_wallet_id: i64,
    /// Full amount debited from the sender
    pub debit: Amount,
    /// Part routed to the operator
    pub commission: Amount,
    pub operator_address: String,
    /// Part delivered to `to_address`
    pub remaining: Amount,
    pub to_address: String,
    /// Set when `to_address` belongs to one of our wallets
    pub internal_wallet_id: Option<i64>,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn wallet(&self, wallet_id: i64) -> EscrowResult<Option<Wallet>>;

    async fn wallet_for_user(&self, user_id: i64, currency: Currency)
        -> EscrowResult<Option<Wallet>>;

    async fn wallet_by_address(&self, address: &str, currency: Currency)
        -> EscrowResult<Option<Wallet>>;

    async fn wallets_for_user(&self, user_id: i64) -> EscrowResult<Vec<Wallet>>;

    async fn list_wallets(&self) -> EscrowResult<Vec<Wallet>>;

    /// Insert a zero-balance wallet. If `(user_id, currency)` already exists
    /// the existing row is returned unchanged.
    async fn insert_wallet(
        &self,
        user_id: i64,
        currency: Currency,
        address: &str,
    ) -> EscrowResult<Wallet>;

    /// `balance = balance + amount`
    async fn credit_wallet(&self, wallet_id: i64, amount: &Amount) -> EscrowResult<Wallet>;

    /// `balance = balance - amount`, only if `balance >= amount`
    async fn debit_wallet(&self, wallet_id: i64, amount: &Amount) -> EscrowResult<Wallet>;

    /// Debit the sender, record audit rows, and credit an internal recipient
    async fn apply_withdrawal(&self, posting: &WithdrawalPosting) -> EscrowResult<Transaction>;

    async fn transactions_for_wallet(&self, wallet_id: i64) -> EscrowResult<Vec<Transaction>>;

    async fn is_ingested(&self, txid: &str) -> EscrowResult<bool>;

    /// Record a txid as seen without crediting anything
    async fn mark_seen(
        &self,
        txid: &str,
        wallet_id: Option<i64>,
        currency: Currency,
    ) -> EscrowResult<bool>;

    /// Credit a batch of confirmed inbound payments to one wallet.
    ///
    /// Each txid is inserted into the dedup table only if absent; only the
    /// newly inserted ones contribute to the single balance update and get
    /// an audit row. Returns the credits that were actually applied.
    async fn ingest_credits(
        &self,
        wallet_id: i64,
        credits: &[InboundCredit],
    ) -> EscrowResult<Vec<InboundCredit>>;

    async fn task(&self, task_id: i64) -> EscrowResult<Option<Task>>;

    async fn offer(&self, offer_id: i64) -> EscrowResult<Option<TaskOffer>>;

    async fn accepted_offer(&self, task_id: i64) -> EscrowResult<Option<TaskOffer>>;

    /// Debit the client, create the pending escrow, accept the offer,
    /// reject its siblings and move the task to `in_progress`
    async fn open_escrow(&self, hold: &EscrowHold) -> EscrowResult<EscrowBalance>;

    async fn escrow(&self, escrow_id: i64) -> EscrowResult<Option<EscrowBalance>>;

    /// Most recent escrow for a task
    async fn escrow_for_task(&self, task_id: i64) -> EscrowResult<Option<EscrowBalance>>;

    async fn escrows_for_user(&self, user_id: i64) -> EscrowResult<Vec<EscrowBalance>>;

    /// Credit the beneficiary and move a pending escrow to its terminal state.
    ///
    /// A completion needs the task `in_progress`. A dispute settlement needs
    /// the task `disputed` and its open dispute assigned to the resolver,
    /// and closes that dispute in the same unit of work.
    async fn settle_escrow(&self, settlement: &EscrowSettlement) -> EscrowResult<EscrowBalance>;

    /// Open the single dispute for an in-progress task
    async fn open_dispute(&self, task_id: i64, opened_by: i64) -> EscrowResult<Dispute>;

    /// Claim an open dispute. Fails with `Forbidden` if another admin holds it.
    async fn assign_dispute(&self, dispute_id: i64, admin_id: i64) -> EscrowResult<Dispute>;

    async fn dispute(&self, dispute_id: i64) -> EscrowResult<Option<Dispute>>;

    async fn completed_tasks(&self, user_id: i64) -> EscrowResult<i64>;

    async fn is_user_blocked(&self, user_id: i64) -> EscrowResult<bool>;

    /// Wallet balances plus pending escrow for one currency
    async fn ledger_totals(&self, currency: Currency) -> EscrowResult<LedgerTotals>;
}
