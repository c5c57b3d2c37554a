//! In-memory ledger store
//!
//! All tables live behind one async mutex, so every trait method is a
//! single critical section. Each method validates everything it needs
//! before touching state, which gives the same all-or-nothing behaviour
//! as a database transaction. Used for tests and dry runs.

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
        Wallet, WalletTransaction,
    },
    EscrowResult,
};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    wallets: BTreeMap<i64, Wallet>,
    transactions: Vec<Transaction>,
    ingested: HashMap<String, WalletTransaction>,
    tasks: BTreeMap<i64, Task>,
    offers: BTreeMap<i64, TaskOffer>,
    escrows: BTreeMap<i64, EscrowBalance>,
    disputes: BTreeMap<i64, Dispute>,
    completed_tasks: HashMap<i64, i64>,
    blocked_users: HashSet<i64>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn wallet_mut(&mut self, wallet_id: i64) -> EscrowResult<&mut Wallet> {
        self.wallets
            .get_mut(&wallet_id)
            .ok_or_else(|| EscrowError::not_found(format!("wallet {}", wallet_id)))
    }

    /// Checks that a debit would succeed without applying it
    fn check_debit(&self, wallet_id: i64, amount: &Amount) -> EscrowResult<()> {
        let wallet = self
            .wallets
            .get(&wallet_id)
            .ok_or_else(|| EscrowError::not_found(format!("wallet {}", wallet_id)))?;
        check_currency(wallet, amount)?;
        if wallet.balance < amount.value() {
            return Err(EscrowError::insufficient_funds(amount.value(), wallet.balance));
        }
        Ok(())
    }

    fn check_credit(&self, wallet_id: i64, amount: &Amount) -> EscrowResult<()> {
        let wallet = self
            .wallets
            .get(&wallet_id)
            .ok_or_else(|| EscrowError::not_found(format!("wallet {}", wallet_id)))?;
        check_currency(wallet, amount)
    }

    /// Task and dispute preconditions of a settlement
    fn check_trigger(&self, task_id: i64, trigger: &SettlementTrigger) -> EscrowResult<()> {
        let task = self
            .tasks
            .get(&task_id)
            .ok_or_else(|| EscrowError::not_found(format!("task {}", task_id)))?;
        match *trigger {
            SettlementTrigger::Completion => {
                if !task.status.can_complete() {
                    return Err(EscrowError::invalid_state(
                        task.status.as_str(),
                        TaskStatus::Completed.as_str(),
                        "task is not in progress",
                    ));
                }
            }
            SettlementTrigger::Dispute {
                dispute_id,
                resolver_id,
                ..
            } => {
                if task.status != TaskStatus::Disputed {
                    return Err(EscrowError::invalid_state(
                        task.status.as_str(),
                        TaskStatus::Completed.as_str(),
                        "task is not disputed",
                    ));
                }
                let dispute = self
                    .disputes
                    .get(&dispute_id)
                    .filter(|d| d.task_id == task_id)
                    .ok_or_else(|| EscrowError::not_found(format!("dispute {}", dispute_id)))?;
                if dispute.status != DisputeStatus::Open {
                    return Err(EscrowError::invalid_state(
                        dispute.status.as_str(),
                        DisputeStatus::Resolved.as_str(),
                        "dispute is not open",
                    ));
                }
                if dispute.assigned_admin != Some(resolver_id) {
                    return Err(EscrowError::forbidden(
                        "only the assigned admin can resolve this dispute",
                    ));
                }
            }
        }
        Ok(())
    }

    fn record(&mut self, new: NewTransaction) -> Transaction {
        let transaction = Transaction {
            id: self.next_id(),
            kind: new.kind,
            from_wallet_id: new.from_wallet_id,
            to_wallet_id: new.to_wallet_id,
            to_address: new.to_address,
            task_id: new.task_id,
            amount: new.amount,
            currency: new.currency,
            confirmed: new.confirmed,
            created_at: Utc::now(),
        };
        self.transactions.push(transaction.clone());
        transaction
    }
}

fn check_currency(wallet: &Wallet, amount: &Amount) -> EscrowResult<()> {
    if wallet.currency != amount.currency() {
        return Err(EscrowError::CurrencyMismatch {
            left: wallet.currency,
            right: amount.currency(),
        });
    }
    Ok(())
}

#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Mutex<MemoryState>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an open task
    pub async fn insert_task(&self, client_id: i64, title: &str, currency: Currency) -> Task {
        let mut state = self.state.lock().await;
        let task = Task {
            id: state.next_id(),
            client_id,
            title: title.to_string(),
            currency,
            status: TaskStatus::Open,
            created_at: Utc::now(),
        };
        state.tasks.insert(task.id, task.clone());
        task
    }

    /// Seed a pending offer on a task
    pub async fn insert_offer(&self, task_id: i64, freelancer_id: i64, price: Decimal) -> TaskOffer {
        let mut state = self.state.lock().await;
        let offer = TaskOffer {
            id: state.next_id(),
            task_id,
            freelancer_id,
            price,
            status: OfferStatus::Pending,
            created_at: Utc::now(),
        };
        state.offers.insert(offer.id, offer.clone());
        offer
    }

    pub async fn set_user_blocked(&self, user_id: i64, blocked: bool) {
        let mut state = self.state.lock().await;
        if blocked {
            state.blocked_users.insert(user_id);
        } else {
            state.blocked_users.remove(&user_id);
        }
    }

    pub async fn ingested_rows(&self) -> Vec<WalletTransaction> {
        self.state.lock().await.ingested.values().cloned().collect()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn wallet(&self, wallet_id: i64) -> EscrowResult<Option<Wallet>> {
        Ok(self.state.lock().await.wallets.get(&wallet_id).cloned())
    }

    async fn wallet_for_user(
        &self,
        user_id: i64,
        currency: Currency,
    ) -> EscrowResult<Option<Wallet>> {
        let state = self.state.lock().await;
        Ok(state
            .wallets
            .values()
            .find(|w| w.user_id == user_id && w.currency == currency)
            .cloned())
    }

    async fn wallet_by_address(
        &self,
        address: &str,
        currency: Currency,
    ) -> EscrowResult<Option<Wallet>> {
        let state = self.state.lock().await;
        Ok(state
            .wallets
            .values()
            .find(|w| w.address == address && w.currency == currency)
            .cloned())
    }

    async fn wallets_for_user(&self, user_id: i64) -> EscrowResult<Vec<Wallet>> {
        let state = self.state.lock().await;
        Ok(state
            .wallets
            .values()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_wallets(&self) -> EscrowResult<Vec<Wallet>> {
        Ok(self.state.lock().await.wallets.values().cloned().collect())
    }

    async fn insert_wallet(
        &self,
        user_id: i64,
        currency: Currency,
        address: &str,
    ) -> EscrowResult<Wallet> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .wallets
            .values()
            .find(|w| w.user_id == user_id && w.currency == currency)
        {
            return Ok(existing.clone());
        }
        if state
            .wallets
            .values()
            .any(|w| w.address == address && w.currency == currency)
        {
            return Err(EscrowError::validation(format!(
                "address {} already assigned",
                address
            )));
        }
        let wallet = Wallet {
            id: state.next_id(),
            user_id,
            currency,
            address: address.to_string(),
            balance: Decimal::ZERO,
            created_at: Utc::now(),
        };
        state.wallets.insert(wallet.id, wallet.clone());
        Ok(wallet)
    }

    async fn credit_wallet(&self, wallet_id: i64, amount: &Amount) -> EscrowResult<Wallet> {
        let mut state = self.state.lock().await;
        state.check_credit(wallet_id, amount)?;
        let wallet = state.wallet_mut(wallet_id)?;
        wallet.balance += amount.value();
        Ok(wallet.clone())
    }

    async fn debit_wallet(&self, wallet_id: i64, amount: &Amount) -> EscrowResult<Wallet> {
        let mut state = self.state.lock().await;
        state.check_debit(wallet_id, amount)?;
        let wallet = state.wallet_mut(wallet_id)?;
        wallet.balance -= amount.value();
        Ok(wallet.clone())
    }

    async fn apply_withdrawal(&self, posting: &WithdrawalPosting) -> EscrowResult<Transaction> {
        let mut state = self.state.lock().await;
        state.check_debit(posting.from_wallet_id, &posting.debit)?;
        if let Some(internal) = posting.internal_wallet_id {
            state.check_credit(internal, &posting.remaining)?;
        }

        state.wallet_mut(posting.from_wallet_id)?.balance -= posting.debit.value();
        if let Some(internal) = posting.internal_wallet_id {
            state.wallet_mut(internal)?.balance += posting.remaining.value();
        }

        let currency = posting.debit.currency();
        let transfer = state.record(NewTransaction {
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
        });
        if !posting.commission.is_zero() {
            state.record(NewTransaction {
                kind: TransactionKind::Commission,
                from_wallet_id: Some(posting.from_wallet_id),
                to_wallet_id: None,
                to_address: Some(posting.operator_address.clone()),
                task_id: None,
                amount: posting.commission.value(),
                currency,
                confirmed: false,
            });
        }
        Ok(transfer)
    }

    async fn transactions_for_wallet(&self, wallet_id: i64) -> EscrowResult<Vec<Transaction>> {
        let state = self.state.lock().await;
        let mut rows: Vec<Transaction> = state
            .transactions
            .iter()
            .filter(|t| t.from_wallet_id == Some(wallet_id) || t.to_wallet_id == Some(wallet_id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(rows)
    }

    async fn is_ingested(&self, txid: &str) -> EscrowResult<bool> {
        Ok(self.state.lock().await.ingested.contains_key(txid))
    }

    async fn mark_seen(
        &self,
        txid: &str,
        wallet_id: Option<i64>,
        currency: Currency,
    ) -> EscrowResult<bool> {
        let mut state = self.state.lock().await;
        if state.ingested.contains_key(txid) {
            return Ok(false);
        }
        state.ingested.insert(
            txid.to_string(),
            WalletTransaction {
                txid: txid.to_string(),
                wallet_id,
                amount: Decimal::ZERO,
                currency,
                confirmed: true,
                created_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn ingest_credits(
        &self,
        wallet_id: i64,
        credits: &[InboundCredit],
    ) -> EscrowResult<Vec<InboundCredit>> {
        let mut state = self.state.lock().await;
        for credit in credits {
            state.check_credit(wallet_id, &credit.amount)?;
        }

        let mut applied = Vec::new();
        let mut total = Decimal::ZERO;
        for credit in credits {
            if state.ingested.contains_key(&credit.txid) {
                continue;
            }
            state.ingested.insert(
                credit.txid.clone(),
                WalletTransaction {
                    txid: credit.txid.clone(),
                    wallet_id: Some(wallet_id),
                    amount: credit.amount.value(),
                    currency: credit.amount.currency(),
                    confirmed: true,
                    created_at: Utc::now(),
                },
            );
            if credit.amount.is_zero() {
                continue;
            }
            total += credit.amount.value();
            state.record(NewTransaction {
                kind: TransactionKind::Deposit,
                from_wallet_id: None,
                to_wallet_id: Some(wallet_id),
                to_address: None,
                task_id: None,
                amount: credit.amount.value(),
                currency: credit.amount.currency(),
                confirmed: true,
            });
            applied.push(credit.clone());
        }
        if !total.is_zero() {
            state.wallet_mut(wallet_id)?.balance += total;
        }
        Ok(applied)
    }

    async fn task(&self, task_id: i64) -> EscrowResult<Option<Task>> {
        Ok(self.state.lock().await.tasks.get(&task_id).cloned())
    }

    async fn offer(&self, offer_id: i64) -> EscrowResult<Option<TaskOffer>> {
        Ok(self.state.lock().await.offers.get(&offer_id).cloned())
    }

    async fn accepted_offer(&self, task_id: i64) -> EscrowResult<Option<TaskOffer>> {
        let state = self.state.lock().await;
        Ok(state
            .offers
            .values()
            .find(|o| o.task_id == task_id && o.status == OfferStatus::Accepted)
            .cloned())
    }

    async fn open_escrow(&self, hold: &EscrowHold) -> EscrowResult<EscrowBalance> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get(&hold.task_id)
            .ok_or_else(|| EscrowError::not_found(format!("task {}", hold.task_id)))?;
        if !task.status.can_accept_offer() {
            return Err(EscrowError::invalid_state(
                task.status.as_str(),
                TaskStatus::InProgress.as_str(),
                "task is not open",
            ));
        }
        let offer = state
            .offers
            .get(&hold.offer_id)
            .filter(|o| o.task_id == hold.task_id)
            .ok_or_else(|| EscrowError::not_found(format!("offer {}", hold.offer_id)))?;
        if offer.status != OfferStatus::Pending {
            return Err(EscrowError::invalid_state(
                offer.status.as_str(),
                OfferStatus::Accepted.as_str(),
                "offer is no longer pending",
            ));
        }
        if state
            .escrows
            .values()
            .any(|e| e.task_id == hold.task_id && e.status == EscrowStatus::Pending)
        {
            return Err(EscrowError::invalid_state(
                "pending",
                "pending",
                "task already has an open escrow",
            ));
        }
        state.check_debit(hold.client_wallet_id, &hold.amount)?;

        state.wallet_mut(hold.client_wallet_id)?.balance -= hold.amount.value();
        let escrow = EscrowBalance {
            id: state.next_id(),
            task_id: hold.task_id,
            client_id: hold.client_id,
            freelancer_id: hold.freelancer_id,
            amount: hold.amount.value(),
            currency: hold.amount.currency(),
            status: EscrowStatus::Pending,
            created_at: Utc::now(),
        };
        state.escrows.insert(escrow.id, escrow.clone());
        for offer in state.offers.values_mut().filter(|o| o.task_id == hold.task_id) {
            offer.status = if offer.id == hold.offer_id {
                OfferStatus::Accepted
            } else {
                OfferStatus::Rejected
            };
        }
        if let Some(task) = state.tasks.get_mut(&hold.task_id) {
            task.status = TaskStatus::InProgress;
        }
        state.record(NewTransaction {
            kind: TransactionKind::EscrowHold,
            from_wallet_id: Some(hold.client_wallet_id),
            to_wallet_id: None,
            to_address: None,
            task_id: Some(hold.task_id),
            amount: hold.amount.value(),
            currency: hold.amount.currency(),
            confirmed: true,
        });
        Ok(escrow)
    }

    async fn escrow(&self, escrow_id: i64) -> EscrowResult<Option<EscrowBalance>> {
        let state = self.state.lock().await;
        Ok(state.escrows.get(&escrow_id).cloned())
    }

    async fn escrow_for_task(&self, task_id: i64) -> EscrowResult<Option<EscrowBalance>> {
        let state = self.state.lock().await;
        Ok(state
            .escrows
            .values()
            .filter(|e| e.task_id == task_id)
            .max_by_key(|e| e.id)
            .cloned())
    }

    async fn escrows_for_user(&self, user_id: i64) -> EscrowResult<Vec<EscrowBalance>> {
        let state = self.state.lock().await;
        let mut rows: Vec<EscrowBalance> = state
            .escrows
            .values()
            .filter(|e| e.client_id == user_id || e.freelancer_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(rows)
    }

    async fn settle_escrow(&self, settlement: &EscrowSettlement) -> EscrowResult<EscrowBalance> {
        let mut state = self.state.lock().await;
        let outcome = settlement.outcome();
        let escrow = state
            .escrows
            .get(&settlement.escrow_id)
            .cloned()
            .ok_or_else(|| EscrowError::not_found(format!("escrow {}", settlement.escrow_id)))?;
        escrow.status.validate_transition(outcome)?;
        state.check_trigger(escrow.task_id, &settlement.trigger)?;
        let amount = Amount::new(escrow.amount, escrow.currency)?;
        state.check_credit(settlement.beneficiary_wallet_id, &amount)?;

        state.wallet_mut(settlement.beneficiary_wallet_id)?.balance += amount.value();
        let settled = {
            let row = state
                .escrows
                .get_mut(&settlement.escrow_id)
                .ok_or_else(|| EscrowError::not_found(format!("escrow {}", settlement.escrow_id)))?;
            row.status = outcome;
            row.clone()
        };
        if let Some(task) = state.tasks.get_mut(&escrow.task_id) {
            task.status = TaskStatus::Completed;
        }
        if outcome == EscrowStatus::Released {
            *state.completed_tasks.entry(escrow.freelancer_id).or_insert(0) += 1;
        }
        if let SettlementTrigger::Dispute {
            dispute_id,
            resolution,
            ..
        } = settlement.trigger
        {
            if let Some(dispute) = state.disputes.get_mut(&dispute_id) {
                dispute.status = DisputeStatus::Resolved;
                dispute.resolution = Some(resolution);
                dispute.updated_at = Utc::now();
            }
        }
        state.record(NewTransaction {
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
        });
        Ok(settled)
    }

    async fn open_dispute(&self, task_id: i64, opened_by: i64) -> EscrowResult<Dispute> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get(&task_id)
            .ok_or_else(|| EscrowError::not_found(format!("task {}", task_id)))?;
        if !task.status.can_dispute() {
            return Err(EscrowError::invalid_state(
                task.status.as_str(),
                TaskStatus::Disputed.as_str(),
                "task is not in progress",
            ));
        }
        if state.disputes.values().any(|d| d.task_id == task_id) {
            return Err(EscrowError::validation(format!(
                "dispute already exists for task {}",
                task_id
            )));
        }
        let now = Utc::now();
        let dispute = Dispute {
            id: state.next_id(),
            task_id,
            opened_by,
            assigned_admin: None,
            status: DisputeStatus::Open,
            resolution: None,
            created_at: now,
            updated_at: now,
        };
        state.disputes.insert(dispute.id, dispute.clone());
        if let Some(task) = state.tasks.get_mut(&task_id) {
            task.status = TaskStatus::Disputed;
        }
        Ok(dispute)
    }

    async fn assign_dispute(&self, dispute_id: i64, admin_id: i64) -> EscrowResult<Dispute> {
        let mut state = self.state.lock().await;
        let dispute = state
            .disputes
            .get_mut(&dispute_id)
            .ok_or_else(|| EscrowError::not_found(format!("dispute {}", dispute_id)))?;
        if dispute.status != DisputeStatus::Open {
            return Err(EscrowError::invalid_state(
                dispute.status.as_str(),
                DisputeStatus::Open.as_str(),
                "dispute is not open",
            ));
        }
        if dispute.assigned_admin.map_or(false, |current| current != admin_id) {
            return Err(EscrowError::forbidden(
                "dispute is already assigned to another admin",
            ));
        }
        dispute.assigned_admin = Some(admin_id);
        dispute.updated_at = Utc::now();
        Ok(dispute.clone())
    }

    async fn dispute(&self, dispute_id: i64) -> EscrowResult<Option<Dispute>> {
        Ok(self.state.lock().await.disputes.get(&dispute_id).cloned())
    }

    async fn completed_tasks(&self, user_id: i64) -> EscrowResult<i64> {
        Ok(self
            .state
            .lock()
            .await
            .completed_tasks
            .get(&user_id)
            .copied()
            .unwrap_or(0))
    }

    async fn is_user_blocked(&self, user_id: i64) -> EscrowResult<bool> {
        Ok(self.state.lock().await.blocked_users.contains(&user_id))
    }

    async fn ledger_totals(&self, currency: Currency) -> EscrowResult<LedgerTotals> {
        let state = self.state.lock().await;
        Ok(LedgerTotals {
            currency,
            wallet_balances: state
                .wallets
                .values()
                .filter(|w| w.currency == currency)
                .map(|w| w.balance)
                .sum(),
            escrow_held: state
                .escrows
                .values()
                .filter(|e| e.currency == currency && e.status == EscrowStatus::Pending)
                .map(|e| e.amount)
                .sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn btc(value: Decimal) -> Amount {
        Amount::new(value, Currency::Btc).unwrap()
    }

    #[tokio::test]
    async fn test_insert_wallet_returns_existing_on_conflict() {
        let store = MemoryLedgerStore::new();
        let first = store.insert_wallet(1, Currency::Btc, "addr-a").await.unwrap();
        let second = store.insert_wallet(1, Currency::Btc, "addr-b").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.address, "addr-a");
        assert_eq!(store.list_wallets().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_debit_is_guarded() {
        let store = MemoryLedgerStore::new();
        let wallet = store.insert_wallet(1, Currency::Btc, "addr").await.unwrap();
        store.credit_wallet(wallet.id, &btc(dec!(0.5))).await.unwrap();

        match store.debit_wallet(wallet.id, &btc(dec!(0.6))).await {
            Err(EscrowError::InsufficientFunds { .. }) => {}
            other => panic!("Expected InsufficientFunds, got {:?}", other),
        }
        let unchanged = store.wallet(wallet.id).await.unwrap().unwrap();
        assert_eq!(unchanged.balance, dec!(0.5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_debits_spend_once() {
        let store = Arc::new(MemoryLedgerStore::new());
        let wallet = store.insert_wallet(1, Currency::Btc, "addr").await.unwrap();
        store.credit_wallet(wallet.id, &btc(dec!(1))).await.unwrap();

        let wallet_id = wallet.id;
        let debit = move |store: Arc<MemoryLedgerStore>| {
            tokio::spawn(async move { store.debit_wallet(wallet_id, &btc(dec!(0.6))).await })
        };
        let (first, second) = tokio::join!(debit(store.clone()), debit(store.clone()));
        let results = [first.unwrap(), second.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(EscrowError::InsufficientFunds { .. }))));
        let after = store.wallet(wallet.id).await.unwrap().unwrap();
        assert_eq!(after.balance, dec!(0.4));
    }

    #[tokio::test]
    async fn test_ingest_credits_skips_known_txids() {
        let store = MemoryLedgerStore::new();
        let wallet = store.insert_wallet(1, Currency::Btc, "addr").await.unwrap();
        let credit = InboundCredit {
            txid: "aa".to_string(),
            amount: btc(dec!(0.25)),
        };

        let first = store
            .ingest_credits(wallet.id, std::slice::from_ref(&credit))
            .await
            .unwrap();
        let second = store
            .ingest_credits(wallet.id, std::slice::from_ref(&credit))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(
            store.wallet(wallet.id).await.unwrap().unwrap().balance,
            dec!(0.25)
        );
    }

    #[tokio::test]
    async fn test_zero_credit_only_marks_seen() {
        let store = MemoryLedgerStore::new();
        let wallet = store.insert_wallet(1, Currency::Btc, "addr").await.unwrap();
        let applied = store
            .ingest_credits(
                wallet.id,
                &[InboundCredit {
                    txid: "zero".to_string(),
                    amount: Amount::zero(Currency::Btc),
                }],
            )
            .await
            .unwrap();
        assert!(applied.is_empty());
        assert!(store.is_ingested("zero").await.unwrap());
        assert!(store
            .transactions_for_wallet(wallet.id)
            .await
            .unwrap()
            .is_empty());
    }
}
