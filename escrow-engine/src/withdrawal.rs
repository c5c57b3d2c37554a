//! Withdrawal requests
//!
//! Validates a user's withdrawal, debits the full amount, and routes the
//! commission and remainder: internal destinations are credited in the
//! same database transaction, external ones go through the payout pool.

use crate::{
    config::CurrencyTerms,
    error::EscrowError,
    ledger::Amount,
    models::{require_claims, Currency, Transaction, UserClaims},
    payout_pool::{PayoutPool, WithdrawalGate},
    store::{LedgerStore, WithdrawalPosting},
    wallet_store::WalletStore,
    EscrowResult,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::info;

/// Per-currency withdrawal terms
#[derive(Debug, Clone, PartialEq)]
pub struct WithdrawalPolicy {
    pub min_amount: Amount,
    pub commission_percent: Decimal,
    pub operator_address: String,
}

impl From<CurrencyTerms> for WithdrawalPolicy {
    fn from(terms: CurrencyTerms) -> Self {
        Self {
            min_amount: terms.min_withdrawal,
            commission_percent: terms.commission_percent,
            operator_address: terms.operator_address,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub currency: Currency,
    pub to_address: String,
    /// Decimal string as entered by the user
    pub amount: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawalReceipt {
    pub transaction: Transaction,
    pub amount: Amount,
    pub commission: Amount,
    pub remaining: Amount,
    pub internal: bool,
}

pub struct WithdrawalService {
    store: Arc<dyn LedgerStore>,
    wallets: Arc<WalletStore>,
    pool: Arc<PayoutPool>,
    gate: Arc<WithdrawalGate>,
    policies: HashMap<Currency, WithdrawalPolicy>,
}

impl WithdrawalService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        wallets: Arc<WalletStore>,
        pool: Arc<PayoutPool>,
        gate: Arc<WithdrawalGate>,
        policies: HashMap<Currency, WithdrawalPolicy>,
    ) -> Self {
        Self {
            store,
            wallets,
            pool,
            gate,
            policies,
        }
    }

    pub async fn withdraw(
        &self,
        claims: Option<&UserClaims>,
        request: &WithdrawalRequest,
    ) -> EscrowResult<WithdrawalReceipt> {
        self.gate.ensure_open().await?;
        let claims = require_claims(claims)?;
        if self.store.is_user_blocked(claims.user_id).await? {
            return Err(EscrowError::forbidden("user is blocked"));
        }

        let currency = request.currency;
        let to_address = request.to_address.trim();
        if to_address.is_empty() || request.amount.trim().is_empty() {
            return Err(EscrowError::validation("destination and amount required"));
        }
        let amount = Amount::parse(&request.amount, currency)?;

        let chain = self.wallets.chains().get(currency)?;
        if !chain.validate_address(to_address) {
            return Err(EscrowError::validation(format!(
                "invalid {} address format",
                currency
            )));
        }

        let policy = self.policies.get(&currency).ok_or_else(|| {
            EscrowError::config(format!("no withdrawal policy for {}", currency))
        })?;
        if amount.value() < policy.min_amount.value() {
            return Err(EscrowError::validation(format!(
                "amount below minimum of {} {}",
                policy.min_amount, currency
            )));
        }

        let wallet = self
            .store
            .wallet_for_user(claims.user_id, currency)
            .await?
            .ok_or_else(|| EscrowError::insufficient_funds(amount.value(), Decimal::ZERO))?;
        if wallet.balance < amount.value() {
            return Err(EscrowError::insufficient_funds(amount.value(), wallet.balance));
        }

        let commission = amount.percent(policy.commission_percent);
        let remaining = amount.checked_sub(&commission)?;
        if remaining.is_zero() {
            return Err(EscrowError::validation("amount too small for commission"));
        }

        let internal_wallet = self.wallets.wallet_by_address(to_address, currency).await?;
        if internal_wallet.as_ref().map(|w| w.id) == Some(wallet.id) {
            return Err(EscrowError::validation("cannot withdraw to your own wallet"));
        }

        let transaction = self
            .store
            .apply_withdrawal(&WithdrawalPosting {
                from_wallet_id: wallet.id,
                debit: amount,
                commission,
                operator_address: policy.operator_address.clone(),
                remaining,
                to_address: to_address.to_string(),
                internal_wallet_id: internal_wallet.as_ref().map(|w| w.id),
            })
            .await?;

        self.pool.add(&policy.operator_address, &commission).await?;
        if internal_wallet.is_none() {
            self.pool.add(to_address, &remaining).await?;
        }

        info!(
            "Withdrawal by user {}: {} {} to {} (commission {}, {})",
            claims.user_id,
            remaining,
            currency,
            to_address,
            commission,
            if internal_wallet.is_some() { "internal" } else { "queued" }
        );

        Ok(WithdrawalReceipt {
            transaction,
            amount,
            commission,
            remaining,
            internal: internal_wallet.is_some(),
        })
    }
}
