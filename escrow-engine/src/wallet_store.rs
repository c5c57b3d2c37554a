//! Wallet provisioning and lookup

use crate::{
    chain::ChainRegistry,
    models::{Currency, Wallet},
    store::LedgerStore,
    EscrowResult,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{info, warn};

type CreationKey = (i64, Currency);

pub struct WalletStore {
    store: Arc<dyn LedgerStore>,
    chains: ChainRegistry,
    creation_locks: Mutex<HashMap<CreationKey, Arc<Mutex<()>>>>,
}

impl WalletStore {
    pub fn new(store: Arc<dyn LedgerStore>, chains: ChainRegistry) -> Self {
        Self {
            store,
            chains,
            creation_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn chains(&self) -> &ChainRegistry {
        &self.chains
    }

    /// Return the user's wallet for `currency`, provisioning an address on
    /// first use.
    ///
    /// Creation is serialized per `(user, currency)` so concurrent first
    /// requests ask the chain for exactly one address; the unique
    /// constraint on the table backs this up across processes.
    pub async fn get_or_create_wallet(
        &self,
        user_id: i64,
        currency: Currency,
    ) -> EscrowResult<Wallet> {
        if let Some(wallet) = self.store.wallet_for_user(user_id, currency).await? {
            return Ok(wallet);
        }

        let key = (user_id, currency);
        let lock = {
            let mut locks = self.creation_locks.lock().await;
            locks.entry(key).or_default().clone()
        };
        let result = {
            let _guard = lock.lock().await;
            self.create_locked(user_id, currency).await
        };

        let mut locks = self.creation_locks.lock().await;
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(&key);
        }
        result
    }

    async fn create_locked(&self, user_id: i64, currency: Currency) -> EscrowResult<Wallet> {
        if let Some(wallet) = self.store.wallet_for_user(user_id, currency).await? {
            return Ok(wallet);
        }

        let chain = self.chains.get(currency)?;
        let address = chain.create_address(&format!("user_{}", user_id)).await?;
        let wallet = self.store.insert_wallet(user_id, currency, &address).await?;
        info!(
            "Created {} wallet {} for user {} at {}",
            currency, wallet.id, user_id, wallet.address
        );

        if wallet.address == address {
            self.adopt_history(&wallet).await;
        }
        Ok(wallet)
    }

    /// Mark every tx the new address already has as seen, without credit
    async fn adopt_history(&self, wallet: &Wallet) {
        let chain = match self.chains.get(wallet.currency) {
            Ok(chain) => chain,
            Err(e) => {
                warn!("History adoption skipped for wallet {}: {}", wallet.id, e);
                return;
            }
        };

        let txids = match chain.list_transaction_ids(&wallet.address).await {
            Ok(txids) => txids,
            Err(e) => {
                warn!("History adoption failed for wallet {}: {}", wallet.id, e);
                return;
            }
        };

        let mut adopted = 0;
        for txid in txids {
            match self
                .store
                .mark_seen(&txid, Some(wallet.id), wallet.currency)
                .await
            {
                Ok(true) => adopted += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to adopt tx {} for wallet {}: {}", txid, wallet.id, e),
            }
        }
        if adopted > 0 {
            info!("Wallet {} adopted {} historical transactions", wallet.id, adopted);
        }
    }

    /// Whether `address` is one of our wallets for `currency`
    pub async fn is_our_address(&self, address: &str, currency: Currency) -> EscrowResult<bool> {
        Ok(self.store.wallet_by_address(address, currency).await?.is_some())
    }

    pub async fn wallet_by_address(
        &self,
        address: &str,
        currency: Currency,
    ) -> EscrowResult<Option<Wallet>> {
        self.store.wallet_by_address(address, currency).await
    }

    pub async fn wallets_for_user(&self, user_id: i64) -> EscrowResult<Vec<Wallet>> {
        self.store.wallets_for_user(user_id).await
    }
}
