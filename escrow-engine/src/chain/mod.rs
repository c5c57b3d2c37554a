//! Chain adapters
//!
//! One [`ChainAdapter`] per supported currency hides the wallet RPC behind a
//! uniform surface: address creation and validation, inbound transaction
//! discovery, batched payouts and node balance.

pub mod electrum;
pub mod monero;
pub mod rpc;

use crate::{
    config::AppConfig,
    error::EscrowError,
    ledger::Amount,
    models::{Currency, PayoutOutput},
    EscrowResult,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};

pub use electrum::{ElectrumAdapter, ElectrumConfig};
pub use monero::{MoneroAdapter, MoneroConfig, MoneroNetwork};

/// Result of inspecting one txid against one of our addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingCheck {
    /// Not yet buried deep enough to credit
    Unconfirmed,
    /// Confirmed; the amount is the sum of outputs paying the address and
    /// may be zero when the tx only spends from it
    Confirmed(Amount),
}

/// Node-reported wallet balance; `unconfirmed` may be negative while a
/// spend is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBalance {
    pub currency: Currency,
    pub confirmed: Decimal,
    pub unconfirmed: Decimal,
}

#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn currency(&self) -> Currency;

    /// Syntactic and network validation, no RPC round-trip
    fn validate_address(&self, address: &str) -> bool;

    /// Create a fresh receive address in the node wallet
    async fn create_address(&self, label: &str) -> EscrowResult<String>;

    /// Every txid the node associates with `address`, oldest first
    async fn list_transaction_ids(&self, address: &str) -> EscrowResult<Vec<String>>;

    async fn check_incoming(&self, address: &str, txid: &str) -> EscrowResult<IncomingCheck>;

    /// Broadcast one transaction paying every output; returns its txid
    async fn pay_to_many(&self, outputs: &[PayoutOutput]) -> EscrowResult<String>;

    async fn confirmations(&self, txid: &str) -> EscrowResult<u64>;

    async fn balance(&self) -> EscrowResult<ChainBalance>;
}

/// Substrings a wallet node uses when it refuses a payout for its content
const REJECTION_MARKERS: &[&str] = &[
    "invalid address",
    "invalid bitcoin address",
    "wrong address",
    "dust",
    "vout-negative",
    "zero destination",
    "amount too small",
    "invalid amount",
];

/// Turn a node's refusal of the payout itself into `Validation` so the
/// settler fails the records instead of retrying them forever. Anything
/// else passes through unchanged.
pub(crate) fn classify_payout_rejection(err: EscrowError, reject_codes: &[i64]) -> EscrowError {
    match err {
        EscrowError::ChainRpc { code, message } => {
            let lowered = message.to_lowercase();
            if reject_codes.contains(&code)
                || REJECTION_MARKERS.iter().any(|marker| lowered.contains(marker))
            {
                EscrowError::validation(format!("node rejected payout ({}): {}", code, message))
            } else {
                EscrowError::ChainRpc { code, message }
            }
        }
        other => other,
    }
}

/// Currency-indexed set of adapters
#[derive(Clone, Default)]
pub struct ChainRegistry {
    adapters: HashMap<Currency, Arc<dyn ChainAdapter>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the Electrum and monero-wallet-rpc adapters from configuration
    pub fn from_config(config: &AppConfig) -> EscrowResult<Self> {
        let mut registry = Self::new();
        registry.insert(Arc::new(ElectrumAdapter::new(ElectrumConfig::try_from(
            &config.bitcoin,
        )?)?));
        registry.insert(Arc::new(MoneroAdapter::new(MoneroConfig::try_from(
            &config.monero,
        )?)?));
        Ok(registry)
    }

    pub fn insert(&mut self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters.insert(adapter.currency(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ChainAdapter>) -> Self {
        self.insert(adapter);
        self
    }

    pub fn get(&self, currency: Currency) -> EscrowResult<Arc<dyn ChainAdapter>> {
        self.adapters.get(&currency).cloned().ok_or_else(|| {
            EscrowError::chain_unavailable(format!("no chain adapter for {}", currency))
        })
    }

    pub fn currencies(&self) -> Vec<Currency> {
        let mut currencies: Vec<Currency> = self.adapters.keys().copied().collect();
        currencies.sort_by_key(|c| c.code());
        currencies
    }
}
