//! Custodial escrow and wallet-settlement engine for a BTC/XMR task marketplace
//!
//! This crate keeps per-user wallet balances and settles them on chain:
//! - Decimal ledger with guarded debits backed by PostgreSQL
//! - Ingestion of confirmed deposits through Electrum and monero-wallet-rpc
//! - Escrow holds for accepted offers, released or refunded atomically
//! - Batched payouts through a durable pending-payment log

pub mod chain;
pub mod config;
pub mod error;
pub mod escrow_ledger;
pub mod ingestion;
pub mod ledger;
pub mod models;
pub mod node;
pub mod payout_pool;
pub mod pending_log;
pub mod settlement;
pub mod store;
pub mod wallet_store;
pub mod withdrawal;

use error::EscrowError;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
