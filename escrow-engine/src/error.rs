//! Error types for the escrow system
//!
//! A single error enum covers ledger arithmetic, escrow transitions, chain
//! RPC, and the durable payout log. Every variant maps to a stable
//! machine-readable kind so callers at the request boundary can surface
//! rejections without matching on message text.

use crate::models::Currency;
use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Debit requested exceeds the available balance
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
    },

    /// Escrow, task or dispute transition attempted from the wrong state
    #[error("Invalid state transition: {from_state} -> {to_state}: {reason}")]
    InvalidState {
        from_state: String,
        to_state: String,
        reason: String,
    },

    /// Arithmetic attempted between amounts of different currencies
    #[error("Currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: Currency, right: Currency },

    /// Chain client could not be reached or timed out
    #[error("Chain client unavailable: {0}")]
    ChainClientUnavailable(String),

    /// Chain client answered with an RPC-level error
    #[error("Chain RPC error {code}: {message}")]
    ChainRpc { code: i64, message: String },

    /// Payout may or may not have reached the network; `txid` is known when
    /// the transaction was built locally before broadcast
    #[error("Broadcast outcome unknown for txid {}: {message}", .txid.as_deref().unwrap_or("(not known)"))]
    BroadcastUnknown {
        txid: Option<String>,
        message: String,
    },

    /// Raw transaction or RPC payload could not be decoded
    #[error("Decode failure: {0}")]
    Decode(String),

    /// Durable pending-payment write failed
    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// No acting user on the request
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Request failed input validation
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Withdrawals are temporarily blocked")]
    WithdrawalsBlocked,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Create an insufficient-funds error
    pub fn insufficient_funds(required: Decimal, available: Decimal) -> Self {
        Self::InsufficientFunds {
            required,
            available,
        }
    }

    /// Create a state transition error
    pub fn invalid_state<S: Into<String>>(from_state: S, to_state: S, reason: S) -> Self {
        Self::InvalidState {
            from_state: from_state.into(),
            to_state: to_state.into(),
            reason: reason.into(),
        }
    }

    /// Create a chain-unavailable error
    pub fn chain_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::ChainClientUnavailable(msg.into())
    }

    /// Create an in-doubt broadcast error
    pub fn broadcast_unknown<S: Into<String>>(txid: Option<String>, message: S) -> Self {
        Self::BroadcastUnknown {
            txid,
            message: message.into(),
        }
    }

    /// Create a decode error
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a persistence error
    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn forbidden<S: Into<String>>(msg: S) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Machine-readable kind for the request boundary
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::InvalidState { .. } => "invalid_state",
            Self::CurrencyMismatch { .. } => "currency_mismatch",
            Self::ChainClientUnavailable(_) => "chain_client_unavailable",
            Self::ChainRpc { .. } => "chain_rpc_error",
            Self::BroadcastUnknown { .. } => "broadcast_unknown",
            Self::Decode(_) => "decode_failure",
            Self::Persistence(_) | Self::Io(_) => "persistence_failure",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Validation(_) => "validation",
            Self::WithdrawalsBlocked => "withdrawals_blocked",
            Self::Config(_) => "config",
            Self::Database(_) | Self::Migration(_) => "database",
            Self::Serialization(_) => "serialization",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ChainClientUnavailable(_) | Self::Database(_) | Self::Io(_)
        )
    }
}

impl From<config::ConfigError> for EscrowError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<reqwest::Error> for EscrowError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::ChainClientUnavailable(err.to_string())
        }
    }
}
