//! Core data models for the escrow system
//!
//! Database rows, state machines and shared value types. Status enums
//! are persisted as lowercase text and parsed back through `FromStr`.

use crate::{error::EscrowError, EscrowResult};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Decimal places carried by BTC amounts (satoshi resolution)
pub const BTC_PRECISION: u32 = 8;
/// Decimal places carried by XMR amounts (piconero resolution)
pub const XMR_PRECISION: u32 = 12;

/// Supported currencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Btc,
    Xmr,
}

impl Currency {
    pub const ALL: [Currency; 2] = [Currency::Btc, Currency::Xmr];

    /// Ticker as stored in the database
    pub fn code(&self) -> &'static str {
        match self {
            Self::Btc => "BTC",
            Self::Xmr => "XMR",
        }
    }

    /// Fixed number of decimal places for this currency
    pub fn precision(&self) -> u32 {
        match self {
            Self::Btc => BTC_PRECISION,
            Self::Xmr => XMR_PRECISION,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BTC" => Ok(Self::Btc),
            "XMR" => Ok(Self::Xmr),
            other => Err(EscrowError::validation(format!(
                "unsupported currency: {}",
                other
            ))),
        }
    }
}

/// Per-(user, currency) wallet with a deposit address and ledger balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: i64,
    pub user_id: i64,
    pub currency: Currency,
    pub address: String,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Escrow state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    /// Funds debited from the client and held
    Pending,
    /// Funds credited to the freelancer
    Released,
    /// Funds returned to the client
    Refunded,
}

impl EscrowStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Refunded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Released => "released",
            Self::Refunded => "refunded",
        }
    }

    /// Validate an escrow transition
    pub fn validate_transition(self, to: EscrowStatus) -> EscrowResult<()> {
        match (self, to) {
            (Self::Pending, Self::Released) | (Self::Pending, Self::Refunded) => Ok(()),
            (from, to) if from.is_terminal() => Err(EscrowError::invalid_state(
                from.as_str(),
                to.as_str(),
                "escrow already settled",
            )),
            (from, to) => Err(EscrowError::invalid_state(
                from.as_str(),
                to.as_str(),
                "transition not allowed",
            )),
        }
    }
}

impl FromStr for EscrowStatus {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "released" => Ok(Self::Released),
            "refunded" => Ok(Self::Refunded),
            other => Err(EscrowError::decode(format!("unknown escrow status: {}", other))),
        }
    }
}

/// Funds held for a task between offer acceptance and completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowBalance {
    pub id: i64,
    pub task_id: i64,
    pub client_id: i64,
    pub freelancer_id: i64,
    pub amount: Decimal,
    pub currency: Currency,
    pub status: EscrowStatus,
    pub created_at: DateTime<Utc>,
}

/// What a ledger audit record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    InternalTransfer,
    Commission,
    EscrowHold,
    EscrowRelease,
    EscrowRefund,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
            Self::InternalTransfer => "internal_transfer",
            Self::Commission => "commission",
            Self::EscrowHold => "escrow_hold",
            Self::EscrowRelease => "escrow_release",
            Self::EscrowRefund => "escrow_refund",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(Self::Deposit),
            "withdrawal" => Ok(Self::Withdrawal),
            "internal_transfer" => Ok(Self::InternalTransfer),
            "commission" => Ok(Self::Commission),
            "escrow_hold" => Ok(Self::EscrowHold),
            "escrow_release" => Ok(Self::EscrowRelease),
            "escrow_refund" => Ok(Self::EscrowRefund),
            other => Err(EscrowError::decode(format!(
                "unknown transaction kind: {}",
                other
            ))),
        }
    }
}

/// Append-only audit record of a balance-affecting event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub kind: TransactionKind,
    pub from_wallet_id: Option<i64>,
    pub to_wallet_id: Option<i64>,
    pub to_address: Option<String>,
    pub task_id: Option<i64>,
    pub amount: Decimal,
    pub currency: Currency,
    pub confirmed: bool,
    pub created_at: DateTime<Utc>,
}

/// Audit record before it is assigned an id
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub kind: TransactionKind,
    pub from_wallet_id: Option<i64>,
    pub to_wallet_id: Option<i64>,
    pub to_address: Option<String>,
    pub task_id: Option<i64>,
    pub amount: Decimal,
    pub currency: Currency,
    pub confirmed: bool,
}

/// Dedup marker for an ingested on-chain transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub txid: String,
    pub wallet_id: Option<i64>,
    pub amount: Decimal,
    pub currency: Currency,
    pub confirmed: bool,
    pub created_at: DateTime<Utc>,
}

/// Task lifecycle as seen by the escrow ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Disputed,
    Completed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Check if this state allows accepting an offer
    pub fn can_accept_offer(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Check if this state allows client confirmation
    pub fn can_complete(&self) -> bool {
        matches!(self, Self::InProgress)
    }

    /// Check if this state allows opening a dispute
    pub fn can_dispute(&self) -> bool {
        matches!(self, Self::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Disputed => "disputed",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "disputed" => Ok(Self::Disputed),
            "completed" => Ok(Self::Completed),
            other => Err(EscrowError::decode(format!("unknown task status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub client_id: i64,
    pub title: String,
    pub currency: Currency,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Rejected,
}

impl OfferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for OfferStatus {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            other => Err(EscrowError::decode(format!("unknown offer status: {}", other))),
        }
    }
}

/// A freelancer's priced offer on a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOffer {
    pub id: i64,
    pub task_id: i64,
    pub freelancer_id: i64,
    pub price: Decimal,
    pub status: OfferStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    Resolved,
}

impl DisputeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
        }
    }
}

impl FromStr for DisputeStatus {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "resolved" => Ok(Self::Resolved),
            other => Err(EscrowError::decode(format!(
                "unknown dispute status: {}",
                other
            ))),
        }
    }
}

/// Dispute outcome chosen by the assigned admin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeResolution {
    /// Escrow refunded to the client
    ClientWon,
    /// Escrow released to the freelancer
    FreelancerWon,
}

impl DisputeResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientWon => "client_won",
            Self::FreelancerWon => "freelancer_won",
        }
    }

    /// Escrow state this resolution settles into
    pub fn escrow_outcome(&self) -> EscrowStatus {
        match self {
            Self::ClientWon => EscrowStatus::Refunded,
            Self::FreelancerWon => EscrowStatus::Released,
        }
    }
}

impl FromStr for DisputeResolution {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client_won" => Ok(Self::ClientWon),
            "freelancer_won" => Ok(Self::FreelancerWon),
            other => Err(EscrowError::validation(format!(
                "invalid resolution: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: i64,
    pub task_id: i64,
    pub opened_by: i64,
    pub assigned_admin: Option<i64>,
    pub status: DisputeStatus,
    pub resolution: Option<DisputeResolution>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Identity of the acting user, supplied by the auth layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserClaims {
    pub user_id: i64,
    pub is_admin: bool,
}

impl UserClaims {
    pub fn user(user_id: i64) -> Self {
        Self {
            user_id,
            is_admin: false,
        }
    }

    pub fn admin(user_id: i64) -> Self {
        Self {
            user_id,
            is_admin: true,
        }
    }
}

/// Every wallet and escrow operation requires an authenticated caller
pub fn require_claims(claims: Option<&UserClaims>) -> EscrowResult<&UserClaims> {
    claims.ok_or_else(|| EscrowError::unauthorized("user not found"))
}

/// One destination of a batched payout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutOutput {
    pub address: String,
    pub amount: Decimal,
}

/// Sum of balances and held escrow for one currency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub currency: Currency,
    pub wallet_balances: Decimal,
    pub escrow_held: Decimal,
}

impl LedgerTotals {
    pub fn total(&self) -> Decimal {
        self.wallet_balances + self.escrow_held
    }
}
