//! Decimal ledger
//!
//! [`Amount`] is the only way money enters arithmetic: a `Decimal` tagged
//! with its currency and held to that currency's fixed precision. Mixing
//! currencies is rejected rather than truncated. [`Ledger`] applies
//! single-wallet credits and debits through the store's atomic updates.

use crate::{
    error::EscrowError,
    models::{Currency, Wallet},
    store::LedgerStore,
    EscrowResult,
};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tracing::info;

/// Non-negative amount of a single currency at fixed precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    value: Decimal,
    currency: Currency,
}

impl Amount {
    /// Wrap a decimal, rejecting negatives and sub-unit digits
    pub fn new(value: Decimal, currency: Currency) -> EscrowResult<Self> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(EscrowError::validation(format!(
                "amount cannot be negative: {}",
                value
            )));
        }
        if value.round_dp(currency.precision()) != value {
            return Err(EscrowError::validation(format!(
                "amount {} exceeds {} decimal places for {}",
                value,
                currency.precision(),
                currency
            )));
        }
        Ok(Self {
            value: value.normalize(),
            currency,
        })
    }

    pub fn zero(currency: Currency) -> Self {
        Self {
            value: Decimal::ZERO,
            currency,
        }
    }

    /// Parse user input such as `"0.001"`
    ///
    /// Only plain decimal notation is accepted: no sign, exponent or
    /// separators, and at most the currency's precision after the point.
    pub fn parse(input: &str, currency: Currency) -> EscrowResult<Self> {
        let input = input.trim();
        let (int_part, frac_part) = match input.split_once('.') {
            Some((i, f)) => (i, Some(f)),
            None => (input, None),
        };
        let digits_ok = !int_part.is_empty() && int_part.bytes().all(|b| b.is_ascii_digit());
        let frac_ok = frac_part.map_or(true, |f| {
            !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit())
        });
        if !digits_ok || !frac_ok {
            return Err(EscrowError::validation(format!("invalid amount: {:?}", input)));
        }
        if frac_part.map_or(0, str::len) > currency.precision() as usize {
            return Err(EscrowError::validation(format!(
                "amount must have at most {} decimal places",
                currency.precision()
            )));
        }
        let value: Decimal = input
            .parse()
            .map_err(|e| EscrowError::validation(format!("invalid amount {:?}: {}", input, e)))?;
        Self::new(value, currency)
    }

    /// Build from the smallest chain unit (satoshi / piconero)
    pub fn from_atomic(units: u64, currency: Currency) -> Self {
        Self {
            value: Decimal::from_i128_with_scale(units as i128, currency.precision()).normalize(),
            currency,
        }
    }

    /// Convert to the smallest chain unit
    pub fn to_atomic(&self) -> EscrowResult<u64> {
        let mut scaled = self.value;
        scaled.rescale(self.currency.precision());
        u64::try_from(scaled.mantissa())
            .map_err(|_| EscrowError::validation(format!("amount {} out of range", self)))
    }

    pub fn value(&self) -> Decimal {
        self.value
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    fn ensure_same_currency(&self, other: &Amount) -> EscrowResult<()> {
        if self.currency != other.currency {
            return Err(EscrowError::CurrencyMismatch {
                left: self.currency,
                right: other.currency,
            });
        }
        Ok(())
    }

    pub fn checked_add(&self, other: &Amount) -> EscrowResult<Amount> {
        self.ensure_same_currency(other)?;
        let value = self
            .value
            .checked_add(other.value)
            .ok_or_else(|| EscrowError::internal("decimal overflow"))?;
        Ok(Self {
            value,
            currency: self.currency,
        })
    }

    /// Subtract, failing with `InsufficientFunds` rather than going negative
    pub fn checked_sub(&self, other: &Amount) -> EscrowResult<Amount> {
        self.ensure_same_currency(other)?;
        if other.value > self.value {
            return Err(EscrowError::insufficient_funds(other.value, self.value));
        }
        Ok(Self {
            value: self.value - other.value,
            currency: self.currency,
        })
    }

    /// `percent`% of this amount, rounded down to the currency precision
    pub fn percent(&self, percent: Decimal) -> Amount {
        let raw = self.value * percent / Decimal::ONE_HUNDRED;
        Self {
            value: raw
                .round_dp_with_strategy(self.currency.precision(), RoundingStrategy::ToZero)
                .normalize(),
            currency: self.currency,
        }
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fixed = self.value;
        fixed.rescale(self.currency.precision());
        write!(f, "{}", fixed)
    }
}

/// Format a raw decimal at the currency's fixed precision
pub fn format_fixed(value: Decimal, currency: Currency) -> String {
    let mut fixed = value;
    fixed.rescale(currency.precision());
    fixed.to_string()
}

/// Single-wallet balance mutations
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Increment a wallet's balance
    pub async fn add_balance(&self, wallet: &Wallet, amount: &Amount) -> EscrowResult<Wallet> {
        Self::check_currency(wallet, amount)?;
        let updated = self.store.credit_wallet(wallet.id, amount).await?;
        info!("Credited wallet {} with {} {}", wallet.id, amount, amount.currency());
        Ok(updated)
    }

    /// Decrement a wallet's balance, failing with `InsufficientFunds` if short
    pub async fn sub_balance(&self, wallet: &Wallet, amount: &Amount) -> EscrowResult<Wallet> {
        Self::check_currency(wallet, amount)?;
        let updated = self.store.debit_wallet(wallet.id, amount).await?;
        info!("Debited wallet {} by {} {}", wallet.id, amount, amount.currency());
        Ok(updated)
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
}
