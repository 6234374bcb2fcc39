//! Money and FX primitives.
//!
//! All financial values are exact decimals. Rounding is banker's rounding
//! (midpoint-to-even) at the scale declared for each field class:
//! shares 4, prices and rates 6, home amounts 2, foreign amounts 4.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AppError, Result};

/// Scale for share quantities.
pub const SHARES_SCALE: u32 = 4;
/// Scale for per-share prices and exchange rates.
pub const RATE_SCALE: u32 = 6;
/// Scale for amounts in the home currency.
pub const HOME_AMOUNT_SCALE: u32 = 2;
/// Scale for amounts in a foreign ledger currency.
pub const FOREIGN_AMOUNT_SCALE: u32 = 4;

/// Round to a declared scale with banker's rounding.
pub fn round_to_scale(value: Decimal, scale: u32) -> Decimal {
    value.round_dp_with_strategy(scale, RoundingStrategy::MidpointNearestEven)
}

pub fn round_shares(value: Decimal) -> Decimal {
    round_to_scale(value, SHARES_SCALE)
}

pub fn round_rate(value: Decimal) -> Decimal {
    round_to_scale(value, RATE_SCALE)
}

pub fn round_home(value: Decimal) -> Decimal {
    round_to_scale(value, HOME_AMOUNT_SCALE)
}

pub fn round_foreign(value: Decimal) -> Decimal {
    round_to_scale(value, FOREIGN_AMOUNT_SCALE)
}

/// Supported currencies. Closed set at the core boundary; string-typed only
/// at the JSON edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Twd,
    Usd,
    Gbp,
    Eur,
}

impl Currency {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "TWD" => Some(Self::Twd),
            "USD" => Some(Self::Usd),
            "GBP" => Some(Self::Gbp),
            "EUR" => Some(Self::Eur),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Twd => "TWD",
            Self::Usd => "USD",
            Self::Gbp => "GBP",
            Self::Eur => "EUR",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An exact amount in a specific currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Money {
    pub amount: Decimal,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self {
            amount: Decimal::ZERO,
            currency,
        }
    }

    pub fn is_negative(&self) -> bool {
        self.amount.is_sign_negative() && !self.amount.is_zero()
    }

    /// Addition requires matching currency.
    pub fn checked_add(&self, other: &Money) -> Result<Money> {
        self.require_same_currency(other)?;
        Ok(Money::new(self.amount + other.amount, self.currency))
    }

    /// Subtraction requires matching currency.
    pub fn checked_sub(&self, other: &Money) -> Result<Money> {
        self.require_same_currency(other)?;
        Ok(Money::new(self.amount - other.amount, self.currency))
    }

    /// Convert into `target` at `rate`. Rates are strictly positive.
    pub fn convert_to(&self, target: Currency, rate: Decimal) -> Result<Money> {
        if rate <= Decimal::ZERO {
            return Err(AppError::BusinessRule(format!(
                "exchange rate must be positive, got {}",
                rate
            )));
        }
        Ok(Money::new(self.amount * rate, target))
    }

    fn require_same_currency(&self, other: &Money) -> Result<()> {
        if self.currency != other.currency {
            return Err(AppError::BusinessRule(format!(
                "currency mismatch: {} vs {}",
                self.currency, other.currency
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}
