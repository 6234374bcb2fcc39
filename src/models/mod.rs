//! Domain entities and closed enumerations.
//!
//! Transaction kinds, markets and fund sources are closed finite sets:
//! enums here, strings only at the JSON edge.

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::money::{round_home, round_to_scale, Currency, HOME_AMOUNT_SCALE};

// =============================================================================
// Enumerations
// =============================================================================

/// Exchange a stock trades on. Quote fetching is strictly scoped to the
/// position's market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StockMarket {
    Tw,
    Us,
    Uk,
    Eu,
}

impl StockMarket {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "TW" => Some(Self::Tw),
            "US" => Some(Self::Us),
            "UK" => Some(Self::Uk),
            "EU" => Some(Self::Eu),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tw => "TW",
            Self::Us => "US",
            Self::Uk => "UK",
            Self::Eu => "EU",
        }
    }

    /// Denomination currency of instruments on this market.
    pub fn currency(&self) -> Currency {
        match self {
            Self::Tw => Currency::Twd,
            Self::Us => Currency::Usd,
            Self::Uk => Currency::Gbp,
            Self::Eu => Currency::Eur,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockTransactionType {
    Buy,
    Sell,
    Split,
    Adjustment,
}

impl StockTransactionType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Buy" => Some(Self::Buy),
            "Sell" => Some(Self::Sell),
            "Split" => Some(Self::Split),
            "Adjustment" => Some(Self::Adjustment),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "Buy",
            Self::Sell => "Sell",
            Self::Split => "Split",
            Self::Adjustment => "Adjustment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CurrencyTransactionType {
    /// Foreign in, home out; establishes a new LIFO cost layer.
    ExchangeBuy,
    /// Foreign out, home in; consumes LIFO layers for realized P&L.
    ExchangeSell,
    /// Foreign out, bound to a stock Buy.
    Spend,
    Interest,
    InitialBalance,
    OtherIncome,
    Deposit,
    Withdraw,
    OtherExpense,
}

impl CurrencyTransactionType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ExchangeBuy" => Some(Self::ExchangeBuy),
            "ExchangeSell" => Some(Self::ExchangeSell),
            "Spend" => Some(Self::Spend),
            "Interest" => Some(Self::Interest),
            "InitialBalance" => Some(Self::InitialBalance),
            "OtherIncome" => Some(Self::OtherIncome),
            "Deposit" => Some(Self::Deposit),
            "Withdraw" => Some(Self::Withdraw),
            "OtherExpense" => Some(Self::OtherExpense),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExchangeBuy => "ExchangeBuy",
            Self::ExchangeSell => "ExchangeSell",
            Self::Spend => "Spend",
            Self::Interest => "Interest",
            Self::InitialBalance => "InitialBalance",
            Self::OtherIncome => "OtherIncome",
            Self::Deposit => "Deposit",
            Self::Withdraw => "Withdraw",
            Self::OtherExpense => "OtherExpense",
        }
    }

    /// Whether the foreign amount flows into the ledger.
    pub fn is_credit(&self) -> bool {
        matches!(
            self,
            Self::ExchangeBuy
                | Self::Interest
                | Self::InitialBalance
                | Self::OtherIncome
                | Self::Deposit
        )
    }

    /// Income types accepted as a top-up when covering a Buy shortfall.
    pub fn is_income(&self) -> bool {
        self.is_credit()
    }

    /// The only events counted as contributions for Modified Dietz / TWR.
    pub fn is_external_cash_flow(&self) -> bool {
        matches!(self, Self::InitialBalance | Self::Deposit | Self::Withdraw)
    }

    /// Types that must carry `home_amount` and `exchange_rate`.
    pub fn requires_home_amount(&self) -> bool {
        matches!(
            self,
            Self::ExchangeBuy | Self::ExchangeSell | Self::InitialBalance
        )
    }

    /// Types a foreign-currency ledger accepts.
    pub fn allowed_on_foreign_ledger(&self) -> bool {
        matches!(
            self,
            Self::ExchangeBuy
                | Self::ExchangeSell
                | Self::Spend
                | Self::Interest
                | Self::InitialBalance
                | Self::OtherIncome
                | Self::OtherExpense
        )
    }

    /// Types a home-currency ledger accepts.
    pub fn allowed_on_home_ledger(&self) -> bool {
        matches!(
            self,
            Self::Deposit
                | Self::Withdraw
                | Self::Interest
                | Self::Spend
                | Self::OtherIncome
                | Self::OtherExpense
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FundSource {
    None,
    CurrencyLedger,
}

impl FundSource {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "None" => Some(Self::None),
            "CurrencyLedger" => Some(Self::CurrencyLedger),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::CurrencyLedger => "CurrencyLedger",
        }
    }
}

/// What to do when a ledger-funded Buy exceeds the ledger balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceAction {
    /// Reject on shortfall.
    None,
    /// Proceed into a negative balance.
    Margin,
    /// Insert a covering credit first, then the Spend.
    TopUp,
}

impl BalanceAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "None" => Some(Self::None),
            "Margin" => Some(Self::Margin),
            "TopUp" => Some(Self::TopUp),
            _ => None,
        }
    }
}

/// Which boundary price a performance calculation is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceType {
    YearStart,
    YearEnd,
}

/// Discriminator for snapshot event references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SnapshotEventKind {
    Stock,
    Currency,
}

impl SnapshotEventKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stock" => Some(Self::Stock),
            "currency" => Some(Self::Currency),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stock => "stock",
            Self::Currency => "currency",
        }
    }
}

// =============================================================================
// Entities
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub name: String,
    pub home_currency: Currency,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Portfolio {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub base_currency: Currency,
    pub home_currency: Currency,
    /// At most one ledger may be bound. A stock transaction in this
    /// portfolio whose currency matches the bound ledger's currency must
    /// consume from that ledger.
    pub bound_ledger_id: Option<i64>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockTransaction {
    pub id: i64,
    pub uuid: String,
    pub portfolio_id: i64,
    pub date: NaiveDate,
    pub ticker: String,
    pub market: StockMarket,
    pub txn_type: StockTransactionType,
    pub shares: Decimal,
    pub price_per_share: Decimal,
    pub exchange_rate: Decimal,
    pub fees: Decimal,
    pub currency: Currency,
    pub fund_source: FundSource,
    pub currency_ledger_id: Option<i64>,
    pub is_deleted: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl StockTransaction {
    /// Total cost in the instrument's denomination currency.
    ///
    /// Taiwan listed tickers start with a digit and settle whole-dollar
    /// costs: the share-price product is floored before fees are added.
    pub fn total_cost_source(&self) -> Decimal {
        let gross = self.shares * self.price_per_share;
        if ticker_is_taiwan_numeric(&self.ticker) {
            gross.floor() + self.fees
        } else {
            round_to_scale(gross, HOME_AMOUNT_SCALE) + self.fees
        }
    }

    /// Total cost converted to the home currency at the stored rate.
    pub fn total_cost_home(&self) -> Decimal {
        round_home(self.total_cost_source() * self.exchange_rate)
    }

    /// Sale proceeds in source currency (gross less fees).
    pub fn proceeds_source(&self) -> Decimal {
        round_to_scale(self.shares * self.price_per_share, HOME_AMOUNT_SCALE) - self.fees
    }

    pub fn proceeds_home(&self) -> Decimal {
        round_home(self.proceeds_source() * self.exchange_rate)
    }
}

/// Taiwan listed tickers are numeric ("2330", "0050").
pub fn ticker_is_taiwan_numeric(ticker: &str) -> bool {
    ticker.chars().next().is_some_and(|c| c.is_ascii_digit())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrencyLedger {
    pub id: i64,
    pub user_id: i64,
    pub currency: Currency,
    pub home_currency: Currency,
    pub name: String,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl CurrencyLedger {
    /// A ledger whose currency equals its home currency always pins
    /// exchange rate 1.
    pub fn is_home_ledger(&self) -> bool {
        self.currency == self.home_currency
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrencyTransaction {
    pub id: i64,
    pub uuid: String,
    pub ledger_id: i64,
    pub date: NaiveDate,
    pub txn_type: CurrencyTransactionType,
    pub foreign_amount: Decimal,
    pub home_amount: Option<Decimal>,
    pub exchange_rate: Option<Decimal>,
    pub related_stock_transaction_id: Option<i64>,
    pub is_deleted: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Globally shared split event; adjusts historical share counts of every
/// transaction dated before `split_date`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockSplit {
    pub id: i64,
    pub symbol: String,
    pub market: StockMarket,
    pub split_date: NaiveDate,
    pub ratio: Decimal,
    pub description: Option<String>,
}

/// Persisted before/after portfolio value at the instant of one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSnapshot {
    pub id: i64,
    pub portfolio_id: i64,
    pub event_kind: SnapshotEventKind,
    pub event_id: i64,
    pub snapshot_date: NaiveDate,
    pub value_before_home: Decimal,
    pub value_after_home: Decimal,
    pub value_before_source: Decimal,
    pub value_after_source: Decimal,
    pub created_at: NaiveDateTime,
}
