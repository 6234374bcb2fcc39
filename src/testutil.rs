//! Shared fixtures for engine tests.

use chrono::NaiveDate;
use rusqlite::Connection;
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::db;
use crate::error::Result;
use crate::ledger::{self, NewLedger};
use crate::marketdata::{FxPoint, MarketData, PricePoint};
use crate::models::StockMarket;
use crate::money::Currency;
use crate::portfolios::{self, NewPortfolio};

/// Deterministic in-memory market data. Prices are keyed by ticker and
/// apply to any date; FX by currency pair.
#[derive(Default)]
pub struct FakeMarketData {
    pub prices: HashMap<String, Decimal>,
    pub fx: HashMap<(Currency, Currency), Decimal>,
}

impl FakeMarketData {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_fx(from: Currency, to: Currency, rate: Decimal) -> Self {
        let mut fake = Self::empty();
        fake.fx.insert((from, to), rate);
        fake
    }

    pub fn set_price(&mut self, ticker: &str, price: Decimal) {
        self.prices.insert(ticker.to_string(), price);
    }

    pub fn set_fx(&mut self, from: Currency, to: Currency, rate: Decimal) {
        self.fx.insert((from, to), rate);
    }
}

impl MarketData for FakeMarketData {
    fn price_on(
        &self,
        ticker: &str,
        market: StockMarket,
        date: NaiveDate,
    ) -> Result<Option<PricePoint>> {
        Ok(self.prices.get(ticker).map(|p| PricePoint {
            price: *p,
            currency: market.currency(),
            actual_date: date,
        }))
    }

    fn fx_rate_on(&self, from: Currency, to: Currency, date: NaiveDate) -> Result<Option<FxPoint>> {
        if from == to {
            return Ok(Some(FxPoint {
                rate: Decimal::ONE,
                actual_date: date,
            }));
        }
        Ok(self.fx.get(&(from, to)).map(|r| FxPoint {
            rate: *r,
            actual_date: date,
        }))
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Fresh database with one user (id 1).
pub fn test_db() -> Connection {
    let conn = db::init_in_memory().unwrap();
    conn.execute(
        "INSERT INTO user (name, home_currency, created_at) VALUES ('amy', 'TWD', ?1)",
        [db::now()],
    )
    .unwrap();
    conn
}

/// USD ledger plus a portfolio bound to it, both owned by user 1.
/// Returns `(portfolio_id, ledger_id)`.
pub fn bound_usd_portfolio(conn: &Connection) -> (i64, i64) {
    let ledger = ledger::create_ledger(
        conn,
        &NewLedger {
            user_id: 1,
            currency: Currency::Usd,
            home_currency: Currency::Twd,
            name: "usd ledger".into(),
        },
    )
    .unwrap();

    let portfolio = portfolios::create_portfolio(
        conn,
        &NewPortfolio {
            user_id: 1,
            name: "us stocks".into(),
            base_currency: Currency::Usd,
            home_currency: Currency::Twd,
            bound_ledger_id: Some(ledger.id),
        },
    )
    .unwrap();

    (portfolio.id, ledger.id)
}
