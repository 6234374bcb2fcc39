//! Position calculator.
//!
//! Folds the adjusted transaction log into per-`{ticker, market}` holdings
//! with a moving-weighted-average cost basis in both home and source
//! currency. The same ticker on two exchanges is two positions.

use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;

use crate::error::Result;
use crate::models::{StockMarket, StockSplit, StockTransaction, StockTransactionType};
use crate::money::{round_home, Currency};
use crate::splits;
use crate::transactions;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionKey {
    pub ticker: String,
    pub market: StockMarket,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub ticker: String,
    pub market: StockMarket,
    pub currency: Currency,
    pub total_shares: Decimal,
    pub total_cost_home: Decimal,
    pub total_cost_source: Decimal,
    pub realized_pnl_home: Decimal,
    pub realized_pnl_source: Decimal,
}

impl Position {
    fn new(ticker: String, market: StockMarket, currency: Currency) -> Self {
        Self {
            ticker,
            market,
            currency,
            total_shares: Decimal::ZERO,
            total_cost_home: Decimal::ZERO,
            total_cost_source: Decimal::ZERO,
            realized_pnl_home: Decimal::ZERO,
            realized_pnl_source: Decimal::ZERO,
        }
    }

    /// Weighted-average cost per share in home currency; undefined at zero.
    pub fn average_cost_home(&self) -> Option<Decimal> {
        if self.total_shares.is_zero() {
            None
        } else {
            Some(self.total_cost_home / self.total_shares)
        }
    }

    pub fn average_cost_source(&self) -> Option<Decimal> {
        if self.total_shares.is_zero() {
            None
        } else {
            Some(self.total_cost_source / self.total_shares)
        }
    }

    pub fn is_open(&self) -> bool {
        self.total_shares > Decimal::ZERO
    }
}

/// Fold transactions (already ordered by the log) through the split table.
///
/// Sells fix their cost at the prevailing weighted average: total cost
/// drops by `sharesSold * WAC`, never by realized proceeds.
pub fn recalculate(
    transactions: &[StockTransaction],
    split_table: &[StockSplit],
) -> HashMap<PositionKey, Position> {
    let mut positions: HashMap<PositionKey, Position> = HashMap::new();

    let mut ordered: Vec<&StockTransaction> =
        transactions.iter().filter(|t| !t.is_deleted).collect();
    ordered.sort_by(|a, b| {
        (a.date, a.created_at, a.id).cmp(&(b.date, b.created_at, b.id))
    });

    for txn in ordered {
        let key = PositionKey {
            ticker: txn.ticker.clone(),
            market: txn.market,
        };
        let position = positions
            .entry(key)
            .or_insert_with(|| Position::new(txn.ticker.clone(), txn.market, txn.currency));

        let shares = splits::adjusted_shares(
            txn.shares,
            txn.date,
            &txn.ticker,
            txn.market,
            split_table,
        );

        match txn.txn_type {
            // An Adjustment is a Buy-shaped share correction, usually at
            // zero price.
            StockTransactionType::Buy | StockTransactionType::Adjustment => {
                position.total_shares += shares;
                position.total_cost_source += txn.total_cost_source();
                position.total_cost_home += txn.total_cost_home();
            }
            StockTransactionType::Sell => {
                if position.total_shares > Decimal::ZERO {
                    let wac_home = position.total_cost_home / position.total_shares;
                    let wac_source = position.total_cost_source / position.total_shares;
                    let sold = shares.min(position.total_shares);

                    let reduction_home = round_home(sold * wac_home);
                    let reduction_source = round_home(sold * wac_source);
                    position.total_cost_home -= reduction_home;
                    position.total_cost_source -= reduction_source;
                    position.realized_pnl_home += txn.proceeds_home() - reduction_home;
                    position.realized_pnl_source += txn.proceeds_source() - reduction_source;
                }
                position.total_shares -= shares;
            }
            // The global split table drives share adjustment; a Split row
            // in the log is a no-op for holdings.
            StockTransactionType::Split => {}
        }
    }

    positions
}

/// Current positions of a portfolio, read from the log.
pub fn positions_for_portfolio(
    conn: &Connection,
    portfolio_id: i64,
) -> Result<HashMap<PositionKey, Position>> {
    let txns = transactions::get_by_portfolio(conn, portfolio_id, false)?;
    let split_table = relevant_splits(conn, &txns)?;
    Ok(recalculate(&txns, &split_table))
}

/// Open holdings only, sorted for display.
pub fn holdings_for_portfolio(conn: &Connection, portfolio_id: i64) -> Result<Vec<Position>> {
    let mut holdings: Vec<Position> = positions_for_portfolio(conn, portfolio_id)?
        .into_values()
        .filter(Position::is_open)
        .collect();
    holdings.sort_by(|a, b| (a.market.as_str(), &a.ticker).cmp(&(b.market.as_str(), &b.ticker)));
    Ok(holdings)
}

/// A holding priced for display: current market value and unrealized
/// P&L in source and home currency.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldingView {
    pub ticker: String,
    pub market: StockMarket,
    pub currency: Currency,
    pub total_shares: Decimal,
    pub average_cost_source: Option<Decimal>,
    pub average_cost_home: Option<Decimal>,
    pub price: Option<Decimal>,
    pub price_date: Option<chrono::NaiveDate>,
    pub market_value_source: Option<Decimal>,
    pub market_value_home: Option<Decimal>,
    pub unrealized_pnl_source: Option<Decimal>,
    pub unrealized_pnl_home: Option<Decimal>,
    pub realized_pnl_home: Decimal,
}

/// Open holdings priced at `date` from the market-data cache. A missing
/// quote leaves the value fields empty rather than failing the report.
pub fn holdings_valued(
    conn: &Connection,
    market: &dyn crate::marketdata::MarketData,
    user_id: i64,
    portfolio_id: i64,
    date: chrono::NaiveDate,
) -> Result<Vec<HoldingView>> {
    let portfolio = crate::portfolios::get_portfolio_owned(conn, portfolio_id, user_id)?;
    let mut views = Vec::new();

    for position in holdings_for_portfolio(conn, portfolio_id)? {
        let point = market.price_on(&position.ticker, position.market, date)?;

        let (price, price_date, value_source, value_home) = match point {
            Some(point) => {
                // Valuation converts at the quote's actual trading day.
                let to_home = market
                    .fx_rate_on(position.currency, portfolio.home_currency, point.actual_date)?
                    .map(|p| p.rate);
                let gross = position.total_shares * point.price;
                (
                    Some(point.price),
                    Some(point.actual_date),
                    Some(crate::money::round_home(gross)),
                    to_home.map(|rate| crate::money::round_home(gross * rate)),
                )
            }
            None => (None, None, None, None),
        };

        views.push(HoldingView {
            average_cost_source: position.average_cost_source(),
            average_cost_home: position.average_cost_home(),
            unrealized_pnl_source: value_source.map(|v| v - position.total_cost_source),
            unrealized_pnl_home: value_home.map(|v| v - position.total_cost_home),
            ticker: position.ticker,
            market: position.market,
            currency: position.currency,
            total_shares: position.total_shares,
            price,
            price_date,
            market_value_source: value_source,
            market_value_home: value_home,
            realized_pnl_home: position.realized_pnl_home,
        });
    }

    Ok(views)
}

/// Only the split rows that can affect the given transactions.
fn relevant_splits(
    conn: &Connection,
    txns: &[StockTransaction],
) -> Result<Vec<StockSplit>> {
    let mut seen: Vec<(String, StockMarket)> = Vec::new();
    for txn in txns {
        let entry = (txn.ticker.clone(), txn.market);
        if !seen.contains(&entry) {
            seen.push(entry);
        }
    }

    let mut result = Vec::new();
    for (ticker, market) in seen {
        result.extend(splits_for_key(conn, &ticker, market)?);
    }
    Ok(result)
}

fn splits_for_key(
    conn: &Connection,
    ticker: &str,
    market: StockMarket,
) -> Result<Vec<StockSplit>> {
    let mut stmt = conn.prepare(
        r#"SELECT id, symbol, market, split_date, ratio, description
           FROM stock_split WHERE symbol = ?1 AND market = ?2"#,
    )?;
    let rows = stmt
        .query_map(params![ticker, market.as_str()], |row| {
            Ok(StockSplit {
                id: row.get(0)?,
                symbol: row.get(1)?,
                market: crate::db::enum_col(row, 2, StockMarket::parse)?,
                split_date: row.get(3)?,
                ratio: crate::db::dec_col(row, 4)?,
                description: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
