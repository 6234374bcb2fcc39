//! Performance calculation.
//!
//! Three complementary measures over the same year window:
//!
//! ```text
//! XIRR:  find r with Σ cf_i / (1 + r)^((d_i - d_0)/365) = 0
//!        Newton-Raphson from 0.1, bisection fallback, tolerance 1e-7.
//!
//! Modified Dietz:  (E - S - C) / (S + Σ C_i · (T - t_i) / T)
//!
//! TWR:   Π (valueAfter / valueBefore) - 1 over the period's snapshots;
//!        same-day chain normalization upstream guarantees one factor
//!        per day.
//! ```
//!
//! Monetary inputs stay exact decimals; only the rate root-finding runs
//! in floating point, since a return is a ratio rather than money.

use chrono::{Datelike, NaiveDate, Utc};
use rusqlite::Connection;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;
use crate::ledger;
use crate::marketdata::{self, MarketData, YearEndLookup};
use crate::models::{
    Portfolio, PriceType, StockTransaction, StockTransactionType, TransactionSnapshot,
};
use crate::money::round_home;
use crate::portfolios;
use crate::positions;
use crate::snapshots;
use crate::splits;
use crate::transactions;

const XIRR_TOLERANCE: f64 = 1e-7;
const XIRR_MAX_ITERATIONS: usize = 100;
const XIRR_INITIAL_GUESS: f64 = 0.1;

// =============================================================================
// Rate solvers
// =============================================================================

/// Money-weighted return over irregular cash flows. Returns `None` unless
/// the series has at least one inflow and one outflow.
pub fn xirr(cash_flows: &[(Decimal, NaiveDate)]) -> Option<f64> {
    if cash_flows.is_empty() {
        return None;
    }
    let any_positive = cash_flows.iter().any(|(a, _)| *a > Decimal::ZERO);
    let any_negative = cash_flows.iter().any(|(a, _)| *a < Decimal::ZERO);
    if !any_positive || !any_negative {
        return None;
    }

    let first_date = cash_flows.iter().map(|(_, d)| *d).min()?;
    let series: Vec<(f64, f64)> = cash_flows
        .iter()
        .map(|(amount, date)| {
            let years = (*date - first_date).num_days() as f64 / 365.0;
            (amount.to_f64().unwrap_or(0.0), years)
        })
        .collect();

    newton(&series).or_else(|| bisect(&series))
}

fn npv_and_derivative(series: &[(f64, f64)], rate: f64) -> (f64, f64) {
    let mut npv = 0.0;
    let mut dnpv = 0.0;
    for (cf, years) in series {
        let discount = (1.0 + rate).powf(*years);
        if discount == 0.0 || !discount.is_finite() {
            continue;
        }
        npv += cf / discount;
        dnpv -= years * cf / (discount * (1.0 + rate));
    }
    (npv, dnpv)
}

fn newton(series: &[(f64, f64)]) -> Option<f64> {
    let mut rate = XIRR_INITIAL_GUESS;

    for _ in 0..XIRR_MAX_ITERATIONS {
        let (npv, dnpv) = npv_and_derivative(series, rate);
        if dnpv.abs() < f64::EPSILON {
            return None;
        }
        let next = rate - npv / dnpv;
        if !next.is_finite() || next <= -1.0 {
            return None;
        }
        if (next - rate).abs() < XIRR_TOLERANCE {
            return Some(next);
        }
        rate = next;
    }

    None
}

fn bisect(series: &[(f64, f64)]) -> Option<f64> {
    let mut low = -0.9999;
    let mut high = 10.0;
    let (mut npv_low, _) = npv_and_derivative(series, low);
    let (npv_high, _) = npv_and_derivative(series, high);

    if npv_low * npv_high > 0.0 {
        return None;
    }

    for _ in 0..XIRR_MAX_ITERATIONS {
        let mid = (low + high) / 2.0;
        let (npv_mid, _) = npv_and_derivative(series, mid);
        if npv_mid.abs() < XIRR_TOLERANCE || (high - low) / 2.0 < XIRR_TOLERANCE {
            return Some(mid);
        }
        if npv_low * npv_mid < 0.0 {
            high = mid;
        } else {
            low = mid;
            npv_low = npv_mid;
        }
    }

    Some((low + high) / 2.0)
}

/// Contribution-weighted approximation of the period return, as a
/// fraction. `flows` are external cash flows at their in-period dates.
pub fn modified_dietz(
    start_value: Decimal,
    end_value: Decimal,
    flows: &[(Decimal, NaiveDate)],
    period_start: NaiveDate,
    period_end: NaiveDate,
) -> Option<f64> {
    let period_days = (period_end - period_start).num_days();
    if period_days <= 0 {
        return None;
    }

    let total_flows: Decimal = flows.iter().map(|(a, _)| *a).sum();
    let mut weighted = Decimal::ZERO;
    for (amount, date) in flows {
        let elapsed = (*date - period_start).num_days().clamp(0, period_days);
        let weight = Decimal::from(period_days - elapsed) / Decimal::from(period_days);
        weighted += *amount * weight;
    }

    let denominator = start_value + weighted;
    if denominator <= Decimal::ZERO {
        return None;
    }

    let numerator = end_value - start_value - total_flows;
    (numerator / denominator).to_f64()
}

/// Geometric return over chain-normalized snapshots, as a fraction.
/// Sub-periods with a nonpositive starting value contribute no factor.
pub fn twr_from_snapshots(snapshots: &[TransactionSnapshot], home: bool) -> f64 {
    let mut product = 1.0;
    for snapshot in snapshots {
        let (before, after) = if home {
            (snapshot.value_before_home, snapshot.value_after_home)
        } else {
            (snapshot.value_before_source, snapshot.value_after_source)
        };
        if before <= Decimal::ZERO {
            continue;
        }
        let factor = (after / before).to_f64().unwrap_or(1.0);
        product *= factor;
    }
    product - 1.0
}

/// `(E - S - C) / S`, or `(E - C) / C` for a portfolio that started empty.
/// Returned as a percentage.
pub fn simple_total_return(
    start_value: Decimal,
    end_value: Decimal,
    contributions: Decimal,
) -> Option<f64> {
    let ratio = if start_value > Decimal::ZERO {
        (end_value - start_value - contributions) / start_value
    } else if contributions > Decimal::ZERO {
        (end_value - contributions) / contributions
    } else {
        return None;
    };
    ratio.to_f64().map(|r| r * 100.0)
}

// =============================================================================
// Per-year performance
// =============================================================================

/// Caller-supplied boundary price for one ticker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualPrice {
    pub price: Decimal,
    pub exchange_rate: Decimal,
    pub date: NaiveDate,
}

/// `ticker → boundary price` map supplied by the user.
pub type ManualPriceMap = HashMap<String, ManualPrice>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingPrice {
    pub ticker: String,
    pub date: NaiveDate,
    pub price_type: PriceType,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearPerformance {
    pub portfolio_id: i64,
    pub year: i32,
    pub start_value_home: Decimal,
    pub start_value_source: Decimal,
    pub end_value_home: Decimal,
    pub end_value_source: Decimal,
    pub net_contributions_home: Decimal,
    pub net_contributions_source: Decimal,
    pub xirr_home: Option<f64>,
    pub xirr_source: Option<f64>,
    pub simple_return_home: Option<f64>,
    pub simple_return_source: Option<f64>,
    pub modified_dietz_home: Option<f64>,
    pub modified_dietz_source: Option<f64>,
    /// Percentages.
    pub twr_home: f64,
    pub twr_source: f64,
}

/// Either a full result or the list of prices the caller must supply.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum YearPerformanceOutcome {
    Complete(Box<YearPerformance>),
    Partial { missing_prices: Vec<MissingPrice> },
}

/// Year window: January 1st through December 31st, or today for the
/// current year.
fn year_window(year: i32) -> (NaiveDate, NaiveDate) {
    let start = NaiveDate::from_ymd_opt(year, 1, 1).expect("valid year start");
    let today = Utc::now().date_naive();
    let end = if year == today.year() {
        today
    } else {
        NaiveDate::from_ymd_opt(year, 12, 31).expect("valid year end")
    };
    (start, end)
}

/// Boundary price resolution: the user map wins, then the year-end cache.
fn resolve_boundary_price(
    conn: &Connection,
    manual: &ManualPriceMap,
    ticker: &str,
    market_code: crate::models::StockMarket,
    cache_year: i32,
) -> Result<Option<(Decimal, Option<Decimal>)>> {
    if let Some(manual_price) = manual.get(ticker) {
        return Ok(Some((manual_price.price, Some(manual_price.exchange_rate))));
    }
    let key = marketdata::market_key(ticker, market_code);
    match marketdata::cached_year_end_price(conn, &key, &marketdata::december_key(cache_year))? {
        YearEndLookup::Price(price) => Ok(Some((price, None))),
        _ => Ok(None),
    }
}

/// Portfolio value at a year boundary from explicit boundary prices.
/// Returns the missing tickers instead of a value when resolution fails.
#[allow(clippy::too_many_arguments)]
fn boundary_value(
    conn: &Connection,
    market: &dyn MarketData,
    portfolio: &Portfolio,
    stock_txns: &[StockTransaction],
    splits_table: &[crate::models::StockSplit],
    manual: &ManualPriceMap,
    boundary_date: NaiveDate,
    // Ledger truncation, aligned with the stock-transaction filter: the
    // day before the year for the opening value, the year end otherwise.
    ledger_as_of: NaiveDate,
    cache_year: i32,
    price_type: PriceType,
) -> Result<std::result::Result<(Decimal, Decimal), Vec<MissingPrice>>> {
    let position_map = positions::recalculate(stock_txns, splits_table);
    let mut missing: Vec<MissingPrice> = Vec::new();
    let mut value_home = Decimal::ZERO;
    let mut value_source = Decimal::ZERO;

    for position in position_map.values().filter(|p| p.is_open()) {
        let resolved =
            resolve_boundary_price(conn, manual, &position.ticker, position.market, cache_year)?;
        let Some((price, manual_rate)) = resolved else {
            missing.push(MissingPrice {
                ticker: position.ticker.clone(),
                date: boundary_date,
                price_type,
            });
            continue;
        };

        let to_home = match manual_rate.or(market
            .fx_rate_on(position.currency, portfolio.home_currency, boundary_date)?
            .map(|p| p.rate))
        {
            Some(rate) => rate,
            None => {
                missing.push(MissingPrice {
                    ticker: position.ticker.clone(),
                    date: boundary_date,
                    price_type,
                });
                continue;
            }
        };
        let to_source = market
            .fx_rate_on(position.currency, portfolio.base_currency, boundary_date)?
            .map(|p| p.rate)
            .unwrap_or(Decimal::ONE);

        value_home += position.total_shares * price * to_home;
        value_source += position.total_shares * price * to_source;
    }

    if !missing.is_empty() {
        return Ok(Err(missing));
    }

    // Bound-ledger cash, signed, at the boundary.
    if let Some(ledger_id) = portfolio.bound_ledger_id {
        let bound = ledger::get_ledger(conn, ledger_id)?;
        let projection = ledger::project(&ledger::entries(conn, ledger_id, Some(ledger_as_of))?);
        let balance = projection.balance;
        let layer_rate = {
            let total: Decimal = projection.layers.iter().map(|l| l.remaining).sum();
            if total.is_zero() {
                Decimal::ONE
            } else {
                projection
                    .layers
                    .iter()
                    .map(|l| l.remaining * l.exchange_rate)
                    .sum::<Decimal>()
                    / total
            }
        };
        let to_home = market
            .fx_rate_on(bound.currency, portfolio.home_currency, boundary_date)?
            .map(|p| p.rate)
            .unwrap_or(layer_rate);
        let to_source = market
            .fx_rate_on(bound.currency, portfolio.base_currency, boundary_date)?
            .map(|p| p.rate)
            .unwrap_or(Decimal::ONE);
        value_home += balance * to_home;
        value_source += balance * to_source;
    }

    Ok(Ok((round_home(value_home), round_home(value_source))))
}

/// External cash flows of the portfolio's bound ledger inside a window,
/// signed, as `(home, source, date)` triples.
fn external_flows(
    conn: &Connection,
    portfolio: &Portfolio,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<(Decimal, Decimal, NaiveDate)>> {
    let Some(ledger_id) = portfolio.bound_ledger_id else {
        return Ok(Vec::new());
    };

    let mut flows = Vec::new();
    for entry in ledger::entries(conn, ledger_id, None)? {
        if !entry.txn_type.is_external_cash_flow() || entry.date < start || entry.date > end {
            continue;
        }
        let sign = if entry.txn_type.is_credit() {
            Decimal::ONE
        } else {
            -Decimal::ONE
        };
        let source = entry.foreign_amount * sign;
        let home = entry
            .home_amount
            .or(entry.exchange_rate.map(|r| entry.foreign_amount * r))
            .unwrap_or(entry.foreign_amount)
            * sign;
        flows.push((round_home(home), source, entry.date));
    }
    Ok(flows)
}

/// One portfolio's performance over a calendar year.
pub fn year_performance(
    conn: &Connection,
    market: &dyn MarketData,
    user_id: i64,
    portfolio_id: i64,
    year: i32,
    year_start_prices: &ManualPriceMap,
    year_end_prices: &ManualPriceMap,
) -> Result<YearPerformanceOutcome> {
    let portfolio = portfolios::get_portfolio_owned(conn, portfolio_id, user_id)?;
    let (year_start, year_end) = year_window(year);

    snapshots::ensure_coverage(conn, market, portfolio_id, year_start, year_end)?;

    let all_txns = transactions::get_by_portfolio(conn, portfolio_id, false)?;
    let splits_table = splits::all_splits(conn)?;

    // Starting state excludes everything dated inside the year.
    let opening: Vec<StockTransaction> = all_txns
        .iter()
        .filter(|t| t.date < year_start)
        .cloned()
        .collect();
    let closing: Vec<StockTransaction> = all_txns
        .iter()
        .filter(|t| t.date <= year_end)
        .cloned()
        .collect();

    let start = boundary_value(
        conn,
        market,
        &portfolio,
        &opening,
        &splits_table,
        year_start_prices,
        year_start,
        year_start - chrono::Duration::days(1),
        year - 1,
        PriceType::YearStart,
    )?;
    let end = boundary_value(
        conn,
        market,
        &portfolio,
        &closing,
        &splits_table,
        year_end_prices,
        year_end,
        year_end,
        year,
        PriceType::YearEnd,
    )?;

    let (start_values, end_values) = match (start, end) {
        (Ok(s), Ok(e)) => (s, e),
        (start, end) => {
            let mut missing = Vec::new();
            if let Err(m) = start {
                missing.extend(m);
            }
            if let Err(m) = end {
                missing.extend(m);
            }
            return Ok(YearPerformanceOutcome::Partial {
                missing_prices: missing,
            });
        }
    };

    let (start_home, start_source) = start_values;
    let (end_home, end_source) = end_values;

    let flows = external_flows(conn, &portfolio, year_start, year_end)?;
    let contributions_home: Decimal = flows.iter().map(|(h, _, _)| *h).sum();
    let contributions_source: Decimal = flows.iter().map(|(_, s, _)| *s).sum();

    // XIRR series: opening value out, buys out, sells in, closing value in.
    let mut flows_home: Vec<(Decimal, NaiveDate)> = Vec::new();
    let mut flows_source: Vec<(Decimal, NaiveDate)> = Vec::new();
    if start_home > Decimal::ZERO {
        flows_home.push((-start_home, year_start));
    }
    if start_source > Decimal::ZERO {
        flows_source.push((-start_source, year_start));
    }
    for txn in all_txns
        .iter()
        .filter(|t| t.date >= year_start && t.date <= year_end)
    {
        match txn.txn_type {
            StockTransactionType::Buy => {
                flows_home.push((-txn.total_cost_home(), txn.date));
                flows_source.push((-txn.total_cost_source(), txn.date));
            }
            StockTransactionType::Sell => {
                flows_home.push((txn.proceeds_home(), txn.date));
                flows_source.push((txn.proceeds_source(), txn.date));
            }
            _ => {}
        }
    }
    if end_home > Decimal::ZERO {
        flows_home.push((end_home, year_end));
    }
    if end_source > Decimal::ZERO {
        flows_source.push((end_source, year_end));
    }

    let dietz_flows_home: Vec<(Decimal, NaiveDate)> =
        flows.iter().map(|(h, _, d)| (*h, *d)).collect();
    let dietz_flows_source: Vec<(Decimal, NaiveDate)> =
        flows.iter().map(|(_, s, d)| (*s, *d)).collect();

    let period_snapshots = snapshots::snapshots_in_period(conn, portfolio_id, year_start, year_end)?;

    Ok(YearPerformanceOutcome::Complete(Box::new(YearPerformance {
        portfolio_id,
        year,
        start_value_home: start_home,
        start_value_source: start_source,
        end_value_home: end_home,
        end_value_source: end_source,
        net_contributions_home: contributions_home,
        net_contributions_source: contributions_source,
        xirr_home: xirr(&flows_home),
        xirr_source: xirr(&flows_source),
        simple_return_home: simple_total_return(start_home, end_home, contributions_home),
        simple_return_source: simple_total_return(start_source, end_source, contributions_source),
        modified_dietz_home: modified_dietz(
            start_home,
            end_home,
            &dietz_flows_home,
            year_start,
            year_end,
        ),
        modified_dietz_source: modified_dietz(
            start_source,
            end_source,
            &dietz_flows_source,
            year_start,
            year_end,
        ),
        twr_home: twr_from_snapshots(&period_snapshots, true) * 100.0,
        twr_source: twr_from_snapshots(&period_snapshots, false) * 100.0,
    })))
}

// =============================================================================
// Aggregation across portfolios
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatePerformance {
    pub year: i32,
    pub start_value_home: Decimal,
    pub start_value_source: Decimal,
    pub end_value_home: Decimal,
    pub end_value_source: Decimal,
    pub net_contributions_home: Decimal,
    pub net_contributions_source: Decimal,
    pub xirr_home: Option<f64>,
    pub xirr_source: Option<f64>,
    pub modified_dietz_home: Option<f64>,
    pub modified_dietz_source: Option<f64>,
    /// Weighted by each portfolio's starting value, percentages.
    pub twr_home: f64,
    pub twr_source: f64,
    pub portfolios: Vec<YearPerformance>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum AggregateOutcome {
    Complete(Box<AggregatePerformance>),
    Partial { missing_prices: Vec<MissingPrice> },
}

/// Earliest non-deleted activity date of a portfolio, if any.
fn earliest_activity(conn: &Connection, portfolio: &Portfolio) -> Result<Option<NaiveDate>> {
    let mut earliest: Option<NaiveDate> = None;
    for txn in transactions::get_by_portfolio(conn, portfolio.id, false)? {
        earliest = Some(earliest.map_or(txn.date, |e| e.min(txn.date)));
    }
    if let Some(ledger_id) = portfolio.bound_ledger_id {
        for entry in ledger::entries(conn, ledger_id, None)? {
            earliest = Some(earliest.map_or(entry.date, |e| e.min(entry.date)));
        }
    }
    Ok(earliest)
}

/// Combine every portfolio of the user into one year view.
pub fn aggregate_year_performance(
    conn: &Connection,
    market: &dyn MarketData,
    user_id: i64,
    year: i32,
    year_start_prices: &ManualPriceMap,
    year_end_prices: &ManualPriceMap,
) -> Result<AggregateOutcome> {
    let (year_start, year_end) = year_window(year);
    let mut per_portfolio: Vec<YearPerformance> = Vec::new();
    let mut missing: Vec<MissingPrice> = Vec::new();
    let mut earliest_dates: HashMap<i64, Option<NaiveDate>> = HashMap::new();

    for portfolio in portfolios::list_portfolios(conn, user_id)? {
        let outcome = year_performance(
            conn,
            market,
            user_id,
            portfolio.id,
            year,
            year_start_prices,
            year_end_prices,
        )?;
        match outcome {
            YearPerformanceOutcome::Complete(performance) => {
                earliest_dates.insert(
                    portfolio.id,
                    earliest_activity(conn, &portfolio)?
                        .filter(|d| *d >= year_start && *d <= year_end),
                );
                per_portfolio.push(*performance);
            }
            YearPerformanceOutcome::Partial { missing_prices } => {
                missing.extend(missing_prices);
            }
        }
    }

    if !missing.is_empty() {
        missing.dedup();
        return Ok(AggregateOutcome::Partial {
            missing_prices: missing,
        });
    }

    let sum = |f: fn(&YearPerformance) -> Decimal| -> Decimal {
        per_portfolio.iter().map(f).sum()
    };
    let start_home = sum(|p| p.start_value_home);
    let start_source = sum(|p| p.start_value_source);
    let end_home = sum(|p| p.end_value_home);
    let end_source = sum(|p| p.end_value_source);
    let contributions_home = sum(|p| p.net_contributions_home);
    let contributions_source = sum(|p| p.net_contributions_source);

    // Aggregate XIRR over a compressed per-portfolio series: opening value
    // out at year start, the net contribution out at the first in-year
    // activity, closing value in at year end.
    let mut agg_flows_home: Vec<(Decimal, NaiveDate)> = Vec::new();
    let mut agg_flows_source: Vec<(Decimal, NaiveDate)> = Vec::new();
    let mut dietz_flows_home: Vec<(Decimal, NaiveDate)> = Vec::new();
    let mut dietz_flows_source: Vec<(Decimal, NaiveDate)> = Vec::new();

    for performance in &per_portfolio {
        let flow_date = earliest_dates
            .get(&performance.portfolio_id)
            .copied()
            .flatten()
            .unwrap_or(year_start + chrono::Duration::days(1));

        if performance.start_value_home > Decimal::ZERO {
            agg_flows_home.push((-performance.start_value_home, year_start));
        }
        if performance.start_value_source > Decimal::ZERO {
            agg_flows_source.push((-performance.start_value_source, year_start));
        }
        if !performance.net_contributions_home.is_zero() {
            agg_flows_home.push((-performance.net_contributions_home, flow_date));
            dietz_flows_home.push((performance.net_contributions_home, flow_date));
        }
        if !performance.net_contributions_source.is_zero() {
            agg_flows_source.push((-performance.net_contributions_source, flow_date));
            dietz_flows_source.push((performance.net_contributions_source, flow_date));
        }
        if performance.end_value_home > Decimal::ZERO {
            agg_flows_home.push((performance.end_value_home, year_end));
        }
        if performance.end_value_source > Decimal::ZERO {
            agg_flows_source.push((performance.end_value_source, year_end));
        }
    }

    // TWR weighting: starting value, falling back to ending value when the
    // year opened empty.
    let weighted_twr = |home: bool| -> f64 {
        let mut weight_sum = Decimal::ZERO;
        let mut acc = 0.0;
        for performance in &per_portfolio {
            let (start, end, twr) = if home {
                (
                    performance.start_value_home,
                    performance.end_value_home,
                    performance.twr_home,
                )
            } else {
                (
                    performance.start_value_source,
                    performance.end_value_source,
                    performance.twr_source,
                )
            };
            let weight = if start > Decimal::ZERO { start } else { end };
            if weight <= Decimal::ZERO {
                continue;
            }
            weight_sum += weight;
            acc += twr * weight.to_f64().unwrap_or(0.0);
        }
        if weight_sum.is_zero() {
            0.0
        } else {
            acc / weight_sum.to_f64().unwrap_or(1.0)
        }
    };

    Ok(AggregateOutcome::Complete(Box::new(AggregatePerformance {
        year,
        start_value_home: start_home,
        start_value_source: start_source,
        end_value_home: end_home,
        end_value_source: end_source,
        net_contributions_home: contributions_home,
        net_contributions_source: contributions_source,
        xirr_home: xirr(&agg_flows_home),
        xirr_source: xirr(&agg_flows_source),
        modified_dietz_home: modified_dietz(
            start_home,
            end_home,
            &dietz_flows_home,
            year_start,
            year_end,
        ),
        modified_dietz_source: modified_dietz(
            start_source,
            end_source,
            &dietz_flows_source,
            year_start,
            year_end,
        ),
        twr_home: weighted_twr(true),
        twr_source: weighted_twr(false),
        portfolios: per_portfolio,
    })))
}

/// Union of each portfolio's earliest activity year through the current
/// year, newest first.
pub fn available_years(conn: &Connection, user_id: i64) -> Result<Vec<i32>> {
    let current = Utc::now().date_naive().year();
    let mut earliest: Option<i32> = None;

    for portfolio in portfolios::list_portfolios(conn, user_id)? {
        if let Some(date) = earliest_activity(conn, &portfolio)? {
            let year = date.year();
            earliest = Some(earliest.map_or(year, |e| e.min(year)));
        }
    }

    let Some(first) = earliest else {
        return Ok(vec![current]);
    };
    Ok((first..=current).rev().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SnapshotEventKind;
    use crate::testutil::date;
    use rust_decimal_macros::dec;

    #[test]
    fn test_xirr_one_year_ten_percent() {
        // 365 days apart: exactly one compounding year.
        let flows = vec![
            (dec!(-1000), date(2023, 1, 1)),
            (dec!(1100), date(2024, 1, 1)),
        ];
        let rate = xirr(&flows).unwrap();
        assert!((rate - 0.10).abs() < 1e-6, "got {}", rate);
    }

    #[test]
    fn test_xirr_intra_year() {
        let flows = vec![
            (dec!(-1000), date(2023, 1, 1)),
            (dec!(1100), date(2023, 12, 31)),
        ];
        let rate = xirr(&flows).unwrap();
        // Slightly above 10% because the holding period is 364 days.
        assert!(rate > 0.10 && rate < 0.102, "got {}", rate);
    }

    #[test]
    fn test_xirr_requires_both_signs() {
        assert!(xirr(&[(dec!(100), date(2023, 1, 1)), (dec!(50), date(2023, 6, 1))]).is_none());
        assert!(xirr(&[(dec!(-100), date(2023, 1, 1)), (dec!(-50), date(2023, 6, 1))]).is_none());
        assert!(xirr(&[]).is_none());
    }

    #[test]
    fn test_xirr_negative_return() {
        let flows = vec![
            (dec!(-1000), date(2023, 1, 1)),
            (dec!(800), date(2024, 1, 1)),
        ];
        let rate = xirr(&flows).unwrap();
        assert!((rate - (-0.20)).abs() < 1e-6, "got {}", rate);
    }

    #[test]
    fn test_modified_dietz_no_flows() {
        let rate = modified_dietz(dec!(1000), dec!(1100), &[], date(2023, 1, 1), date(2023, 12, 31))
            .unwrap();
        assert!((rate - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_modified_dietz_midyear_flow() {
        // Contribution of 500 halfway through weights by ~0.5.
        let rate = modified_dietz(
            dec!(1000),
            dec!(1650),
            &[(dec!(500), date(2023, 7, 2))],
            date(2023, 1, 1),
            date(2023, 12, 31),
        )
        .unwrap();
        // numerator 150, denominator ≈ 1000 + 500*0.5 = 1250.
        assert!((rate - 0.12).abs() < 0.002, "got {}", rate);
    }

    fn snapshot(
        before: Decimal,
        after: Decimal,
        day: NaiveDate,
    ) -> TransactionSnapshot {
        TransactionSnapshot {
            id: 0,
            portfolio_id: 1,
            event_kind: SnapshotEventKind::Stock,
            event_id: 0,
            snapshot_date: day,
            value_before_home: before,
            value_after_home: after,
            value_before_source: before,
            value_after_source: after,
            created_at: day.and_hms_opt(0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_twr_product_of_factors() {
        let snaps = vec![
            snapshot(dec!(1000), dec!(1100), date(2023, 3, 1)),
            snapshot(dec!(1100), dec!(990), date(2023, 6, 1)),
        ];
        let twr = twr_from_snapshots(&snaps, true);
        // 1.1 * 0.9 - 1 = -0.01.
        assert!((twr - (-0.01)).abs() < 1e-9, "got {}", twr);
    }

    #[test]
    fn test_twr_skips_nonpositive_before() {
        let snaps = vec![
            snapshot(dec!(0), dec!(1000), date(2023, 3, 1)),
            snapshot(dec!(1000), dec!(1200), date(2023, 6, 1)),
        ];
        let twr = twr_from_snapshots(&snaps, true);
        assert!((twr - 0.2).abs() < 1e-9, "got {}", twr);
    }

    #[test]
    fn test_twr_chain_normalized_day_counts_once() {
        // Two same-day snapshots already normalized upstream: the second
        // contributes a factor of exactly 1.
        let snaps = vec![
            snapshot(dec!(1000), dec!(2000), date(2023, 3, 1)),
            snapshot(dec!(2000), dec!(2000), date(2023, 3, 1)),
        ];
        let twr = twr_from_snapshots(&snaps, true);
        assert!((twr - 1.0).abs() < 1e-9, "got {}", twr);
    }

    #[test]
    fn test_simple_return_branches() {
        assert_eq!(
            simple_total_return(dec!(1000), dec!(1100), dec!(0)),
            Some(10.0)
        );
        // Started empty: measured against contributions.
        assert_eq!(
            simple_total_return(dec!(0), dec!(1100), dec!(1000)),
            Some(10.0)
        );
        assert_eq!(simple_total_return(dec!(0), dec!(1100), dec!(0)), None);
    }

    mod integration {
        use super::super::*;
        use crate::models::{BalanceAction, FundSource, StockMarket, StockTransactionType};
        use crate::money::Currency;
        use crate::testutil::{bound_usd_portfolio, date, test_db, FakeMarketData};
        use crate::transactions::NewStockTransaction;
        use rust_decimal_macros::dec;

        fn manual(ticker: &str, price: Decimal, rate: Decimal, d: NaiveDate) -> ManualPriceMap {
            let mut map = ManualPriceMap::new();
            map.insert(
                ticker.to_string(),
                ManualPrice {
                    price,
                    exchange_rate: rate,
                    date: d,
                },
            );
            map
        }

        fn buy_on(
            conn: &mut rusqlite::Connection,
            market: &FakeMarketData,
            portfolio_id: i64,
            d: NaiveDate,
            shares: Decimal,
            price: Decimal,
        ) {
            transactions::create_stock_transaction(
                conn,
                market,
                1,
                &NewStockTransaction {
                    portfolio_id,
                    date: d,
                    ticker: "AAPL".into(),
                    market: StockMarket::Us,
                    txn_type: StockTransactionType::Buy,
                    shares,
                    price_per_share: price,
                    fees: Decimal::ZERO,
                    currency: Currency::Usd,
                    fund_source: FundSource::None,
                    balance_action: BalanceAction::None,
                    top_up_type: None,
                },
            )
            .unwrap();
        }

        #[test]
        fn test_year_performance_simple_appreciation() {
            let mut conn = test_db();
            let (portfolio_id, _) = bound_usd_portfolio(&conn);
            let mut market = FakeMarketData::with_fx(Currency::Usd, Currency::Twd, dec!(30));
            market.set_price("AAPL", dec!(100));

            // Bought in 2023, held through 2024.
            buy_on(&mut conn, &market, portfolio_id, date(2023, 6, 1), dec!(10), dec!(100));

            let start_prices = manual("AAPL", dec!(100), dec!(30), date(2024, 1, 1));
            let end_prices = manual("AAPL", dec!(120), dec!(30), date(2024, 12, 31));

            let outcome = year_performance(
                &conn,
                &market,
                1,
                portfolio_id,
                2024,
                &start_prices,
                &end_prices,
            )
            .unwrap();

            let YearPerformanceOutcome::Complete(performance) = outcome else {
                panic!("expected complete result");
            };

            assert_eq!(performance.start_value_source, dec!(1000.00));
            assert_eq!(performance.end_value_source, dec!(1200.00));
            assert_eq!(performance.start_value_home, dec!(30000.00));
            assert_eq!(performance.end_value_home, dec!(36000.00));
            assert_eq!(performance.net_contributions_home, dec!(0));

            // 20% appreciation, no flows.
            assert!((performance.simple_return_source.unwrap() - 20.0).abs() < 1e-9);
            let dietz = performance.modified_dietz_source.unwrap();
            assert!((dietz - 0.2).abs() < 1e-9, "got {}", dietz);
            let rate = performance.xirr_source.unwrap();
            assert!(rate > 0.19 && rate < 0.21, "got {}", rate);
        }

        #[test]
        fn test_missing_price_returns_partial() {
            let mut conn = test_db();
            let (portfolio_id, _) = bound_usd_portfolio(&conn);
            let mut market = FakeMarketData::with_fx(Currency::Usd, Currency::Twd, dec!(30));
            market.set_price("AAPL", dec!(100));

            buy_on(&mut conn, &market, portfolio_id, date(2023, 6, 1), dec!(10), dec!(100));

            let outcome = year_performance(
                &conn,
                &market,
                1,
                portfolio_id,
                2024,
                &ManualPriceMap::new(),
                &ManualPriceMap::new(),
            )
            .unwrap();

            let YearPerformanceOutcome::Partial { missing_prices } = outcome else {
                panic!("expected partial result");
            };
            assert!(missing_prices
                .iter()
                .any(|m| m.ticker == "AAPL" && m.price_type == PriceType::YearStart));
            assert!(missing_prices
                .iter()
                .any(|m| m.ticker == "AAPL" && m.price_type == PriceType::YearEnd));
        }

        #[test]
        fn test_aggregate_matches_single_portfolio_xirr() {
            let mut conn = test_db();
            let (portfolio_id, _) = bound_usd_portfolio(&conn);
            let mut market = FakeMarketData::with_fx(Currency::Usd, Currency::Twd, dec!(30));
            market.set_price("AAPL", dec!(100));

            buy_on(&mut conn, &market, portfolio_id, date(2023, 6, 1), dec!(10), dec!(100));

            let start_prices = manual("AAPL", dec!(100), dec!(30), date(2024, 1, 1));
            let end_prices = manual("AAPL", dec!(120), dec!(30), date(2024, 12, 31));

            let single = year_performance(
                &conn, &market, 1, portfolio_id, 2024, &start_prices, &end_prices,
            )
            .unwrap();
            let aggregate = aggregate_year_performance(
                &conn, &market, 1, 2024, &start_prices, &end_prices,
            )
            .unwrap();

            let YearPerformanceOutcome::Complete(single) = single else {
                panic!("expected complete result");
            };
            let AggregateOutcome::Complete(aggregate) = aggregate else {
                panic!("expected complete result");
            };

            // With one portfolio and no in-year flows, the aggregate XIRR
            // series collapses to the portfolio's own.
            let lhs = aggregate.xirr_home.unwrap();
            let rhs = single.xirr_home.unwrap();
            assert!((lhs - rhs).abs() < 1e-6, "{} vs {}", lhs, rhs);
            assert_eq!(aggregate.start_value_home, single.start_value_home);
            assert_eq!(aggregate.end_value_home, single.end_value_home);
        }

        #[test]
        fn test_available_years_spans_earliest_activity() {
            let mut conn = test_db();
            let (portfolio_a, _) = bound_usd_portfolio(&conn);
            let portfolio_b = crate::portfolios::create_portfolio(
                &conn,
                &crate::portfolios::NewPortfolio {
                    user_id: 1,
                    name: "older".into(),
                    base_currency: Currency::Usd,
                    home_currency: Currency::Twd,
                    bound_ledger_id: None,
                },
            )
            .unwrap();

            let market = FakeMarketData::with_fx(Currency::Usd, Currency::Twd, dec!(30));
            buy_on(&mut conn, &market, portfolio_a, date(2021, 3, 15), dec!(1), dec!(100));
            buy_on(&mut conn, &market, portfolio_b.id, date(2019, 11, 2), dec!(1), dec!(100));

            let years = available_years(&conn, 1).unwrap();
            let current = Utc::now().date_naive().year();

            assert_eq!(years.first().copied(), Some(current));
            assert_eq!(years.last().copied(), Some(2019));
            // Contiguous and descending.
            for window in years.windows(2) {
                assert_eq!(window[0] - window[1], 1);
            }
        }
    }
}
