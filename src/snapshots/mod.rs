//! Per-transaction portfolio snapshots.
//!
//! Every event that shifts a portfolio's value records the value
//! immediately before and immediately after it, in home and source
//! currency. The whole day is re-derived whenever any event on it
//! changes, then chain-normalized so exactly one TWR factor survives per
//! day no matter how many intraday events occurred.

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;

use crate::db;
use crate::error::Result;
use crate::ledger;
use crate::marketdata::MarketData;
use crate::models::{
    Portfolio, SnapshotEventKind, StockTransactionType, TransactionSnapshot,
};
use crate::money::round_home;
use crate::portfolios;
use crate::positions;
use crate::transactions;

/// A value-shifting event: a stock Buy/Sell/Adjustment, or an external
/// cash flow on the bound ledger.
#[derive(Debug, Clone)]
pub struct EventRef {
    pub kind: SnapshotEventKind,
    pub id: i64,
    pub date: NaiveDate,
    pub created_at: NaiveDateTime,
}

impl EventRef {
    fn key(&self) -> (NaiveDate, NaiveDateTime, i64) {
        (self.date, self.created_at, self.id)
    }
}

/// Cutoff for time-travel valuation, exclusive or inclusive of one event.
type Cutoff = (NaiveDate, NaiveDateTime, i64);

// =============================================================================
// Valuation
// =============================================================================

/// Closed-loop portfolio value at `price_date`:
/// `Σ(shares · price · fx) + ledgerBalance`, in `(home, source)` currency.
///
/// `cutoff` limits the folded log to events strictly before the given key;
/// `None` folds everything. The ledger term is signed and never floored.
///
/// When the market has no price for a position, its weighted-average cost
/// stands in so a transaction write never fails on a data gap; the FX
/// fallback is the cost-implied rate.
pub fn portfolio_value(
    conn: &Connection,
    market: &dyn MarketData,
    portfolio: &Portfolio,
    cutoff: Option<Cutoff>,
    price_date: NaiveDate,
) -> Result<(Decimal, Decimal)> {
    let mut stock_txns = transactions::get_by_portfolio(conn, portfolio.id, false)?;
    if let Some(cutoff) = cutoff {
        stock_txns.retain(|t| (t.date, t.created_at, t.id) < cutoff);
    }

    let split_table = crate::splits::all_splits(conn)?;
    let position_map = positions::recalculate(&stock_txns, &split_table);

    let mut value_home = Decimal::ZERO;
    let mut value_source = Decimal::ZERO;

    for position in position_map.values().filter(|p| p.is_open()) {
        let point = market.price_on(&position.ticker, position.market, price_date)?;

        let (price, fx_date) = match &point {
            Some(p) => (p.price, p.actual_date),
            None => {
                let fallback = position
                    .average_cost_source()
                    .unwrap_or(Decimal::ZERO);
                (fallback, price_date)
            }
        };

        let cost_implied_rate = if position.total_cost_source.is_zero() {
            Decimal::ONE
        } else {
            position.total_cost_home / position.total_cost_source
        };

        let to_home = market
            .fx_rate_on(position.currency, portfolio.home_currency, fx_date)?
            .map(|p| p.rate)
            .unwrap_or(cost_implied_rate);
        let to_source = market
            .fx_rate_on(position.currency, portfolio.base_currency, fx_date)?
            .map(|p| p.rate)
            .unwrap_or(Decimal::ONE);

        value_home += position.total_shares * price * to_home;
        value_source += position.total_shares * price * to_source;
    }

    if let Some(ledger_id) = portfolio.bound_ledger_id {
        let bound = ledger::get_ledger(conn, ledger_id)?;
        let mut entries = ledger::entries(conn, ledger_id, None)?;
        if let Some(cutoff) = cutoff {
            entries.retain(|t| (t.date, t.created_at, t.id) < cutoff);
        }
        let projection = ledger::project(&entries);

        // Cost-basis rate of the remaining layers backs up a missing quote.
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
            .fx_rate_on(bound.currency, portfolio.home_currency, price_date)?
            .map(|p| p.rate)
            .unwrap_or(layer_rate);
        let to_source = market
            .fx_rate_on(bound.currency, portfolio.base_currency, price_date)?
            .map(|p| p.rate)
            .unwrap_or(Decimal::ONE);

        value_home += projection.balance * to_home;
        value_source += projection.balance * to_source;
    }

    Ok((round_home(value_home), round_home(value_source)))
}

// =============================================================================
// Day rebuild and chain normalization
// =============================================================================

/// Value-shifting events of one portfolio on one date, in fold order.
fn day_events(conn: &Connection, portfolio: &Portfolio, date: NaiveDate) -> Result<Vec<EventRef>> {
    let mut events: Vec<EventRef> = Vec::new();

    for txn in transactions::get_by_portfolio(conn, portfolio.id, false)? {
        if txn.date == date
            && matches!(
                txn.txn_type,
                StockTransactionType::Buy
                    | StockTransactionType::Sell
                    | StockTransactionType::Adjustment
            )
        {
            events.push(EventRef {
                kind: SnapshotEventKind::Stock,
                id: txn.id,
                date: txn.date,
                created_at: txn.created_at,
            });
        }
    }

    if let Some(ledger_id) = portfolio.bound_ledger_id {
        for entry in ledger::entries(conn, ledger_id, None)? {
            if entry.date == date && entry.txn_type.is_external_cash_flow() {
                events.push(EventRef {
                    kind: SnapshotEventKind::Currency,
                    id: entry.id,
                    date: entry.date,
                    created_at: entry.created_at,
                });
            }
        }
    }

    events.sort_by_key(|e| e.key());
    Ok(events)
}

/// Re-derive every snapshot of `(portfolio, date)` from the current log
/// and apply same-day chain normalization. Runs inside the caller's
/// transaction so the snapshots commit atomically with the trigger.
pub fn rebuild_day(
    conn: &Connection,
    market: &dyn MarketData,
    portfolio_id: i64,
    date: NaiveDate,
) -> Result<()> {
    let portfolio = portfolios::get_portfolio(conn, portfolio_id)?;
    let events = day_events(conn, &portfolio, date)?;

    conn.execute(
        "DELETE FROM transaction_snapshot WHERE portfolio_id = ?1 AND snapshot_date = ?2",
        params![portfolio_id, date],
    )?;
    if events.is_empty() {
        return Ok(());
    }

    // Raw before values for the day start; the day end is the value after
    // the final event.
    let (day_start_home, day_start_source) =
        portfolio_value(conn, market, &portfolio, Some(events[0].key()), date)?;
    let last = events.last().expect("non-empty day");
    let after_last = (last.date, last.created_at, last.id + 1);
    let (day_end_home, day_end_source) =
        portfolio_value(conn, market, &portfolio, Some(after_last), date)?;

    // Chain normalization: the day's return factor lives entirely on the
    // chronologically first snapshot; the rest flatten to the day end.
    for (index, event) in events.iter().enumerate() {
        let (vbh, vah, vbs, vas) = if index == 0 {
            (day_start_home, day_end_home, day_start_source, day_end_source)
        } else {
            (day_end_home, day_end_home, day_end_source, day_end_source)
        };

        conn.execute(
            r#"INSERT INTO transaction_snapshot
                   (portfolio_id, event_kind, event_id, snapshot_date,
                    value_before_home, value_after_home, value_before_source, value_after_source,
                    created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
               ON CONFLICT (event_kind, event_id) DO UPDATE SET
                   snapshot_date = excluded.snapshot_date,
                   value_before_home = excluded.value_before_home,
                   value_after_home = excluded.value_after_home,
                   value_before_source = excluded.value_before_source,
                   value_after_source = excluded.value_after_source"#,
            params![
                portfolio_id,
                event.kind.as_str(),
                event.id,
                date,
                vbh.to_string(),
                vah.to_string(),
                vbs.to_string(),
                vas.to_string(),
                event.created_at,
            ],
        )?;
    }

    Ok(())
}

/// Drop the snapshot belonging to a deleted stock transaction.
pub(crate) fn remove_snapshot_for_stock_event(conn: &Connection, stock_id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM transaction_snapshot WHERE event_kind = 'stock' AND event_id = ?1",
        [stock_id],
    )?;
    Ok(())
}

// =============================================================================
// Queries
// =============================================================================

fn map_snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransactionSnapshot> {
    Ok(TransactionSnapshot {
        id: row.get(0)?,
        portfolio_id: row.get(1)?,
        event_kind: db::enum_col(row, 2, SnapshotEventKind::parse)?,
        event_id: row.get(3)?,
        snapshot_date: row.get(4)?,
        value_before_home: db::dec_col(row, 5)?,
        value_after_home: db::dec_col(row, 6)?,
        value_before_source: db::dec_col(row, 7)?,
        value_after_source: db::dec_col(row, 8)?,
        created_at: row.get(9)?,
    })
}

/// Snapshots of a portfolio between two dates inclusive, in chain order.
pub fn snapshots_in_period(
    conn: &Connection,
    portfolio_id: i64,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<TransactionSnapshot>> {
    let mut stmt = conn.prepare(
        r#"SELECT id, portfolio_id, event_kind, event_id, snapshot_date,
                  value_before_home, value_after_home, value_before_source, value_after_source,
                  created_at
           FROM transaction_snapshot
           WHERE portfolio_id = ?1 AND snapshot_date >= ?2 AND snapshot_date <= ?3
           ORDER BY snapshot_date, created_at, id"#,
    )?;
    let rows = stmt
        .query_map(params![portfolio_id, start, end], map_snapshot_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Rebuild any day in the period whose snapshots are missing or stale in
/// count. Used by the performance calculator before reading a year.
pub fn ensure_coverage(
    conn: &Connection,
    market: &dyn MarketData,
    portfolio_id: i64,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<()> {
    let portfolio = portfolios::get_portfolio(conn, portfolio_id)?;

    let mut dates: Vec<NaiveDate> = Vec::new();
    for txn in transactions::get_by_portfolio(conn, portfolio_id, false)? {
        if txn.date >= start && txn.date <= end && !dates.contains(&txn.date) {
            dates.push(txn.date);
        }
    }
    if let Some(ledger_id) = portfolio.bound_ledger_id {
        for entry in ledger::entries(conn, ledger_id, None)? {
            if entry.txn_type.is_external_cash_flow()
                && entry.date >= start
                && entry.date <= end
                && !dates.contains(&entry.date)
            {
                dates.push(entry.date);
            }
        }
    }

    for date in dates {
        let expected = day_events(conn, &portfolio, date)?.len() as i64;
        let present: i64 = conn.query_row(
            "SELECT COUNT(*) FROM transaction_snapshot WHERE portfolio_id = ?1 AND snapshot_date = ?2",
            params![portfolio_id, date],
            |row| row.get(0),
        )?;
        if present != expected {
            log::debug!(
                "Backfilling snapshots for portfolio {} on {} ({} present, {} expected)",
                portfolio_id,
                date,
                present,
                expected
            );
            rebuild_day(conn, market, portfolio_id, date)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BalanceAction, FundSource, StockMarket};
    use crate::money::Currency;
    use crate::testutil::{bound_usd_portfolio, date, test_db, FakeMarketData};
    use crate::transactions::NewStockTransaction;
    use rusqlite::Connection;
    use rust_decimal_macros::dec;

    fn buy(
        conn: &mut Connection,
        market: &FakeMarketData,
        portfolio_id: i64,
        d: NaiveDate,
        ticker: &str,
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
                ticker: ticker.into(),
                market: StockMarket::Us,
                txn_type: crate::models::StockTransactionType::Buy,
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
    fn test_single_event_snapshot_values() {
        let mut conn = test_db();
        let (portfolio_id, _) = bound_usd_portfolio(&conn);
        let mut market = FakeMarketData::with_fx(Currency::Usd, Currency::Twd, dec!(30));
        market.set_price("AAPL", dec!(100));

        buy(&mut conn, &market, portfolio_id, date(2024, 3, 1), "AAPL", dec!(10), dec!(100));

        let snaps =
            snapshots_in_period(&conn, portfolio_id, date(2024, 3, 1), date(2024, 3, 1)).unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].value_before_home, dec!(0.00));
        // 10 shares * 100 USD * 30.
        assert_eq!(snaps[0].value_after_home, dec!(30000.00));
        assert_eq!(snaps[0].value_after_source, dec!(1000.00));
    }

    #[test]
    fn test_same_day_chain_normalization() {
        let mut conn = test_db();
        let (portfolio_id, _) = bound_usd_portfolio(&conn);
        let mut market = FakeMarketData::with_fx(Currency::Usd, Currency::Twd, dec!(1));
        market.set_price("AAA", dec!(100));
        market.set_price("BBB", dec!(100));

        // Day-start 1000 TWD from an earlier holding.
        buy(&mut conn, &market, portfolio_id, date(2024, 2, 1), "AAA", dec!(10), dec!(100));
        // Two buys on the same later day lift the value to 2000.
        buy(&mut conn, &market, portfolio_id, date(2024, 3, 1), "BBB", dec!(4), dec!(100));
        buy(&mut conn, &market, portfolio_id, date(2024, 3, 1), "BBB", dec!(6), dec!(100));

        let snaps =
            snapshots_in_period(&conn, portfolio_id, date(2024, 3, 1), date(2024, 3, 1)).unwrap();
        assert_eq!(snaps.len(), 2);

        // First carries the whole day: {before = 1000, after = 2000}.
        assert_eq!(snaps[0].value_before_home, dec!(1000.00));
        assert_eq!(snaps[0].value_after_home, dec!(2000.00));
        // Second is flattened: {before = after = 2000}.
        assert_eq!(snaps[1].value_before_home, dec!(2000.00));
        assert_eq!(snaps[1].value_after_home, dec!(2000.00));
    }

    #[test]
    fn test_external_cash_flow_snapshot() {
        let mut conn = test_db();
        let (portfolio_id, ledger_id) = bound_usd_portfolio(&conn);
        let market = FakeMarketData::with_fx(Currency::Usd, Currency::Twd, dec!(30));

        crate::ledger::create_currency_transaction(
            &mut conn,
            &market,
            1,
            &crate::ledger::NewCurrencyTransaction {
                ledger_id,
                date: date(2024, 1, 2),
                txn_type: crate::models::CurrencyTransactionType::InitialBalance,
                foreign_amount: dec!(1000),
                home_amount: Some(dec!(30000)),
                exchange_rate: Some(dec!(30)),
            },
        )
        .unwrap();

        let snaps =
            snapshots_in_period(&conn, portfolio_id, date(2024, 1, 2), date(2024, 1, 2)).unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].event_kind, SnapshotEventKind::Currency);
        assert_eq!(snaps[0].value_before_home, dec!(0.00));
        assert_eq!(snaps[0].value_after_home, dec!(30000.00));
    }

    #[test]
    fn test_rebuild_after_delete_clears_day() {
        let mut conn = test_db();
        let (portfolio_id, _) = bound_usd_portfolio(&conn);
        let mut market = FakeMarketData::with_fx(Currency::Usd, Currency::Twd, dec!(30));
        market.set_price("AAPL", dec!(100));

        buy(&mut conn, &market, portfolio_id, date(2024, 3, 1), "AAPL", dec!(10), dec!(100));
        let txn = transactions::get_by_portfolio(&conn, portfolio_id, false).unwrap()[0].clone();

        transactions::soft_delete_stock_transaction(&mut conn, &market, 1, txn.id).unwrap();

        let snaps =
            snapshots_in_period(&conn, portfolio_id, date(2024, 3, 1), date(2024, 3, 1)).unwrap();
        assert!(snaps.is_empty());
    }

    #[test]
    fn test_ensure_coverage_backfills() {
        let mut conn = test_db();
        let (portfolio_id, _) = bound_usd_portfolio(&conn);
        let mut market = FakeMarketData::with_fx(Currency::Usd, Currency::Twd, dec!(30));
        market.set_price("AAPL", dec!(100));

        buy(&mut conn, &market, portfolio_id, date(2024, 3, 1), "AAPL", dec!(10), dec!(100));

        // Simulate a missing snapshot.
        conn.execute("DELETE FROM transaction_snapshot", []).unwrap();
        ensure_coverage(&conn, &market, portfolio_id, date(2024, 1, 1), date(2024, 12, 31))
            .unwrap();

        let snaps =
            snapshots_in_period(&conn, portfolio_id, date(2024, 1, 1), date(2024, 12, 31)).unwrap();
        assert_eq!(snaps.len(), 1);
    }
}
