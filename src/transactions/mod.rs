//! Stock transaction log and ledger linking.
//!
//! A Buy funded from a currency ledger settles in one database
//! transaction: the stock row, an optional top-up credit, and the `Spend`
//! sized `shares*price + fees` in the ledger currency, linked both ways by
//! `relatedStockTransactionId`. Deleting either side soft-deletes the
//! other, so a round-trip leaves positions and balance unchanged.

use chrono::{Duration, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::db;
use crate::error::{AppError, Result};
use crate::ledger;
use crate::marketdata::MarketData;
use crate::models::{
    ticker_is_taiwan_numeric, BalanceAction, CurrencyLedger, CurrencyTransactionType, FundSource,
    StockMarket, StockTransaction, StockTransactionType,
};
use crate::money::{round_home, round_to_scale, Currency, HOME_AMOUNT_SCALE};
use crate::portfolios;
use crate::snapshots;

#[derive(Debug, Clone)]
pub struct NewStockTransaction {
    pub portfolio_id: i64,
    pub date: NaiveDate,
    pub ticker: String,
    pub market: StockMarket,
    pub txn_type: StockTransactionType,
    pub shares: Decimal,
    pub price_per_share: Decimal,
    pub fees: Decimal,
    pub currency: Currency,
    pub fund_source: FundSource,
    pub balance_action: BalanceAction,
    /// Income type used to cover a shortfall when `balance_action` is TopUp.
    pub top_up_type: Option<CurrencyTransactionType>,
}

/// Cost in source currency for a prospective transaction, with the
/// Taiwan whole-dollar rule applied.
pub fn prospective_cost_source(
    ticker: &str,
    shares: Decimal,
    price: Decimal,
    fees: Decimal,
) -> Decimal {
    let gross = shares * price;
    if ticker_is_taiwan_numeric(ticker) {
        gross.floor() + fees
    } else {
        round_to_scale(gross, HOME_AMOUNT_SCALE) + fees
    }
}

fn normalize_ticker(ticker: &str) -> String {
    ticker.trim().to_uppercase()
}

fn validate(new: &NewStockTransaction) -> Result<()> {
    if new.shares <= Decimal::ZERO {
        return Err(AppError::BusinessRule(format!(
            "shares must be positive, got {}",
            new.shares
        )));
    }
    if new.price_per_share < Decimal::ZERO {
        return Err(AppError::BusinessRule(format!(
            "price must not be negative, got {}",
            new.price_per_share
        )));
    }
    if new.fees < Decimal::ZERO {
        return Err(AppError::BusinessRule(format!(
            "fees must not be negative, got {}",
            new.fees
        )));
    }
    let tomorrow = Utc::now().date_naive() + Duration::days(1);
    if new.date > tomorrow {
        return Err(AppError::BusinessRule(format!(
            "date {} is after the allowed horizon {}",
            new.date, tomorrow
        )));
    }
    if normalize_ticker(&new.ticker).is_empty() {
        return Err(AppError::BusinessRule("ticker must not be empty".into()));
    }
    Ok(())
}

/// Resolve the ledger a ledger-funded transaction consumes from.
fn bound_ledger(
    conn: &Connection,
    portfolio: &crate::models::Portfolio,
    new: &NewStockTransaction,
) -> Result<CurrencyLedger> {
    let ledger_id = portfolio.bound_ledger_id.ok_or_else(|| {
        AppError::BusinessRule(format!(
            "portfolio {} has no bound currency ledger",
            portfolio.id
        ))
    })?;
    let bound = ledger::get_ledger(conn, ledger_id)?;
    if bound.currency != new.currency {
        return Err(AppError::BusinessRule(format!(
            "transaction currency {} does not match ledger currency {}",
            new.currency, bound.currency
        )));
    }
    Ok(bound)
}

/// Create a stock transaction. The exchange rate is never supplied by the
/// caller; it is computed from the ledger's LIFO layers and the market
/// rate. Runs atomically with the generated ledger events and snapshots.
pub fn create_stock_transaction(
    conn: &mut Connection,
    market: &dyn MarketData,
    user_id: i64,
    new: &NewStockTransaction,
) -> Result<StockTransaction> {
    validate(new)?;
    let portfolio = portfolios::get_portfolio_owned(conn, new.portfolio_id, user_id)?;
    let ticker = normalize_ticker(&new.ticker);
    let cost_source = prospective_cost_source(&ticker, new.shares, new.price_per_share, new.fees);

    let use_ledger = new.fund_source == FundSource::CurrencyLedger
        && new.txn_type == StockTransactionType::Buy;
    let funding = if use_ledger {
        Some(bound_ledger(conn, &portfolio, new)?)
    } else {
        None
    };

    let exchange_rate = if new.currency == portfolio.home_currency {
        Decimal::ONE
    } else if let Some(bound) = &funding {
        ledger::effective_rate(conn, market, bound, new.date, cost_source)?.rate
    } else {
        market
            .fx_rate_on(new.currency, portfolio.home_currency, new.date)?
            .map(|p| p.rate)
            .ok_or_else(|| {
                AppError::ExchangeRateUnavailable(format!(
                    "no market rate for {}/{} on {}",
                    new.currency, portfolio.home_currency, new.date
                ))
            })?
    };

    let tx = conn.transaction()?;
    let now = db::now();
    tx.execute(
        r#"INSERT INTO stock_transaction
               (uuid, portfolio_id, date, ticker, market, txn_type, shares, price_per_share,
                exchange_rate, fees, currency, fund_source, currency_ledger_id, is_deleted,
                created_at, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0, ?14, ?14)"#,
        params![
            Uuid::new_v4().to_string(),
            new.portfolio_id,
            new.date,
            ticker,
            new.market.as_str(),
            new.txn_type.as_str(),
            new.shares.to_string(),
            new.price_per_share.to_string(),
            exchange_rate.to_string(),
            new.fees.to_string(),
            new.currency.as_str(),
            new.fund_source.as_str(),
            funding.as_ref().map(|l| l.id),
            now,
        ],
    )?;
    let stock_id = tx.last_insert_rowid();

    if let Some(bound) = &funding {
        settle_buy_from_ledger(
            &tx,
            market,
            bound,
            stock_id,
            new.date,
            cost_source,
            exchange_rate,
            new.balance_action,
            new.top_up_type,
        )?;
    }

    snapshots::rebuild_day(&tx, market, new.portfolio_id, new.date)?;
    tx.commit()?;

    get_stock_transaction(conn, stock_id)
}

/// Insert the covering credit (if topping up) and the linked `Spend`.
#[allow(clippy::too_many_arguments)]
fn settle_buy_from_ledger(
    conn: &Connection,
    market: &dyn MarketData,
    bound: &CurrencyLedger,
    stock_id: i64,
    date: NaiveDate,
    cost_source: Decimal,
    exchange_rate: Decimal,
    balance_action: BalanceAction,
    top_up_type: Option<CurrencyTransactionType>,
) -> Result<()> {
    let balance = ledger::balance(conn, bound.id, Some(date))?;
    let shortfall = cost_source - balance;

    if shortfall > Decimal::ZERO {
        match balance_action {
            BalanceAction::None => {
                return Err(AppError::BusinessRule(format!(
                    "ledger balance {} {} does not cover {} {}",
                    balance, bound.currency, cost_source, bound.currency
                )));
            }
            BalanceAction::Margin => {
                log::info!(
                    "Margin buy drives ledger {} to {} {}",
                    bound.id,
                    balance - cost_source,
                    bound.currency
                );
            }
            BalanceAction::TopUp => {
                let top_up_type = top_up_type.ok_or_else(|| {
                    AppError::BusinessRule("TopUp requires a topUpTransactionType".into())
                })?;
                if !top_up_type.is_income() {
                    return Err(AppError::BusinessRule(format!(
                        "{} is not an income type",
                        top_up_type.as_str()
                    )));
                }

                let (home, rate) = if top_up_type.requires_home_amount() {
                    // An ExchangeBuy or InitialBalance top-up needs a market
                    // rate to price its home cost; without one the user must
                    // pick a different type.
                    let rate = market
                        .fx_rate_on(bound.currency, bound.home_currency, date)?
                        .map(|p| p.rate)
                        .ok_or_else(|| {
                            AppError::ExchangeRateUnavailable(format!(
                                "{} top-up needs a market rate for {}/{} on {}",
                                top_up_type.as_str(),
                                bound.currency,
                                bound.home_currency,
                                date
                            ))
                        })?;
                    (Some(round_home(shortfall * rate)), Some(rate))
                } else {
                    (None, None)
                };

                ledger::insert_currency_txn_raw(
                    conn,
                    bound.id,
                    date,
                    top_up_type,
                    shortfall,
                    home,
                    rate,
                    Some(stock_id),
                )?;
            }
        }
    }

    ledger::insert_currency_txn_raw(
        conn,
        bound.id,
        date,
        CurrencyTransactionType::Spend,
        cost_source,
        None,
        Some(exchange_rate),
        Some(stock_id),
    )?;

    Ok(())
}

pub fn get_stock_transaction(conn: &Connection, id: i64) -> Result<StockTransaction> {
    conn.query_row(
        &format!("{} WHERE id = ?1", SELECT_STOCK_TXN),
        [id],
        map_stock_txn_row,
    )
    .optional()?
    .ok_or_else(|| AppError::EntityNotFound(format!("stock transaction {}", id)))
}

const SELECT_STOCK_TXN: &str = r#"SELECT id, uuid, portfolio_id, date, ticker, market, txn_type,
           shares, price_per_share, exchange_rate, fees, currency, fund_source,
           currency_ledger_id, is_deleted, created_at, updated_at
    FROM stock_transaction"#;

pub(crate) fn map_stock_txn_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StockTransaction> {
    Ok(StockTransaction {
        id: row.get(0)?,
        uuid: row.get(1)?,
        portfolio_id: row.get(2)?,
        date: row.get(3)?,
        ticker: row.get(4)?,
        market: db::enum_col(row, 5, StockMarket::parse)?,
        txn_type: db::enum_col(row, 6, StockTransactionType::parse)?,
        shares: db::dec_col(row, 7)?,
        price_per_share: db::dec_col(row, 8)?,
        exchange_rate: db::dec_col(row, 9)?,
        fees: db::dec_col(row, 10)?,
        currency: db::enum_col(row, 11, Currency::parse)?,
        fund_source: db::enum_col(row, 12, FundSource::parse)?,
        currency_ledger_id: row.get(13)?,
        is_deleted: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

/// Portfolio log in fold order `(date, createdAt)`.
pub fn get_by_portfolio(
    conn: &Connection,
    portfolio_id: i64,
    include_deleted: bool,
) -> Result<Vec<StockTransaction>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE portfolio_id = ?1 AND (?2 OR is_deleted = 0) ORDER BY date, created_at, id",
        SELECT_STOCK_TXN
    ))?;
    let rows = stmt
        .query_map(params![portfolio_id, include_deleted], map_stock_txn_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Stock transactions funded from a ledger.
pub fn get_by_ledger(conn: &Connection, ledger_id: i64) -> Result<Vec<StockTransaction>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE currency_ledger_id = ?1 AND is_deleted = 0 ORDER BY date, created_at, id",
        SELECT_STOCK_TXN
    ))?;
    let rows = stmt
        .query_map([ledger_id], map_stock_txn_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Default)]
pub struct StockTransactionChanges {
    pub date: Option<NaiveDate>,
    pub shares: Option<Decimal>,
    pub price_per_share: Option<Decimal>,
    pub fees: Option<Decimal>,
}

/// Mutate a stock transaction; the linked `Spend` re-derives its amount
/// and date, and the affected days are re-snapshotted.
pub fn update_stock_transaction(
    conn: &mut Connection,
    market: &dyn MarketData,
    user_id: i64,
    id: i64,
    changes: &StockTransactionChanges,
) -> Result<StockTransaction> {
    let existing = get_stock_transaction(conn, id)?;
    portfolios::get_portfolio_owned(conn, existing.portfolio_id, user_id)?;
    if existing.is_deleted {
        return Err(AppError::EntityNotFound(format!("stock transaction {}", id)));
    }

    let date = changes.date.unwrap_or(existing.date);
    let shares = changes.shares.unwrap_or(existing.shares);
    let price = changes.price_per_share.unwrap_or(existing.price_per_share);
    let fees = changes.fees.unwrap_or(existing.fees);

    let probe = NewStockTransaction {
        portfolio_id: existing.portfolio_id,
        date,
        ticker: existing.ticker.clone(),
        market: existing.market,
        txn_type: existing.txn_type,
        shares,
        price_per_share: price,
        fees,
        currency: existing.currency,
        fund_source: existing.fund_source,
        balance_action: BalanceAction::None,
        top_up_type: None,
    };
    validate(&probe)?;

    let cost_source = prospective_cost_source(&existing.ticker, shares, price, fees);

    let tx = conn.transaction()?;
    let now = db::now();
    tx.execute(
        r#"UPDATE stock_transaction
           SET date = ?2, shares = ?3, price_per_share = ?4, fees = ?5, updated_at = ?6
           WHERE id = ?1"#,
        params![
            id,
            date,
            shares.to_string(),
            price.to_string(),
            fees.to_string(),
            now,
        ],
    )?;

    // Re-derive the bound Spend; top-up credits keep their original size.
    for linked in ledger::entries_linked_to_stock(&tx, id)? {
        if linked.txn_type == CurrencyTransactionType::Spend {
            tx.execute(
                r#"UPDATE currency_transaction
                   SET date = ?2, foreign_amount = ?3, updated_at = ?4
                   WHERE id = ?1"#,
                params![linked.id, date, cost_source.to_string(), now],
            )?;
        } else {
            tx.execute(
                "UPDATE currency_transaction SET date = ?2, updated_at = ?3 WHERE id = ?1",
                params![linked.id, date, now],
            )?;
        }
    }

    snapshots::rebuild_day(&tx, market, existing.portfolio_id, existing.date)?;
    if date != existing.date {
        snapshots::rebuild_day(&tx, market, existing.portfolio_id, date)?;
    }
    tx.commit()?;

    get_stock_transaction(conn, id)
}

/// Soft-delete a stock transaction and everything linked to it.
pub fn soft_delete_stock_transaction(
    conn: &mut Connection,
    market: &dyn MarketData,
    user_id: i64,
    id: i64,
) -> Result<()> {
    let existing = get_stock_transaction(conn, id)?;
    portfolios::get_portfolio_owned(conn, existing.portfolio_id, user_id)?;

    let tx = conn.transaction()?;
    cascade_soft_delete(&tx, market, id)?;
    tx.commit()?;
    Ok(())
}

/// Shared by both deletion directions: marks the stock row and every
/// linked ledger entry deleted, then re-snapshots the affected day. Runs
/// inside the caller's transaction.
pub(crate) fn cascade_soft_delete(
    conn: &Connection,
    market: &dyn MarketData,
    stock_id: i64,
) -> Result<()> {
    let existing = get_stock_transaction(conn, stock_id)?;
    let now = db::now();

    conn.execute(
        "UPDATE stock_transaction SET is_deleted = 1, updated_at = ?2 WHERE id = ?1",
        params![stock_id, now],
    )?;
    for linked in ledger::entries_linked_to_stock(conn, stock_id)? {
        ledger::mark_deleted(conn, linked.id)?;
    }

    snapshots::remove_snapshot_for_stock_event(conn, stock_id)?;
    snapshots::rebuild_day(conn, market, existing.portfolio_id, existing.date)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::NewCurrencyTransaction;
    use crate::positions;
    use crate::testutil::{bound_usd_portfolio, date, test_db, FakeMarketData};
    use rust_decimal_macros::dec;

    fn seed_ledger(conn: &mut Connection, ledger_id: i64, foreign: Decimal, rate: Decimal) {
        ledger::create_currency_transaction(
            conn,
            &FakeMarketData::empty(),
            1,
            &NewCurrencyTransaction {
                ledger_id,
                date: date(2024, 1, 2),
                txn_type: CurrencyTransactionType::InitialBalance,
                foreign_amount: foreign,
                home_amount: Some(round_home(foreign * rate)),
                exchange_rate: Some(rate),
            },
        )
        .unwrap();
    }

    fn buy_request(portfolio_id: i64, shares: Decimal, price: Decimal, fees: Decimal) -> NewStockTransaction {
        NewStockTransaction {
            portfolio_id,
            date: date(2024, 3, 1),
            ticker: "aapl ".into(),
            market: StockMarket::Us,
            txn_type: StockTransactionType::Buy,
            shares,
            price_per_share: price,
            fees,
            currency: Currency::Usd,
            fund_source: FundSource::CurrencyLedger,
            balance_action: BalanceAction::None,
            top_up_type: None,
        }
    }

    #[test]
    fn test_closed_loop_buy_and_delete_roundtrip() {
        let mut conn = test_db();
        let (portfolio_id, ledger_id) = bound_usd_portfolio(&conn);
        seed_ledger(&mut conn, ledger_id, dec!(2000), dec!(30));
        let market = FakeMarketData::with_fx(Currency::Usd, Currency::Twd, dec!(31));

        let txn = create_stock_transaction(
            &mut conn,
            &market,
            1,
            &buy_request(portfolio_id, dec!(10), dec!(100), dec!(5)),
        )
        .unwrap();

        // Ticker normalized, rate LIFO-computed from the 30-rate layer.
        assert_eq!(txn.ticker, "AAPL");
        assert_eq!(txn.exchange_rate, dec!(30));

        // One Spend of 1005 USD appears and the balance drops by 1005.
        let spends = ledger::entries_linked_to_stock(&conn, txn.id).unwrap();
        assert_eq!(spends.len(), 1);
        assert_eq!(spends[0].txn_type, CurrencyTransactionType::Spend);
        assert_eq!(spends[0].foreign_amount, dec!(1005.00));
        assert_eq!(ledger::balance(&conn, ledger_id, None).unwrap(), dec!(995));

        // Position shows 10 shares at WAC 100.5 source.
        let holdings = positions::holdings_for_portfolio(&conn, portfolio_id).unwrap();
        assert_eq!(holdings.len(), 1);
        assert_eq!(holdings[0].total_shares, dec!(10));
        assert_eq!(holdings[0].average_cost_source(), Some(dec!(100.5)));
        // Home cost uses the LIFO rate: 1005 * 30.
        assert_eq!(holdings[0].total_cost_home, dec!(30150.00));

        // Deleting the stock transaction reverts both sides.
        soft_delete_stock_transaction(&mut conn, &market, 1, txn.id).unwrap();
        assert_eq!(ledger::balance(&conn, ledger_id, None).unwrap(), dec!(2000));
        assert!(positions::holdings_for_portfolio(&conn, portfolio_id)
            .unwrap()
            .is_empty());
        assert!(get_stock_transaction(&conn, txn.id).unwrap().is_deleted);
    }

    #[test]
    fn test_deleting_spend_cascades_to_stock_transaction() {
        let mut conn = test_db();
        let (portfolio_id, ledger_id) = bound_usd_portfolio(&conn);
        seed_ledger(&mut conn, ledger_id, dec!(2000), dec!(30));
        let market = FakeMarketData::empty();

        let txn = create_stock_transaction(
            &mut conn,
            &market,
            1,
            &buy_request(portfolio_id, dec!(10), dec!(100), dec!(5)),
        )
        .unwrap();
        let spend = ledger::entries_linked_to_stock(&conn, txn.id).unwrap()[0].clone();

        ledger::soft_delete_currency_transaction(&mut conn, &market, 1, spend.id).unwrap();

        assert!(get_stock_transaction(&conn, txn.id).unwrap().is_deleted);
        assert_eq!(ledger::balance(&conn, ledger_id, None).unwrap(), dec!(2000));
    }

    #[test]
    fn test_insufficient_balance_rejected_without_action() {
        let mut conn = test_db();
        let (portfolio_id, ledger_id) = bound_usd_portfolio(&conn);
        seed_ledger(&mut conn, ledger_id, dec!(100), dec!(30));

        let result = create_stock_transaction(
            &mut conn,
            &FakeMarketData::empty(),
            1,
            &buy_request(portfolio_id, dec!(10), dec!(100), dec!(5)),
        );
        assert!(matches!(result, Err(AppError::BusinessRule(_))));
        // Nothing committed.
        assert_eq!(ledger::balance(&conn, ledger_id, None).unwrap(), dec!(100));
        assert!(get_by_portfolio(&conn, portfolio_id, true).unwrap().is_empty());
    }

    #[test]
    fn test_margin_buy_goes_negative_and_survives_valuation() {
        let mut conn = test_db();
        let (portfolio_id, ledger_id) = bound_usd_portfolio(&conn);
        seed_ledger(&mut conn, ledger_id, dec!(100), dec!(30));
        let mut market = FakeMarketData::with_fx(Currency::Usd, Currency::Twd, dec!(31));
        market.set_price("AAPL", dec!(150));

        let mut request = buy_request(portfolio_id, dec!(1), dec!(150), dec!(0));
        request.balance_action = BalanceAction::Margin;
        create_stock_transaction(&mut conn, &market, 1, &request).unwrap();

        assert_eq!(ledger::balance(&conn, ledger_id, None).unwrap(), dec!(-50));

        // Valuation carries the negative cash term, never floored to zero.
        let portfolio = portfolios::get_portfolio(&conn, portfolio_id).unwrap();
        let (value_home, _) =
            snapshots::portfolio_value(&conn, &market, &portfolio, None, date(2024, 3, 1))
                .unwrap();
        // 1 * 150 * 31 + (-50 * 31) = 3100.
        assert_eq!(value_home, dec!(3100.00));
    }

    #[test]
    fn test_topup_inserts_credit_then_spend() {
        let mut conn = test_db();
        let (portfolio_id, ledger_id) = bound_usd_portfolio(&conn);
        seed_ledger(&mut conn, ledger_id, dec!(500), dec!(30));
        let market = FakeMarketData::with_fx(Currency::Usd, Currency::Twd, dec!(32));

        let mut request = buy_request(portfolio_id, dec!(10), dec!(100), dec!(0));
        request.balance_action = BalanceAction::TopUp;
        request.top_up_type = Some(CurrencyTransactionType::ExchangeBuy);
        let txn = create_stock_transaction(&mut conn, &market, 1, &request).unwrap();

        let linked = ledger::entries_linked_to_stock(&conn, txn.id).unwrap();
        assert_eq!(linked.len(), 2);
        // Credit first, then the Spend, in fold order.
        assert_eq!(linked[0].txn_type, CurrencyTransactionType::ExchangeBuy);
        assert_eq!(linked[0].foreign_amount, dec!(500));
        assert_eq!(linked[0].exchange_rate, Some(dec!(32)));
        assert_eq!(linked[1].txn_type, CurrencyTransactionType::Spend);
        assert_eq!(linked[1].foreign_amount, dec!(1000.00));

        // Balance ends at zero: 500 + 500 - 1000.
        assert_eq!(ledger::balance(&conn, ledger_id, None).unwrap(), dec!(0));

        // Undo restores balance and the LIFO stack exactly.
        soft_delete_stock_transaction(&mut conn, &market, 1, txn.id).unwrap();
        let summary = ledger::ledger_summary(&conn, ledger_id, 1).unwrap();
        assert_eq!(summary.balance, dec!(500));
        assert_eq!(summary.layers.len(), 1);
        assert_eq!(summary.layers[0].remaining, dec!(500));
        assert_eq!(summary.layers[0].exchange_rate, dec!(30));
        assert_eq!(summary.realized_pnl_home, dec!(0));
    }

    #[test]
    fn test_exchange_buy_topup_requires_market_rate() {
        let mut conn = test_db();
        let (portfolio_id, ledger_id) = bound_usd_portfolio(&conn);
        seed_ledger(&mut conn, ledger_id, dec!(500), dec!(30));

        let mut request = buy_request(portfolio_id, dec!(10), dec!(100), dec!(0));
        request.balance_action = BalanceAction::TopUp;
        request.top_up_type = Some(CurrencyTransactionType::ExchangeBuy);

        let result = create_stock_transaction(&mut conn, &FakeMarketData::empty(), 1, &request);
        assert!(matches!(result, Err(AppError::ExchangeRateUnavailable(_))));
    }

    #[test]
    fn test_currency_mismatch_with_bound_ledger() {
        let mut conn = test_db();
        let (portfolio_id, ledger_id) = bound_usd_portfolio(&conn);
        seed_ledger(&mut conn, ledger_id, dec!(2000), dec!(30));

        let mut request = buy_request(portfolio_id, dec!(10), dec!(100), dec!(0));
        request.currency = Currency::Eur;
        request.market = StockMarket::Eu;

        let result = create_stock_transaction(&mut conn, &FakeMarketData::empty(), 1, &request);
        assert!(matches!(result, Err(AppError::BusinessRule(_))));
    }

    #[test]
    fn test_update_rederives_spend() {
        let mut conn = test_db();
        let (portfolio_id, ledger_id) = bound_usd_portfolio(&conn);
        seed_ledger(&mut conn, ledger_id, dec!(5000), dec!(30));
        let market = FakeMarketData::empty();

        let txn = create_stock_transaction(
            &mut conn,
            &market,
            1,
            &buy_request(portfolio_id, dec!(10), dec!(100), dec!(5)),
        )
        .unwrap();

        update_stock_transaction(
            &mut conn,
            &market,
            1,
            txn.id,
            &StockTransactionChanges {
                date: Some(date(2024, 3, 5)),
                shares: Some(dec!(20)),
                ..Default::default()
            },
        )
        .unwrap();

        let linked = ledger::entries_linked_to_stock(&conn, txn.id).unwrap();
        assert_eq!(linked[0].foreign_amount, dec!(2005.00));
        assert_eq!(linked[0].date, date(2024, 3, 5));
        assert_eq!(ledger::balance(&conn, ledger_id, None).unwrap(), dec!(2995));
    }

    #[test]
    fn test_future_date_boundary() {
        let mut conn = test_db();
        let (portfolio_id, ledger_id) = bound_usd_portfolio(&conn);
        seed_ledger(&mut conn, ledger_id, dec!(5000), dec!(30));
        let market = FakeMarketData::empty();

        let tomorrow = Utc::now().date_naive() + Duration::days(1);
        let mut request = buy_request(portfolio_id, dec!(1), dec!(100), dec!(0));
        request.date = tomorrow;
        assert!(create_stock_transaction(&mut conn, &market, 1, &request).is_ok());

        let mut request = buy_request(portfolio_id, dec!(1), dec!(100), dec!(0));
        request.date = tomorrow + Duration::days(1);
        assert!(matches!(
            create_stock_transaction(&mut conn, &market, 1, &request),
            Err(AppError::BusinessRule(_))
        ));
    }

    #[test]
    fn test_unfunded_buy_uses_market_rate() {
        let mut conn = test_db();
        let (portfolio_id, _) = bound_usd_portfolio(&conn);
        let market = FakeMarketData::with_fx(Currency::Usd, Currency::Twd, dec!(31.5));

        let mut request = buy_request(portfolio_id, dec!(10), dec!(100), dec!(0));
        request.fund_source = FundSource::None;
        let txn = create_stock_transaction(&mut conn, &market, 1, &request).unwrap();

        assert_eq!(txn.exchange_rate, dec!(31.5));
        // No ledger events generated.
        assert!(ledger::entries_linked_to_stock(&conn, txn.id).unwrap().is_empty());
    }

    #[test]
    fn test_unfunded_buy_without_rate_unavailable() {
        let mut conn = test_db();
        let (portfolio_id, _) = bound_usd_portfolio(&conn);

        let mut request = buy_request(portfolio_id, dec!(10), dec!(100), dec!(0));
        request.fund_source = FundSource::None;
        let result = create_stock_transaction(&mut conn, &FakeMarketData::empty(), 1, &request);
        assert!(matches!(result, Err(AppError::ExchangeRateUnavailable(_))));
    }
}
