//! Per-user per-currency cash ledger.
//!
//! Balance, LIFO cost layers and realized FX P&L are all projections of
//! the ledger's non-deleted transaction log ordered by `(date, createdAt)`.
//! Nothing is persisted beyond the log itself, which makes balance-at-date
//! queries a truncation of the same fold.

use chrono::{Duration, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::db;
use crate::error::{AppError, Result};
use crate::marketdata::MarketData;
use crate::models::{CurrencyLedger, CurrencyTransaction, CurrencyTransactionType};
use crate::money::{round_home, round_rate, Currency};
use crate::snapshots;
use crate::transactions;

// =============================================================================
// Ledger CRUD
// =============================================================================

#[derive(Debug, Clone)]
pub struct NewLedger {
    pub user_id: i64,
    pub currency: Currency,
    pub home_currency: Currency,
    pub name: String,
}

pub fn create_ledger(conn: &Connection, new: &NewLedger) -> Result<CurrencyLedger> {
    let now = db::now();
    let inserted = conn.execute(
        r#"INSERT INTO currency_ledger
               (user_id, currency, home_currency, name, is_active, created_at, updated_at)
           VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)"#,
        params![
            new.user_id,
            new.currency.as_str(),
            new.home_currency.as_str(),
            new.name,
            now,
        ],
    );

    match inserted {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            return Err(AppError::BusinessRule(format!(
                "an active {} ledger already exists for this user",
                new.currency
            )));
        }
        Err(e) => return Err(e.into()),
    }

    get_ledger(conn, conn.last_insert_rowid())
}

pub fn get_ledger(conn: &Connection, id: i64) -> Result<CurrencyLedger> {
    conn.query_row(
        r#"SELECT id, user_id, currency, home_currency, name, is_active, created_at, updated_at
           FROM currency_ledger WHERE id = ?1"#,
        [id],
        map_ledger_row,
    )
    .optional()?
    .ok_or_else(|| AppError::EntityNotFound(format!("currency ledger {}", id)))
}

/// Fetch with an ownership check; a foreign owner sees 403, not 404.
pub fn get_ledger_owned(conn: &Connection, id: i64, user_id: i64) -> Result<CurrencyLedger> {
    let ledger = get_ledger(conn, id)?;
    if ledger.user_id != user_id {
        return Err(AppError::AccessDenied(format!("currency ledger {}", id)));
    }
    Ok(ledger)
}

pub fn list_ledgers(conn: &Connection, user_id: i64) -> Result<Vec<CurrencyLedger>> {
    let mut stmt = conn.prepare(
        r#"SELECT id, user_id, currency, home_currency, name, is_active, created_at, updated_at
           FROM currency_ledger WHERE user_id = ?1 ORDER BY currency"#,
    )?;
    let ledgers = stmt
        .query_map([user_id], map_ledger_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ledgers)
}

pub fn deactivate_ledger(conn: &Connection, id: i64, user_id: i64) -> Result<()> {
    get_ledger_owned(conn, id, user_id)?;
    conn.execute(
        "UPDATE currency_ledger SET is_active = 0, updated_at = ?2 WHERE id = ?1",
        params![id, db::now()],
    )?;
    Ok(())
}

fn map_ledger_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CurrencyLedger> {
    Ok(CurrencyLedger {
        id: row.get(0)?,
        user_id: row.get(1)?,
        currency: db::enum_col(row, 2, Currency::parse)?,
        home_currency: db::enum_col(row, 3, Currency::parse)?,
        name: row.get(4)?,
        is_active: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

// =============================================================================
// Projection
// =============================================================================

/// One LIFO cost layer: foreign still held at the home-currency rate it was
/// acquired at. Derived on every read, never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifoLayer {
    pub remaining: Decimal,
    pub exchange_rate: Decimal,
    pub origin_date: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerProjection {
    pub balance: Decimal,
    /// Bottom of the stack first; consumption pops from the back.
    pub layers: Vec<LifoLayer>,
    /// Realized FX P&L in home currency over consumed layers.
    pub realized_pnl_home: Decimal,
}

/// Non-deleted ledger transactions ordered by `(date, createdAt)`,
/// optionally truncated at `as_of` (inclusive).
pub fn entries(
    conn: &Connection,
    ledger_id: i64,
    as_of: Option<NaiveDate>,
) -> Result<Vec<CurrencyTransaction>> {
    let mut stmt = conn.prepare(
        r#"SELECT id, uuid, ledger_id, date, txn_type, foreign_amount, home_amount,
                  exchange_rate, related_stock_transaction_id, is_deleted, created_at, updated_at
           FROM currency_transaction
           WHERE ledger_id = ?1 AND is_deleted = 0 AND (?2 IS NULL OR date <= ?2)
           ORDER BY date, created_at, id"#,
    )?;
    let rows = stmt
        .query_map(params![ledger_id, as_of], map_currency_txn_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub(crate) fn map_currency_txn_row(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<CurrencyTransaction> {
    Ok(CurrencyTransaction {
        id: row.get(0)?,
        uuid: row.get(1)?,
        ledger_id: row.get(2)?,
        date: row.get(3)?,
        txn_type: db::enum_col(row, 4, CurrencyTransactionType::parse)?,
        foreign_amount: db::dec_col(row, 5)?,
        home_amount: db::opt_dec_col(row, 6)?,
        exchange_rate: db::opt_dec_col(row, 7)?,
        related_stock_transaction_id: row.get(8)?,
        is_deleted: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

/// Pure fold of an ordered entry list into balance, layers and realized P&L.
pub fn project(entries: &[CurrencyTransaction]) -> LedgerProjection {
    let mut balance = Decimal::ZERO;
    let mut layers: Vec<LifoLayer> = Vec::new();
    let mut realized = Decimal::ZERO;

    for txn in entries {
        if txn.txn_type.is_credit() {
            balance += txn.foreign_amount;
        } else {
            balance -= txn.foreign_amount;
        }

        match txn.txn_type {
            CurrencyTransactionType::ExchangeBuy | CurrencyTransactionType::InitialBalance => {
                // Only entries carrying a home cost establish a layer.
                if let Some(home) = txn.home_amount {
                    if txn.foreign_amount > Decimal::ZERO {
                        layers.push(LifoLayer {
                            remaining: txn.foreign_amount,
                            exchange_rate: round_rate(home / txn.foreign_amount),
                            origin_date: txn.date,
                        });
                    }
                }
            }
            CurrencyTransactionType::ExchangeSell | CurrencyTransactionType::Spend => {
                let mut need = txn.foreign_amount;
                while need > Decimal::ZERO {
                    let Some(top) = layers.last_mut() else { break };
                    let consumed = need.min(top.remaining);
                    if let Some(rate) = txn.exchange_rate {
                        realized += round_home((rate - top.exchange_rate) * consumed);
                    }
                    top.remaining -= consumed;
                    need -= consumed;
                    if top.remaining.is_zero() {
                        layers.pop();
                    }
                }
                // Leftover need means the balance went negative; there is
                // no layer to realize against.
            }
            _ => {}
        }
    }

    LedgerProjection {
        balance,
        layers,
        realized_pnl_home: realized,
    }
}

/// Ledger balance at `as_of` (or now).
pub fn balance(conn: &Connection, ledger_id: i64, as_of: Option<NaiveDate>) -> Result<Decimal> {
    Ok(project(&entries(conn, ledger_id, as_of)?).balance)
}

// =============================================================================
// Effective exchange rate
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateSource {
    Lifo,
    Market,
    Blended,
}

/// Preview of the system-computed rate for a prospective Buy.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatePreview {
    pub rate: Decimal,
    pub source: RateSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifo_rate: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_rate: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifo_portion: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_portion: Option<Decimal>,
}

/// Rate a Buy of `amount` on `date` would settle at, from LIFO layers,
/// the market rate, or a blend when the balance only partly covers it.
pub fn effective_rate(
    conn: &Connection,
    market: &dyn MarketData,
    ledger: &CurrencyLedger,
    date: NaiveDate,
    amount: Decimal,
) -> Result<RatePreview> {
    if amount <= Decimal::ZERO {
        return Err(AppError::BusinessRule(format!(
            "amount must be positive, got {}",
            amount
        )));
    }

    if ledger.is_home_ledger() {
        return Ok(RatePreview {
            rate: Decimal::ONE,
            source: RateSource::Lifo,
            lifo_rate: Some(Decimal::ONE),
            market_rate: None,
            lifo_portion: Some(amount),
            market_portion: None,
        });
    }

    let projection = project(&entries(conn, ledger.id, Some(date))?);
    let market_rate = market
        .fx_rate_on(ledger.currency, ledger.home_currency, date)?
        .map(|p| p.rate);

    let has_layers = !projection.layers.is_empty();

    if has_layers && projection.balance >= amount {
        let (consumed, weighted) = drain(&projection.layers, amount);
        let lifo_rate = round_rate(weighted / consumed);
        return Ok(RatePreview {
            rate: lifo_rate,
            source: RateSource::Lifo,
            lifo_rate: Some(lifo_rate),
            market_rate,
            lifo_portion: Some(consumed),
            market_portion: None,
        });
    }

    if has_layers && projection.balance > Decimal::ZERO {
        if let Some(market_rate) = market_rate {
            let lifo_portion = projection.balance;
            let market_portion = amount - lifo_portion;
            let (consumed, weighted) = drain(&projection.layers, lifo_portion);
            let lifo_rate = round_rate(weighted / consumed);
            let rate = round_rate(
                (lifo_portion * lifo_rate + market_portion * market_rate) / amount,
            );
            return Ok(RatePreview {
                rate,
                source: RateSource::Blended,
                lifo_rate: Some(lifo_rate),
                market_rate: Some(market_rate),
                lifo_portion: Some(lifo_portion),
                market_portion: Some(market_portion),
            });
        }
    }

    if let Some(market_rate) = market_rate {
        return Ok(RatePreview {
            rate: market_rate,
            source: RateSource::Market,
            lifo_rate: None,
            market_rate: Some(market_rate),
            lifo_portion: None,
            market_portion: Some(amount),
        });
    }

    Err(AppError::ExchangeRateUnavailable(format!(
        "no LIFO layers and no market rate for {}/{} on {}",
        ledger.currency, ledger.home_currency, date
    )))
}

/// Ownership-checked preview, the operation behind
/// `GET /currency-ledgers/{id}/exchange-rate-preview`.
pub fn preview_exchange_rate(
    conn: &Connection,
    market: &dyn MarketData,
    user_id: i64,
    ledger_id: i64,
    date: NaiveDate,
    amount: Decimal,
) -> Result<RatePreview> {
    let ledger = get_ledger_owned(conn, ledger_id, user_id)?;
    effective_rate(conn, market, &ledger, date, amount)
}

/// Simulate consuming `amount` from the top of the stack; returns the
/// foreign amount actually covered and the rate-weighted sum over it.
fn drain(layers: &[LifoLayer], amount: Decimal) -> (Decimal, Decimal) {
    let mut need = amount;
    let mut consumed = Decimal::ZERO;
    let mut weighted = Decimal::ZERO;

    for layer in layers.iter().rev() {
        if need <= Decimal::ZERO {
            break;
        }
        let take = need.min(layer.remaining);
        consumed += take;
        weighted += take * layer.exchange_rate;
        need -= take;
    }

    (consumed, weighted)
}

// =============================================================================
// Currency transaction CRUD
// =============================================================================

#[derive(Debug, Clone)]
pub struct NewCurrencyTransaction {
    pub ledger_id: i64,
    pub date: NaiveDate,
    pub txn_type: CurrencyTransactionType,
    pub foreign_amount: Decimal,
    pub home_amount: Option<Decimal>,
    pub exchange_rate: Option<Decimal>,
}

/// Validate the request against the ledger's type matrix and the home
/// ledger rule, returning the row values to persist.
fn validate_currency_txn(
    ledger: &CurrencyLedger,
    new: &NewCurrencyTransaction,
) -> Result<(Decimal, Option<Decimal>, Option<Decimal>)> {
    if new.foreign_amount <= Decimal::ZERO {
        return Err(AppError::BusinessRule(format!(
            "amount must be positive, got {}",
            new.foreign_amount
        )));
    }

    let tomorrow = Utc::now().date_naive() + Duration::days(1);
    if new.date > tomorrow {
        return Err(AppError::BusinessRule(format!(
            "date {} is after the allowed horizon {}",
            new.date, tomorrow
        )));
    }

    let allowed = if ledger.is_home_ledger() {
        new.txn_type.allowed_on_home_ledger()
    } else {
        new.txn_type.allowed_on_foreign_ledger()
    };
    if !allowed {
        return Err(AppError::BusinessRule(format!(
            "{} is not allowed on a {} ledger",
            new.txn_type.as_str(),
            if ledger.is_home_ledger() { "home-currency" } else { "foreign-currency" }
        )));
    }

    if ledger.is_home_ledger() {
        // Rate pinned to 1 regardless of what the client sent.
        return Ok((
            new.foreign_amount,
            Some(new.foreign_amount),
            Some(Decimal::ONE),
        ));
    }

    if new.txn_type.requires_home_amount() {
        let home = new.home_amount.filter(|h| *h > Decimal::ZERO);
        let rate = new.exchange_rate.filter(|r| *r > Decimal::ZERO);
        if home.is_none() || rate.is_none() {
            return Err(AppError::BusinessRule(format!(
                "{} requires homeAmount and exchangeRate",
                new.txn_type.as_str()
            )));
        }
        return Ok((new.foreign_amount, home, rate));
    }

    Ok((new.foreign_amount, new.home_amount, new.exchange_rate))
}

pub fn create_currency_transaction(
    conn: &mut Connection,
    market: &dyn MarketData,
    user_id: i64,
    new: &NewCurrencyTransaction,
) -> Result<CurrencyTransaction> {
    let ledger = get_ledger_owned(conn, new.ledger_id, user_id)?;
    let (foreign, home, rate) = validate_currency_txn(&ledger, new)?;

    let tx = conn.transaction()?;
    let id = insert_currency_txn_raw(
        &tx,
        new.ledger_id,
        new.date,
        new.txn_type,
        foreign,
        home,
        rate,
        None,
    )?;

    if new.txn_type.is_external_cash_flow() {
        for portfolio_id in portfolios_bound_to(&tx, new.ledger_id)? {
            snapshots::rebuild_day(&tx, market, portfolio_id, new.date)?;
        }
    }
    tx.commit()?;

    get_currency_transaction(conn, id)
}

/// Validate and insert inside the caller's transaction; the CSV importer
/// uses this so a whole file commits or rolls back together.
pub(crate) fn validate_and_insert_in_tx(
    conn: &Connection,
    ledger: &CurrencyLedger,
    new: &NewCurrencyTransaction,
) -> Result<i64> {
    let (foreign, home, rate) = validate_currency_txn(ledger, new)?;
    insert_currency_txn_raw(
        conn,
        new.ledger_id,
        new.date,
        new.txn_type,
        foreign,
        home,
        rate,
        None,
    )
}

/// Bare insert shared with the stock-transaction linking path. Runs inside
/// the caller's transaction.
pub(crate) fn insert_currency_txn_raw(
    conn: &Connection,
    ledger_id: i64,
    date: NaiveDate,
    txn_type: CurrencyTransactionType,
    foreign_amount: Decimal,
    home_amount: Option<Decimal>,
    exchange_rate: Option<Decimal>,
    related_stock_transaction_id: Option<i64>,
) -> Result<i64> {
    let now = db::now();
    conn.execute(
        r#"INSERT INTO currency_transaction
               (uuid, ledger_id, date, txn_type, foreign_amount, home_amount, exchange_rate,
                related_stock_transaction_id, is_deleted, created_at, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)"#,
        params![
            Uuid::new_v4().to_string(),
            ledger_id,
            date,
            txn_type.as_str(),
            foreign_amount.to_string(),
            home_amount.map(|h| h.to_string()),
            exchange_rate.map(|r| r.to_string()),
            related_stock_transaction_id,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_currency_transaction(conn: &Connection, id: i64) -> Result<CurrencyTransaction> {
    conn.query_row(
        r#"SELECT id, uuid, ledger_id, date, txn_type, foreign_amount, home_amount,
                  exchange_rate, related_stock_transaction_id, is_deleted, created_at, updated_at
           FROM currency_transaction WHERE id = ?1"#,
        [id],
        map_currency_txn_row,
    )
    .optional()?
    .ok_or_else(|| AppError::EntityNotFound(format!("currency transaction {}", id)))
}

#[derive(Debug, Clone, Default)]
pub struct CurrencyTransactionChanges {
    pub date: Option<NaiveDate>,
    pub foreign_amount: Option<Decimal>,
    pub home_amount: Option<Option<Decimal>>,
    pub exchange_rate: Option<Option<Decimal>>,
}

pub fn update_currency_transaction(
    conn: &mut Connection,
    market: &dyn MarketData,
    user_id: i64,
    id: i64,
    changes: &CurrencyTransactionChanges,
) -> Result<CurrencyTransaction> {
    let existing = get_currency_transaction(conn, id)?;
    let ledger = get_ledger_owned(conn, existing.ledger_id, user_id)?;

    if existing.related_stock_transaction_id.is_some() {
        return Err(AppError::BusinessRule(
            "a ledger entry bound to a stock transaction is maintained through it".into(),
        ));
    }

    let candidate = NewCurrencyTransaction {
        ledger_id: existing.ledger_id,
        date: changes.date.unwrap_or(existing.date),
        txn_type: existing.txn_type,
        foreign_amount: changes.foreign_amount.unwrap_or(existing.foreign_amount),
        home_amount: changes.home_amount.unwrap_or(existing.home_amount),
        exchange_rate: changes.exchange_rate.unwrap_or(existing.exchange_rate),
    };
    let (foreign, home, rate) = validate_currency_txn(&ledger, &candidate)?;

    let tx = conn.transaction()?;
    tx.execute(
        r#"UPDATE currency_transaction
           SET date = ?2, foreign_amount = ?3, home_amount = ?4, exchange_rate = ?5, updated_at = ?6
           WHERE id = ?1"#,
        params![
            id,
            candidate.date,
            foreign.to_string(),
            home.map(|h| h.to_string()),
            rate.map(|r| r.to_string()),
            db::now(),
        ],
    )?;

    if existing.txn_type.is_external_cash_flow() {
        for portfolio_id in portfolios_bound_to(&tx, existing.ledger_id)? {
            snapshots::rebuild_day(&tx, market, portfolio_id, existing.date)?;
            if candidate.date != existing.date {
                snapshots::rebuild_day(&tx, market, portfolio_id, candidate.date)?;
            }
        }
    }
    tx.commit()?;

    get_currency_transaction(conn, id)
}

/// Soft-delete a ledger entry. Deleting an entry bound to a stock
/// transaction undoes the stock side too, and vice versa.
pub fn soft_delete_currency_transaction(
    conn: &mut Connection,
    market: &dyn MarketData,
    user_id: i64,
    id: i64,
) -> Result<()> {
    let existing = get_currency_transaction(conn, id)?;
    get_ledger_owned(conn, existing.ledger_id, user_id)?;

    let tx = conn.transaction()?;
    if let Some(stock_id) = existing.related_stock_transaction_id {
        transactions::cascade_soft_delete(&tx, market, stock_id)?;
    } else {
        mark_deleted(&tx, id)?;
        if existing.txn_type.is_external_cash_flow() {
            for portfolio_id in portfolios_bound_to(&tx, existing.ledger_id)? {
                snapshots::rebuild_day(&tx, market, portfolio_id, existing.date)?;
            }
        }
    }
    tx.commit()?;
    Ok(())
}

pub(crate) fn mark_deleted(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "UPDATE currency_transaction SET is_deleted = 1, updated_at = ?2 WHERE id = ?1",
        params![id, db::now()],
    )?;
    Ok(())
}

/// Every non-deleted ledger entry bound to a stock transaction.
pub(crate) fn entries_linked_to_stock(
    conn: &Connection,
    stock_transaction_id: i64,
) -> Result<Vec<CurrencyTransaction>> {
    let mut stmt = conn.prepare(
        r#"SELECT id, uuid, ledger_id, date, txn_type, foreign_amount, home_amount,
                  exchange_rate, related_stock_transaction_id, is_deleted, created_at, updated_at
           FROM currency_transaction
           WHERE related_stock_transaction_id = ?1 AND is_deleted = 0
           ORDER BY date, created_at, id"#,
    )?;
    let rows = stmt
        .query_map([stock_transaction_id], map_currency_txn_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub(crate) fn portfolios_bound_to(conn: &Connection, ledger_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM portfolio WHERE bound_ledger_id = ?1")?;
    let ids = stmt
        .query_map([ledger_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

/// Balance, layer stack and realized FX P&L in one view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSummary {
    pub ledger_id: i64,
    pub currency: Currency,
    pub balance: Decimal,
    pub layers: Vec<LifoLayer>,
    pub realized_pnl_home: Decimal,
}

pub fn ledger_summary(conn: &Connection, ledger_id: i64, user_id: i64) -> Result<LedgerSummary> {
    let ledger = get_ledger_owned(conn, ledger_id, user_id)?;
    let projection = project(&entries(conn, ledger_id, None)?);
    Ok(LedgerSummary {
        ledger_id,
        currency: ledger.currency,
        balance: projection.balance,
        layers: projection.layers,
        realized_pnl_home: projection.realized_pnl_home,
    })
}
