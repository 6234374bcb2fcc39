//! Market-data facade: quote and FX fetching with a write-through cache.
//!
//! Every lookup is keyed by `(symbol, market, date)` or `(from, to, date)`.
//! A fetch that returns "no data" writes a negative marker so later lookups
//! answer "unavailable" without another outbound call. A transport timeout
//! returns "unavailable" without a marker so a transient blip is retried.
//!
//! Historical lookups resolve to the nearest trading day at or before the
//! requested date; the cache stores both dates and valuation always uses
//! the actual-date rate.

pub mod fx;
pub mod rate_limiter;
pub mod stooq;
pub mod twse;
pub mod yahoo;

use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

use crate::config::Config;
use crate::db;
use crate::error::{AppError, Result};
use crate::models::StockMarket;
use crate::money::Currency;
use rate_limiter::TwseRateLimiter;

/// A resolved historical price.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePoint {
    pub price: Decimal,
    pub currency: Currency,
    /// Trading day the price actually belongs to (≤ requested date).
    pub actual_date: NaiveDate,
}

/// A resolved historical exchange rate.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FxPoint {
    pub rate: Decimal,
    pub actual_date: NaiveDate,
}

/// Synchronous market-data lookups used by the valuation and performance
/// engines. Implemented by the persistent cache; tests inject a fake.
pub trait MarketData {
    fn price_on(
        &self,
        ticker: &str,
        market: StockMarket,
        date: NaiveDate,
    ) -> Result<Option<PricePoint>>;

    fn fx_rate_on(&self, from: Currency, to: Currency, date: NaiveDate)
        -> Result<Option<FxPoint>>;
}

/// Cache-only [`MarketData`] view over the database. Never goes to the
/// network; the async [`MarketDataService`] is responsible for coverage.
pub struct CachedMarketData<'a> {
    conn: &'a Connection,
}

impl<'a> CachedMarketData<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl MarketData for CachedMarketData<'_> {
    fn price_on(
        &self,
        ticker: &str,
        market: StockMarket,
        date: NaiveDate,
    ) -> Result<Option<PricePoint>> {
        cached_price(self.conn, ticker, market, date)
    }

    fn fx_rate_on(
        &self,
        from: Currency,
        to: Currency,
        date: NaiveDate,
    ) -> Result<Option<FxPoint>> {
        if from == to {
            return Ok(Some(FxPoint {
                rate: Decimal::ONE,
                actual_date: date,
            }));
        }
        cached_fx_rate(self.conn, from, to, date)
    }
}

// =============================================================================
// Cache reads and writes
// =============================================================================

pub fn cached_price(
    conn: &Connection,
    symbol: &str,
    market: StockMarket,
    date: NaiveDate,
) -> Result<Option<PricePoint>> {
    let row = conn
        .query_row(
            r#"SELECT price, currency, actual_date, is_not_available
               FROM price_cache
               WHERE symbol = ?1 AND market = ?2 AND requested_date = ?3"#,
            params![symbol, market.as_str(), date],
            |row| {
                let not_available: bool = row.get(3)?;
                if not_available {
                    return Ok(None);
                }
                Ok(Some(PricePoint {
                    price: db::dec_col(row, 0)?,
                    currency: db::enum_col(row, 1, Currency::parse)?,
                    actual_date: row.get(2)?,
                }))
            },
        )
        .optional()?;

    Ok(row.flatten())
}

pub fn cached_fx_rate(
    conn: &Connection,
    from: Currency,
    to: Currency,
    date: NaiveDate,
) -> Result<Option<FxPoint>> {
    let row = conn
        .query_row(
            r#"SELECT rate, actual_date, is_not_available
               FROM fx_rate_cache
               WHERE from_currency = ?1 AND to_currency = ?2 AND requested_date = ?3"#,
            params![from.as_str(), to.as_str(), date],
            |row| {
                let not_available: bool = row.get(2)?;
                if not_available {
                    return Ok(None);
                }
                Ok(Some(FxPoint {
                    rate: db::dec_col(row, 0)?,
                    actual_date: row.get(1)?,
                }))
            },
        )
        .optional()?;

    Ok(row.flatten())
}

/// True when the cache already answers this lookup, positively or not.
fn price_cache_has(
    conn: &Connection,
    symbol: &str,
    market: StockMarket,
    date: NaiveDate,
) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM price_cache WHERE symbol = ?1 AND market = ?2 AND requested_date = ?3",
        params![symbol, market.as_str(), date],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn fx_cache_has(conn: &Connection, from: Currency, to: Currency, date: NaiveDate) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM fx_rate_cache WHERE from_currency = ?1 AND to_currency = ?2 AND requested_date = ?3",
        params![from.as_str(), to.as_str(), date],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn store_price(
    conn: &Connection,
    symbol: &str,
    market: StockMarket,
    requested: NaiveDate,
    point: &PricePoint,
) -> Result<()> {
    conn.execute(
        r#"INSERT INTO price_cache
               (symbol, market, requested_date, actual_date, price, currency, is_not_available, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
           ON CONFLICT (symbol, market, requested_date) DO UPDATE SET
               actual_date = excluded.actual_date,
               price = excluded.price,
               currency = excluded.currency,
               is_not_available = 0"#,
        params![
            symbol,
            market.as_str(),
            requested,
            point.actual_date,
            point.price.to_string(),
            point.currency.as_str(),
            db::now(),
        ],
    )?;
    Ok(())
}

pub fn store_price_unavailable(
    conn: &Connection,
    symbol: &str,
    market: StockMarket,
    requested: NaiveDate,
) -> Result<()> {
    conn.execute(
        r#"INSERT INTO price_cache
               (symbol, market, requested_date, is_not_available, created_at)
           VALUES (?1, ?2, ?3, 1, ?4)
           ON CONFLICT (symbol, market, requested_date) DO NOTHING"#,
        params![symbol, market.as_str(), requested, db::now()],
    )?;
    Ok(())
}

pub fn store_fx_rate(
    conn: &Connection,
    from: Currency,
    to: Currency,
    requested: NaiveDate,
    point: &FxPoint,
) -> Result<()> {
    conn.execute(
        r#"INSERT INTO fx_rate_cache
               (from_currency, to_currency, requested_date, actual_date, rate, is_not_available, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
           ON CONFLICT (from_currency, to_currency, requested_date) DO UPDATE SET
               actual_date = excluded.actual_date,
               rate = excluded.rate,
               is_not_available = 0"#,
        params![
            from.as_str(),
            to.as_str(),
            requested,
            point.actual_date,
            point.rate.to_string(),
            db::now(),
        ],
    )?;
    Ok(())
}

pub fn store_fx_unavailable(
    conn: &Connection,
    from: Currency,
    to: Currency,
    requested: NaiveDate,
) -> Result<()> {
    conn.execute(
        r#"INSERT INTO fx_rate_cache
               (from_currency, to_currency, requested_date, is_not_available, created_at)
           VALUES (?1, ?2, ?3, 1, ?4)
           ON CONFLICT (from_currency, to_currency, requested_date) DO NOTHING"#,
        params![from.as_str(), to.as_str(), requested, db::now()],
    )?;
    Ok(())
}

// =============================================================================
// Year-end price cache (negative-cached per market key and month)
// =============================================================================

/// Cache key for a `(ticker, market)` pair, e.g. `2330.TW`.
pub fn market_key(ticker: &str, market: StockMarket) -> String {
    format!("{}.{}", ticker, market.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YearEndLookup {
    Price(Decimal),
    NotAvailable,
    Missing,
}

pub fn cached_year_end_price(
    conn: &Connection,
    key: &str,
    year_month: &str,
) -> Result<YearEndLookup> {
    let row = conn
        .query_row(
            r#"SELECT price, is_not_available FROM year_end_price_cache
               WHERE market_key = ?1 AND year_month = ?2"#,
            params![key, year_month],
            |row| {
                let not_available: bool = row.get(1)?;
                if not_available {
                    Ok(YearEndLookup::NotAvailable)
                } else {
                    Ok(YearEndLookup::Price(db::dec_col(row, 0)?))
                }
            },
        )
        .optional()?;

    Ok(row.unwrap_or(YearEndLookup::Missing))
}

pub fn store_year_end_price(
    conn: &Connection,
    key: &str,
    year_month: &str,
    price: Option<Decimal>,
) -> Result<()> {
    conn.execute(
        r#"INSERT INTO year_end_price_cache
               (market_key, year_month, price, is_not_available, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT (market_key, year_month) DO UPDATE SET
               price = excluded.price,
               is_not_available = excluded.is_not_available"#,
        params![
            key,
            year_month,
            price.map(|p| p.to_string()),
            price.is_none(),
            db::now(),
        ],
    )?;
    Ok(())
}

// =============================================================================
// Async fetch service
// =============================================================================

/// What an outbound fetch produced.
enum FetchOutcome<T> {
    Data(T),
    /// The source answered and has no data for this key: negative-cache it.
    NoData,
    /// The source did not answer in time: do not cache, retry later.
    Unavailable,
}

/// Write-through fetcher over TWSE (TW tickers), Yahoo with Stooq fallback
/// (non-TW) and the FX API.
pub struct MarketDataService {
    config: Config,
    client: reqwest::Client,
    limiter: Arc<TwseRateLimiter>,
}

impl MarketDataService {
    pub fn new(config: Config) -> Self {
        let limiter = rate_limiter::global();
        Self::with_limiter(config, limiter)
    }

    pub fn with_limiter(config: Config, limiter: Arc<TwseRateLimiter>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .expect("failed to build HTTP client");
        Self {
            config,
            client,
            limiter,
        }
    }

    /// Make sure the price cache answers `(ticker, market, date)`, fetching
    /// if needed, and return the cached answer.
    pub async fn ensure_price(
        &self,
        conn: &Connection,
        ticker: &str,
        market: StockMarket,
        date: NaiveDate,
    ) -> Result<Option<PricePoint>> {
        if price_cache_has(conn, ticker, market, date)? {
            return cached_price(conn, ticker, market, date);
        }

        let outcome = match market {
            StockMarket::Tw => self.fetch_tw_price(conn, ticker, market, date).await?,
            _ => self.fetch_foreign_price(ticker, market, date).await,
        };

        match outcome {
            FetchOutcome::Data(point) => {
                store_price(conn, ticker, market, date, &point)?;
                Ok(Some(point))
            }
            FetchOutcome::NoData => {
                store_price_unavailable(conn, ticker, market, date)?;
                Ok(None)
            }
            FetchOutcome::Unavailable => Ok(None),
        }
    }

    async fn fetch_tw_price(
        &self,
        conn: &Connection,
        ticker: &str,
        market: StockMarket,
        date: NaiveDate,
    ) -> Result<FetchOutcome<PricePoint>> {
        let today = Utc::now().date_naive();
        if let Err(e) = self
            .limiter
            .try_acquire(self.config.twse_daily_quota, today)
        {
            // The daily quota is gone; mark the lookup so the rest of the
            // day answers from the cache instead of re-raising upstream.
            store_price_unavailable(conn, ticker, market, date)?;
            return Err(e);
        }

        match twse::fetch_close_near(&self.client, &self.config.twse_api_url, ticker, date).await {
            Ok(Some((actual_date, price))) => Ok(FetchOutcome::Data(PricePoint {
                price,
                currency: Currency::Twd,
                actual_date,
            })),
            Ok(None) => Ok(FetchOutcome::NoData),
            Err(e) => {
                log::warn!("TWSE fetch failed for {} on {}: {}", ticker, date, e);
                Ok(FetchOutcome::Unavailable)
            }
        }
    }

    async fn fetch_foreign_price(
        &self,
        ticker: &str,
        market: StockMarket,
        date: NaiveDate,
    ) -> FetchOutcome<PricePoint> {
        let currency = market.currency();

        match yahoo::fetch_close_near(&self.client, ticker, market, date).await {
            Ok(Some((actual_date, price))) => {
                return FetchOutcome::Data(PricePoint {
                    price,
                    currency,
                    actual_date,
                })
            }
            Ok(None) => {}
            Err(e) => log::warn!("Yahoo fetch failed for {} on {}: {}", ticker, date, e),
        }

        // Stooq backs up Yahoo for both "no data" and transport failures.
        match stooq::fetch_close_near(&self.client, ticker, market, date).await {
            Ok(Some((actual_date, price))) => FetchOutcome::Data(PricePoint {
                price,
                currency,
                actual_date,
            }),
            Ok(None) => FetchOutcome::NoData,
            Err(e) => {
                log::warn!("Stooq fetch failed for {} on {}: {}", ticker, date, e);
                FetchOutcome::Unavailable
            }
        }
    }

    /// Make sure the FX cache answers `(from, to, date)` and return it.
    pub async fn ensure_fx_rate(
        &self,
        conn: &Connection,
        from: Currency,
        to: Currency,
        date: NaiveDate,
    ) -> Result<Option<FxPoint>> {
        if from == to {
            return Ok(Some(FxPoint {
                rate: Decimal::ONE,
                actual_date: date,
            }));
        }
        if fx_cache_has(conn, from, to, date)? {
            return cached_fx_rate(conn, from, to, date);
        }

        match fx::fetch_rate(&self.client, &self.config.fx_api_url, from, to, date).await {
            Ok(Some(point)) => {
                store_fx_rate(conn, from, to, date, &point)?;
                Ok(Some(point))
            }
            Ok(None) => {
                store_fx_unavailable(conn, from, to, date)?;
                Ok(None)
            }
            Err(e) => {
                log::warn!("FX fetch failed for {}/{} on {}: {}", from, to, date, e);
                Ok(None)
            }
        }
    }

    /// Year-end closing price for `(ticker, market)`, negative-cached per
    /// `(marketKey, yearMonth)`.
    pub async fn ensure_year_end_price(
        &self,
        conn: &Connection,
        ticker: &str,
        market: StockMarket,
        year: i32,
    ) -> Result<Option<Decimal>> {
        let key = market_key(ticker, market);
        let year_month = format!("{}-12", year);

        match cached_year_end_price(conn, &key, &year_month)? {
            YearEndLookup::Price(p) => return Ok(Some(p)),
            YearEndLookup::NotAvailable => return Ok(None),
            YearEndLookup::Missing => {}
        }

        let year_end = NaiveDate::from_ymd_opt(year, 12, 31).expect("valid year end");
        let point = self.ensure_price(conn, ticker, market, year_end).await?;
        store_year_end_price(conn, &key, &year_month, point.as_ref().map(|p| p.price))?;
        Ok(point.map(|p| p.price))
    }
}

/// `YYYY-MM` key for December of `year`.
pub fn december_key(year: i32) -> String {
    format!("{}-12", year)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_price_cache_roundtrip() {
        let conn = db::init_in_memory().unwrap();
        let requested = date(2024, 1, 7); // a Sunday
        let point = PricePoint {
            price: dec!(593),
            currency: Currency::Twd,
            actual_date: date(2024, 1, 5),
        };
        store_price(&conn, "2330", StockMarket::Tw, requested, &point).unwrap();

        let cached = cached_price(&conn, "2330", StockMarket::Tw, requested)
            .unwrap()
            .unwrap();
        assert_eq!(cached.price, dec!(593));
        // The cache remembers which trading day the price belongs to.
        assert_eq!(cached.actual_date, date(2024, 1, 5));
    }

    #[test]
    fn test_negative_marker_reported_as_unavailable() {
        let conn = db::init_in_memory().unwrap();
        store_price_unavailable(&conn, "GONE", StockMarket::Us, date(2024, 1, 5)).unwrap();

        assert!(cached_price(&conn, "GONE", StockMarket::Us, date(2024, 1, 5))
            .unwrap()
            .is_none());
        assert!(price_cache_has(&conn, "GONE", StockMarket::Us, date(2024, 1, 5)).unwrap());
    }

    #[test]
    fn test_negative_marker_not_clobbered_by_second_miss() {
        let conn = db::init_in_memory().unwrap();
        store_price_unavailable(&conn, "GONE", StockMarket::Us, date(2024, 1, 5)).unwrap();
        store_price_unavailable(&conn, "GONE", StockMarket::Us, date(2024, 1, 5)).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM price_cache", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_positive_overwrites_negative_marker() {
        let conn = db::init_in_memory().unwrap();
        let requested = date(2024, 1, 5);
        store_price_unavailable(&conn, "AAPL", StockMarket::Us, requested).unwrap();

        let point = PricePoint {
            price: dec!(181.18),
            currency: Currency::Usd,
            actual_date: requested,
        };
        store_price(&conn, "AAPL", StockMarket::Us, requested, &point).unwrap();

        let cached = cached_price(&conn, "AAPL", StockMarket::Us, requested)
            .unwrap()
            .unwrap();
        assert_eq!(cached.price, dec!(181.18));
    }

    #[test]
    fn test_same_currency_fx_is_identity() {
        let conn = db::init_in_memory().unwrap();
        let data = CachedMarketData::new(&conn);
        let point = data
            .fx_rate_on(Currency::Twd, Currency::Twd, date(2024, 1, 5))
            .unwrap()
            .unwrap();
        assert_eq!(point.rate, Decimal::ONE);
    }

    #[test]
    fn test_fx_cache_roundtrip() {
        let conn = db::init_in_memory().unwrap();
        let requested = date(2024, 1, 6);
        store_fx_rate(
            &conn,
            Currency::Usd,
            Currency::Twd,
            requested,
            &FxPoint {
                rate: dec!(31.04),
                actual_date: date(2024, 1, 5),
            },
        )
        .unwrap();

        let data = CachedMarketData::new(&conn);
        let point = data
            .fx_rate_on(Currency::Usd, Currency::Twd, requested)
            .unwrap()
            .unwrap();
        assert_eq!(point.rate, dec!(31.04));
        assert_eq!(point.actual_date, date(2024, 1, 5));
    }

    #[test]
    fn test_year_end_cache_states() {
        let conn = db::init_in_memory().unwrap();
        let key = market_key("2330", StockMarket::Tw);

        assert_eq!(
            cached_year_end_price(&conn, &key, "2023-12").unwrap(),
            YearEndLookup::Missing
        );

        store_year_end_price(&conn, &key, "2023-12", None).unwrap();
        assert_eq!(
            cached_year_end_price(&conn, &key, "2023-12").unwrap(),
            YearEndLookup::NotAvailable
        );

        store_year_end_price(&conn, &key, "2023-12", Some(dec!(593))).unwrap();
        assert_eq!(
            cached_year_end_price(&conn, &key, "2023-12").unwrap(),
            YearEndLookup::Price(dec!(593))
        );
    }
}
